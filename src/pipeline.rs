//! Pipeline executor (component C5, spec §4.5, §5).
//!
//! Topology: one thread per input plugin feeds a shared preprocessor queue;
//! the preprocessor decodes (§4.2), admits templates (§4.1), builds
//! per-record metadata and resolves channels (§4.6), then hands the message
//! down a linear chain of intermediate stages before fanning it out to every
//! storage worker. Queues are `crossbeam_channel` bounded channels: unlike
//! `std::sync::mpsc`, `crossbeam_channel::bounded` gives the blocking
//! producer-side backpressure spec §5 asks for, matching the original's
//! fixed-size POSIX ring buffers more directly than an unbounded channel
//! would.
//!
//! Grounded in the teacher's `main.rs` threading style (`thread::Builder`
//! with named threads) generalized from "one listener + one exporter" into
//! an arbitrary-length stage chain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::decode::{decode_message, Message, SourceStatus};
use crate::ie::ElementDictionary;
use crate::metrics::DropCounters;
use crate::plugin::{InputPlugin, IntermediatePlugin, PacketEvent, PipelineMessage, StoragePlugin};
use crate::profile::ProfileTree;
use crate::template::TemplateStore;

/// Sentinel/data sum type traveling every queue (spec §4.5, §9 "PipelineEvent
/// sum type for sentinels" redesign note — a single enum rather than two
/// parallel "is this a real message" out-of-band flags).
#[derive(Clone)]
pub enum PipelineEvent {
    Data(PipelineMessage),
    /// Emitted by the preprocessor when a source disconnects; every stage
    /// forwards it unchanged after flushing any per-source state of its own.
    SourceClosed { observation_domain_id: u32, source_crc: u32 },
    /// Propagated on stop; a stage forwards it after draining local state,
    /// then exits its run loop.
    Shutdown,
}

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct InboundItem {
    plugin_index: usize,
    event: PacketEvent,
}

/// Per-source bookkeeping the preprocessor keeps to drive the state machine
/// in spec §4.5 ("State machine of a source").
struct SourceState {
    status: SourceStatus,
    odids_seen: HashSet<u32>,
    /// Lazily created on the first NetFlow v5 datagram from this source
    /// (spec §4.2 "Normalization rules"); `None` for sources that only ever
    /// speak IPFIX or v9.
    v5_state: Option<crate::decode::normalize::V5State>,
}

impl SourceState {
    fn new() -> Self {
        SourceState {
            status: SourceStatus::New,
            odids_seen: HashSet::new(),
            v5_state: None,
        }
    }
}

/// Normalizes one inbound datagram into IPFIX wire shape (spec §4.2): bytes
/// already at version 10 pass through untouched; v9 is rewritten in place;
/// v5 is converted via the source's running `V5State` (template refresh
/// policy keyed off the same `template_life_time`/`template_life_packet`
/// the UDP input negotiated, spec §6.7).
fn normalize_to_ipfix(buffer: Vec<u8>, state: &mut SourceState, input_info: &crate::decode::InputInfo) -> Result<Vec<u8>, crate::error::DecodeError> {
    use crate::decode::normalize::{from_netflow_v5, from_netflow_v9, NETFLOW_V5_VERSION, NETFLOW_V9_VERSION};
    use crate::decode::IPFIX_VERSION;

    let version = buffer.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    match version {
        Some(v) if v == IPFIX_VERSION => Ok(buffer),
        Some(v) if v == NETFLOW_V9_VERSION => {
            let mut buf = buffer;
            from_netflow_v9(&mut buf)?;
            Ok(buf)
        }
        Some(v) if v == NETFLOW_V5_VERSION => {
            let v5_state = state.v5_state.get_or_insert_with(|| {
                crate::decode::normalize::V5State::new(
                    input_info.template_life_packet.unwrap_or(0) as u64,
                    input_info.template_life_time.unwrap_or(Duration::from_secs(0)),
                )
            });
            from_netflow_v5(&buffer, v5_state, crate::template::now_unix_millis())
        }
        Some(other) => Err(crate::error::DecodeError::UnknownVersion(other)),
        None => Err(crate::error::DecodeError::Truncated { need: 2, have: buffer.len() }),
    }
}

/// A statically built chain (spec §4.5 "A static directed chain built from
/// configuration at startup"). Built via [`PipelineBuilder`], then consumed
/// by [`Pipeline::run`], which spawns every worker thread and returns a
/// handle for shutdown.
pub struct Pipeline {
    inputs: Vec<Box<dyn InputPlugin>>,
    stages: Vec<Box<dyn IntermediatePlugin>>,
    storages: Vec<Box<dyn StoragePlugin>>,
    templates: Arc<TemplateStore>,
    profiles: Arc<ProfileTree>,
    dict: Arc<dyn ElementDictionary>,
    drops: Arc<DropCounters>,
    queue_capacity: usize,
    shutdown_grace: Duration,
}

pub struct PipelineBuilder {
    inputs: Vec<Box<dyn InputPlugin>>,
    stages: Vec<Box<dyn IntermediatePlugin>>,
    storages: Vec<Box<dyn StoragePlugin>>,
    templates: Arc<TemplateStore>,
    profiles: Arc<ProfileTree>,
    dict: Arc<dyn ElementDictionary>,
    drops: Arc<DropCounters>,
    queue_capacity: usize,
    shutdown_grace: Duration,
}

impl PipelineBuilder {
    pub fn new(templates: Arc<TemplateStore>, profiles: Arc<ProfileTree>, dict: Arc<dyn ElementDictionary>) -> Self {
        PipelineBuilder {
            inputs: Vec::new(),
            stages: Vec::new(),
            storages: Vec::new(),
            templates,
            profiles,
            dict,
            drops: Arc::new(DropCounters::new()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn add_input(mut self, input: Box<dyn InputPlugin>) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn add_intermediate(mut self, stage: Box<dyn IntermediatePlugin>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_storage(mut self, storage: Box<dyn StoragePlugin>) -> Self {
        self.storages.push(storage);
        self
    }

    pub fn drop_counters(&self) -> Arc<DropCounters> {
        Arc::clone(&self.drops)
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            inputs: self.inputs,
            stages: self.stages,
            storages: self.storages,
            templates: self.templates,
            profiles: self.profiles,
            dict: self.dict,
            drops: self.drops,
            queue_capacity: self.queue_capacity,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Handle returned by [`Pipeline::run`]; `shutdown` injects the shutdown
/// sentinel and waits (bounded by the configured grace period) for every
/// stage thread to drain and exit.
pub struct PipelineHandle {
    shutdown_tx: Sender<PipelineEvent>,
    finished: Receiver<()>,
    stage_count: usize,
    grace: Duration,
    threads: Vec<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Injects the shutdown sentinel at the head of the chain and waits for
    /// every stage to report done, up to the configured grace period. A
    /// stage thread that hasn't finished by then is left running and its
    /// `JoinHandle` is leaked (spec §5 "abandoned, leaked intentionally") —
    /// Rust has no native bounded `join`, so this is implemented with a
    /// second "stage finished" channel rather than a timed join.
    pub fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(PipelineEvent::Shutdown);
        let deadline = std::time::Instant::now() + self.grace;
        let mut finished = 0usize;
        while finished < self.stage_count {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.finished.recv_timeout(remaining) {
                Ok(()) => finished += 1,
                Err(_) => break,
            }
        }
        if finished >= self.stage_count {
            for t in self.threads.drain(..) {
                let _ = t.join();
            }
        } else {
            // Grace period elapsed with stages still draining; leak their
            // handles rather than block shutdown indefinitely.
            for t in self.threads.drain(..) {
                std::mem::forget(t);
            }
        }
    }
}

enum Downstream {
    Stage(Sender<PipelineEvent>),
    FanOut(Vec<Sender<PipelineEvent>>),
}

impl Downstream {
    fn send(&self, event: PipelineEvent) {
        match self {
            Downstream::Stage(tx) => {
                let _ = tx.send(event);
            }
            Downstream::FanOut(txs) => {
                for tx in txs {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }
}

impl Pipeline {
    pub fn run(self) -> PipelineHandle {
        let Pipeline {
            inputs,
            stages,
            storages,
            templates,
            profiles,
            dict,
            drops,
            queue_capacity,
            shutdown_grace,
        } = self;

        let mut threads = Vec::new();
        // Only storages, stages, and the preprocessor ever signal `finished_tx`;
        // input workers (spawned below) don't, so this must be captured
        // separately from `threads.len()`.
        let stage_count = stages.len() + storages.len() + 1;
        let (finished_tx, finished_rx) = bounded::<()>(stage_count);

        // Storage fan-out: one bounded queue per storage worker.
        let mut storage_senders = Vec::with_capacity(storages.len());
        for (idx, mut storage) in storages.into_iter().enumerate() {
            let (tx, rx) = bounded::<PipelineEvent>(queue_capacity);
            storage_senders.push(tx);
            let finished_tx = finished_tx.clone();
            let templates = Arc::clone(&templates);
            threads.push(
                thread::Builder::new()
                    .name(format!("storage-{}", idx))
                    .spawn(move || {
                        run_storage_worker(rx, storage.as_mut(), &templates);
                        let _ = finished_tx.send(());
                    })
                    .expect("failed to spawn storage worker thread"),
            );
        }
        let fan_out = Downstream::FanOut(storage_senders);

        // Intermediate stage chain, built tail-first so each stage's sender
        // is already known when the previous one is spawned.
        let mut downstream = fan_out;
        let mut head_tx: Option<Sender<PipelineEvent>> = None;
        let mut stage_senders_in_order = Vec::with_capacity(stages.len());
        for mut stage in stages.into_iter().rev() {
            let (tx, rx) = bounded::<PipelineEvent>(queue_capacity);
            stage_senders_in_order.push(tx.clone());
            let next = std::mem::replace(&mut downstream, Downstream::Stage(tx.clone()));
            let finished_tx = finished_tx.clone();
            let drops = Arc::clone(&drops);
            threads.push(
                thread::Builder::new()
                    .name(format!("stage-{}", stage.name().to_string()))
                    .spawn(move || {
                        run_stage(rx, stage.as_mut(), &next, &drops);
                        let _ = finished_tx.send(());
                    })
                    .expect("failed to spawn intermediate stage thread"),
            );
            head_tx = Some(tx);
        }
        stage_senders_in_order.reverse();

        // Preprocessor: decodes raw input and feeds the chain head (or the
        // storage fan-out directly when there are no intermediate stages).
        let preprocessor_downstream = match head_tx {
            Some(tx) => Downstream::Stage(tx),
            None => downstream,
        };
        let preprocessor_shutdown_sentinel_tx; // sender the caller uses to inject Shutdown

        let (inbound_tx, inbound_rx) = bounded::<InboundItem>(queue_capacity);
        let input_infos: Vec<_> = inputs.iter().map(|i| i.input_info()).collect();

        let running = Arc::new(AtomicBool::new(true));
        for (idx, mut input) in inputs.into_iter().enumerate() {
            let inbound_tx = inbound_tx.clone();
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name(format!("input-{}", idx))
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            let event = input.get_packet();
                            let closed = matches!(event, PacketEvent::Closed);
                            if inbound_tx.send(InboundItem { plugin_index: idx, event }).is_err() {
                                break;
                            }
                            if closed {
                                break;
                            }
                        }
                        input.close();
                    })
                    .expect("failed to spawn input worker thread"),
            );
        }
        drop(inbound_tx);

        // The preprocessor listens on two channels: raw inbound packets, and
        // a dedicated shutdown channel the caller injects into directly
        // (injecting Shutdown into `inbound_tx` would require a PacketEvent
        // variant for it, which would leak pipeline concerns into the
        // input-plugin contract).
        let (shutdown_tx, shutdown_rx) = bounded::<PipelineEvent>(1);
        preprocessor_shutdown_sentinel_tx = shutdown_tx.clone();
        {
            let finished_tx = finished_tx.clone();
            let templates = Arc::clone(&templates);
            let profiles = Arc::clone(&profiles);
            let dict = Arc::clone(&dict);
            let drops = Arc::clone(&drops);
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name("preprocessor".to_string())
                    .spawn(move || {
                        run_preprocessor(inbound_rx, shutdown_rx, &preprocessor_downstream, &input_infos, &templates, &profiles, dict.as_ref(), &drops, &running);
                        let _ = finished_tx.send(());
                    })
                    .expect("failed to spawn preprocessor thread"),
            );
        }

        PipelineHandle {
            shutdown_tx: preprocessor_shutdown_sentinel_tx,
            finished: finished_rx,
            stage_count,
            grace: shutdown_grace,
            threads,
        }
    }
}

fn run_preprocessor(
    inbound: Receiver<InboundItem>,
    shutdown: Receiver<PipelineEvent>,
    downstream: &Downstream,
    input_infos: &[Arc<crate::decode::InputInfo>],
    templates: &TemplateStore,
    profiles: &ProfileTree,
    dict: &dyn ElementDictionary,
    drops: &DropCounters,
    running: &AtomicBool,
) {
    let mut sources: HashMap<usize, SourceState> = HashMap::new();

    loop {
        crossbeam_channel::select! {
            recv(shutdown) -> msg => {
                if msg.is_ok() {
                    downstream.send(PipelineEvent::Shutdown);
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
            recv(inbound) -> item => {
                match item {
                    Ok(InboundItem { plugin_index, event }) => {
                        handle_inbound_event(plugin_index, event, &mut sources, downstream, input_infos, templates, profiles, dict, drops);
                    }
                    Err(_) => {
                        // Every input worker has exited on its own (no explicit
                        // shutdown injected yet); forward the sentinel anyway so
                        // every downstream stage still drains and closes.
                        downstream.send(PipelineEvent::Shutdown);
                        running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
}

fn handle_inbound_event(
    plugin_index: usize,
    event: PacketEvent,
    sources: &mut HashMap<usize, SourceState>,
    downstream: &Downstream,
    input_infos: &[Arc<crate::decode::InputInfo>],
    templates: &TemplateStore,
    profiles: &ProfileTree,
    dict: &dyn ElementDictionary,
    drops: &DropCounters,
) {
    let Some(input_info) = input_infos.get(plugin_index).cloned() else { return };
    let state = sources.entry(plugin_index).or_insert_with(SourceState::new);

    match event {
        PacketEvent::Packet { buffer, .. } => {
            let status = state.status;
            let decoded = normalize_to_ipfix(buffer, state, &input_info).and_then(|buf| decode_message(buf, Arc::clone(&input_info), status, templates));
            match decoded {
                Ok(mut msg) => {
                    state.status = SourceStatus::Opened;
                    state.odids_seen.insert(msg.header.observation_domain_id);
                    crate::profile::route(&mut msg, profiles, dict);
                    downstream.send(PipelineEvent::Data(Arc::new(msg)));
                }
                Err(e) => {
                    drops.record_drop("preprocessor", "decode_error");
                    log::warn!("dropping undecodable datagram from input {}: {}", plugin_index, e);
                }
            }
        }
        PacketEvent::Error(msg) => {
            drops.record_drop("preprocessor", "input_error");
            log::error!("input {} reported an error: {}", plugin_index, msg);
        }
        PacketEvent::Intr => {}
        PacketEvent::Closed => {
            state.status = SourceStatus::Closed;
            for odid in state.odids_seen.drain() {
                templates.withdraw_all_for_source(odid, input_info.source_crc());
                downstream.send(PipelineEvent::SourceClosed {
                    observation_domain_id: odid,
                    source_crc: input_info.source_crc(),
                });
            }
        }
    }
}

fn run_stage(rx: Receiver<PipelineEvent>, stage: &mut dyn IntermediatePlugin, downstream: &Downstream, drops: &DropCounters) {
    for event in rx.iter() {
        match event {
            PipelineEvent::Data(msg) => {
                let mut forwarded = Vec::new();
                let stage_name = stage.name().to_string();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    stage.process_message(msg, &mut |m| forwarded.push(m));
                }));
                if let Err(payload) = result {
                    let err = crate::error::PipelineError::StageFailure {
                        stage: stage_name.clone(),
                        reason: panic_message(&payload),
                    };
                    drops.record_drop(&stage_name, "stage_panic");
                    log::error!("{}, dropping the message", err);
                    continue;
                }
                for m in forwarded {
                    downstream.send(PipelineEvent::Data(m));
                }
            }
            PipelineEvent::SourceClosed { .. } => downstream.send(event),
            PipelineEvent::Shutdown => {
                stage.close();
                downstream.send(PipelineEvent::Shutdown);
                break;
            }
        }
    }
}

/// Extracts a human-readable message from a caught panic payload, the way
/// the standard panic hook does for `&str`/`String` payloads.
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_storage_worker(rx: Receiver<PipelineEvent>, storage: &mut dyn StoragePlugin, templates: &TemplateStore) {
    for event in rx.iter() {
        match event {
            PipelineEvent::Data(msg) => storage.store_packet(&msg, templates),
            PipelineEvent::SourceClosed { .. } => storage.store_now(),
            PipelineEvent::Shutdown => {
                storage.store_now();
                storage.close();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::BuiltinDictionary;
    use crate::profile::{Profile, ProfileId, ProfileType};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct OnceInput {
        info: Arc<crate::decode::InputInfo>,
        sent: bool,
    }

    impl InputPlugin for OnceInput {
        fn get_packet(&mut self) -> PacketEvent {
            if !self.sent {
                self.sent = true;
                PacketEvent::Packet {
                    buffer: sample_datagram(),
                    from: std::net::SocketAddr::new(self.info.source_addr, self.info.source_port),
                }
            } else {
                PacketEvent::Closed
            }
        }

        fn input_info(&self) -> Arc<crate::decode::InputInfo> {
            Arc::clone(&self.info)
        }

        fn close(&mut self) {}
    }

    fn sample_datagram() -> Vec<u8> {
        use crate::decode::*;
        use hex_literal::hex;
        let template_record = hex!("012c 0001 0007 0002");
        let data = 443u16.to_be_bytes();
        let template_set_len = 4 + template_record.len();
        let data_set_len = 4 + data.len();
        let total_len = HEADER_LEN + template_set_len + data_set_len;

        let mut buf = Vec::new();
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        buf.extend_from_slice(&(template_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&template_record);
        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&(data_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&data);
        buf
    }

    struct CountingStorage {
        count: Arc<AtomicUsize>,
    }

    impl StoragePlugin for CountingStorage {
        fn store_packet(&mut self, _msg: &PipelineMessage, _templates: &TemplateStore) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingStage {
        seen: Arc<Mutex<Vec<()>>>,
    }

    impl IntermediatePlugin for RecordingStage {
        fn name(&self) -> &str {
            "recording"
        }

        fn process_message(&mut self, msg: PipelineMessage, pass: &mut dyn FnMut(PipelineMessage)) {
            self.seen.lock().unwrap().push(());
            pass(msg);
        }
    }

    #[test]
    fn one_datagram_reaches_every_storage_worker() {
        let templates = Arc::new(TemplateStore::new());
        let root = Profile {
            id: ProfileId(0),
            parent: None,
            name: "root".into(),
            directory: std::path::PathBuf::from("/data"),
            profile_type: ProfileType::Normal,
        };
        let profiles = Arc::new(ProfileTree::builder(root).build());
        let dict: Arc<dyn ElementDictionary> = Arc::new(BuiltinDictionary::new());

        let input_info = Arc::new(crate::decode::InputInfo {
            transport: crate::decode::Transport::Udp,
            source_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: 2100,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: 4739,
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let pipeline = PipelineBuilder::new(templates, profiles, dict)
            .add_input(Box::new(OnceInput { info: input_info, sent: false }))
            .add_intermediate(Box::new(RecordingStage { seen: Arc::clone(&seen) }))
            .add_storage(Box::new(CountingStorage { count: Arc::clone(&count_a) }))
            .add_storage(Box::new(CountingStorage { count: Arc::clone(&count_b) }))
            .build();

        let handle = pipeline.run();
        std::thread::sleep(Duration::from_millis(200));
        handle.shutdown();

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    fn demo_input_info() -> crate::decode::InputInfo {
        crate::decode::InputInfo {
            transport: crate::decode::Transport::Udp,
            source_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: 2100,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: 4739,
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        }
    }

    #[test]
    fn normalize_dispatches_ipfix_bytes_untouched() {
        let mut state = SourceState::new();
        let info = demo_input_info();
        let buf = vec![0u8, 10, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let out = normalize_to_ipfix(buf.clone(), &mut state, &info).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn normalize_dispatches_v9_through_rewrite() {
        let mut state = SourceState::new();
        let info = demo_input_info();
        let mut buf = Vec::new();
        buf.extend_from_slice(&9u16.to_be_bytes());
        buf.extend_from_slice(&20u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());

        let out = normalize_to_ipfix(buf, &mut state, &info).unwrap();
        assert_eq!(u16::from_be_bytes([out[0], out[1]]), crate::decode::IPFIX_VERSION);
        assert_eq!(u16::from_be_bytes([out[16], out[17]]), crate::decode::TEMPLATE_SET_ID);
    }

    #[test]
    fn normalize_dispatches_v5_and_reuses_state_across_calls() {
        let mut state = SourceState::new();
        let info = demo_input_info();
        let mut buf = vec![0u8; 24 + 48];
        buf[0..2].copy_from_slice(&5u16.to_be_bytes());
        buf[2..4].copy_from_slice(&1u16.to_be_bytes());

        let first = normalize_to_ipfix(buf.clone(), &mut state, &info).unwrap();
        assert!(state.v5_state.is_some());
        let second = normalize_to_ipfix(buf, &mut state, &info).unwrap();
        assert_eq!(u16::from_be_bytes([first[0], first[1]]), crate::decode::IPFIX_VERSION);
        assert_eq!(u16::from_be_bytes([second[0], second[1]]), crate::decode::IPFIX_VERSION);
    }

    #[test]
    fn normalize_rejects_unknown_version() {
        let mut state = SourceState::new();
        let info = demo_input_info();
        let buf = vec![0u8, 7, 0, 0];
        let err = normalize_to_ipfix(buf, &mut state, &info).unwrap_err();
        assert!(matches!(err, crate::error::DecodeError::UnknownVersion(7)));
    }
}
