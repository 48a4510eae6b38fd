//! Demonstration binary (spec §10.4): wires a UDP input, a no-op
//! intermediate pass-through, and a logging storage plugin into a real
//! `Pipeline` so the crate is runnable end-to-end. This is demo wiring, not
//! the tested core — concrete transport/storage plugins are a host
//! application's concern (spec §1), except for this one toy input kept in
//! the bin target the same way the teacher's own `main.rs` owned its
//! listener thread directly.

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, LevelFilter};
use structopt::StructOpt;

use ipfixcol_core::decode::{InputInfo, Transport};
use ipfixcol_core::ie::{BuiltinDictionary, ElementDictionary};
use ipfixcol_core::pipeline::PipelineBuilder;
use ipfixcol_core::plugin::{IntermediatePlugin, PacketEvent, PipelineMessage, StoragePlugin};
use ipfixcol_core::profile::{Profile, ProfileId, ProfileTree, ProfileType};
use ipfixcol_core::template::TemplateStore;

#[derive(Debug, StructOpt)]
struct Opts {
    /// Log level to use
    #[structopt(long = "log", default_value = "Info")]
    log_level: LevelFilter,

    /// IP:port for the UDP listener
    #[structopt(short = "-l", long = "--listener", default_value = "0.0.0.0:9999")]
    listener: SocketAddr,

    /// IP:port to serve /metrics on; omit to disable
    #[structopt(short = "-m", long = "--metrics")]
    metrics: Option<SocketAddr>,

    /// Optional config file (merged over APP_* environment variables)
    #[structopt(short = "-c", long = "--config", parse(from_os_str))]
    config: Option<PathBuf>,
}

/// A single bound UDP socket, read synchronously in the preprocessor's
/// polling loop (spec §6.1's `InputPlugin`). Good enough to prove the
/// pipeline runs end-to-end; a host wanting nonblocking or multi-socket
/// input supplies its own `InputPlugin`.
struct UdpInputPlugin {
    socket: UdpSocket,
    info: Arc<InputInfo>,
    buf: [u8; 65535],
}

impl UdpInputPlugin {
    fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(std::time::Duration::from_millis(200)))?;
        let info = Arc::new(InputInfo {
            transport: Transport::Udp,
            source_addr: addr.ip(),
            source_port: addr.port(),
            dest_addr: addr.ip(),
            dest_port: addr.port(),
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        });
        Ok(UdpInputPlugin { socket, info, buf: [0u8; 65535] })
    }
}

impl ipfixcol_core::plugin::InputPlugin for UdpInputPlugin {
    fn get_packet(&mut self) -> PacketEvent {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, from)) => PacketEvent::Packet { buffer: self.buf[..len].to_vec(), from },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => PacketEvent::Intr,
            Err(e) => PacketEvent::Error(e.to_string()),
        }
    }

    fn input_info(&self) -> Arc<InputInfo> {
        Arc::clone(&self.info)
    }

    fn close(&mut self) {}
}

/// Forwards every message unchanged; stands in for a host's real transforms.
struct PassThroughStage;

impl IntermediatePlugin for PassThroughStage {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process_message(&mut self, msg: PipelineMessage, pass: &mut dyn FnMut(PipelineMessage)) {
        pass(msg);
    }
}

/// Logs a one-line summary of every message it receives; stands in for a
/// host's real storage backend (file, database, message queue...).
struct LoggingStorage;

impl StoragePlugin for LoggingStorage {
    fn store_packet(&mut self, msg: &PipelineMessage, _templates: &TemplateStore) {
        info!(
            "odid={} source_crc={:#x} couples={} records={}",
            msg.header.observation_domain_id,
            msg.source_crc,
            msg.data_couples.len(),
            msg.records.len()
        );
    }
}

fn main() {
    let opts = Opts::from_args();
    ipfixcol_core::logger::init(opts.log_level);

    if let Some(path) = &opts.config {
        match ipfixcol_core::settings::Settings::init(Some(path.clone())) {
            Ok(_settings) => info!("loaded configuration from {}", path.display()),
            Err(e) => error!("failed to load configuration from {}: {}", path.display(), e),
        }
    }

    info!("starting collector");

    let templates = Arc::new(TemplateStore::new());
    let root = Profile {
        id: ProfileId(0),
        parent: None,
        name: "root".into(),
        directory: PathBuf::from("."),
        profile_type: ProfileType::Normal,
    };
    let profiles = Arc::new(ProfileTree::builder(root).build());
    let dict: Arc<dyn ElementDictionary> = Arc::new(BuiltinDictionary::new());

    let input = match UdpInputPlugin::bind(opts.listener) {
        Ok(input) => input,
        Err(e) => {
            error!("failed to bind UDP listener on {}: {}", opts.listener, e);
            return;
        }
    };

    let builder = PipelineBuilder::new(templates, profiles, dict)
        .add_input(Box::new(input))
        .add_intermediate(Box::new(PassThroughStage))
        .add_storage(Box::new(LoggingStorage));

    let drop_counters = builder.drop_counters();
    if let Some(metrics_addr) = opts.metrics {
        std::thread::Builder::new()
            .name("metrics".to_string())
            .spawn(move || ipfixcol_core::metrics::serve(metrics_addr, drop_counters))
            .expect("failed to spawn metrics thread");
    }

    let pipeline = builder.build();
    let _handle = pipeline.run();

    // Demo binary: no signal-handling crate is carried by this corpus's
    // dependency stack, so this just blocks the main thread forever; the
    // worker threads do the real work until the process is killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
