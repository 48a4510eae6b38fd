//! Message decoder (component C2, spec §4.2) and the in-memory `Message`
//! it produces (spec §3 "Message").
//!
//! `decode_message` only ever looks at bytes already shaped like an IPFIX
//! datagram (version 10, §6.6 wire layout); NetFlow v9 and v5 (and sFlow,
//! converted upstream to v5 shape) are normalized into that shape first by
//! `normalize::from_netflow_v9`/`normalize::from_netflow_v5`, matching
//! spec §4.2's "Normalization rules" and keeping the core parser blind to
//! the wire dialect, as `ipfix_message.c`'s `message_create_from_mem` is
//! blind to anything but IPFIX.

use std::convert::TryInto;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DecodeError, TemplateCollision};
use crate::template::{TemplateKey, TemplateRef, TemplateStore};

pub const IPFIX_VERSION: u16 = 10;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
pub const MIN_DATA_SET_ID: u16 = 256;

pub const HEADER_LEN: usize = 16;
pub const SET_HEADER_LEN: usize = 4;

/// Parsed IPFIX message header (spec §6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub sequence_number: u32,
    pub observation_domain_id: u32,
}

impl Header {
    pub fn read(buf: &[u8]) -> Result<Header, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        Ok(Header {
            version: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            length: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            export_time: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            sequence_number: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            observation_domain_id: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SetHeader {
    id: u16,
    length: u16,
}

impl SetHeader {
    fn read(buf: &[u8]) -> Option<SetHeader> {
        if buf.len() < SET_HEADER_LEN {
            return None;
        }
        Some(SetHeader {
            id: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            length: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
        })
    }
}

/// Transport the producing input plugin used (spec §6.1 `input_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Sctp,
    File,
}

/// Per-source connection metadata handed down from the input plugin (spec
/// §6.1 `input_info`) and consumed both by decode (UDP template lifetime
/// policy) and by profile/channel routing (`SrcAddr`/`DstAddr`/... operands,
/// spec §4.6).
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub transport: Transport,
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    /// UDP template refresh policy (spec §6.7); ignored for reliable
    /// transports where templates are sent exactly once.
    pub template_life_time: Option<Duration>,
    pub options_template_life_time: Option<Duration>,
    pub template_life_packet: Option<u32>,
    pub options_template_life_packet: Option<u32>,
}

impl InputInfo {
    /// Stable per-source discriminator distinguishing multiple exporters
    /// that share one observation domain id (spec §3 "Template key"). A
    /// real deployment derives this the way the original's UDP input does
    /// (hash of source address + port); this crate exposes the formula so
    /// a host input plugin can reuse it.
    pub fn source_crc(&self) -> u32 {
        crc32(&format!("{}:{}", self.source_addr, self.source_port))
    }
}

fn crc32(s: &str) -> u32 {
    // Simple CRC-32 (IEEE 802.3 polynomial), matching the original's
    // reliance on a standard CRC for input_info->sender (udp_input.c).
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in s.as_bytes() {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Lifecycle state of a source (spec §4.5 "State machine of a source").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    New,
    Opened,
    Closed,
}

/// A half-open byte range into a `Message`'s owned buffer — the Rust
/// equivalent of the original's raw pointers into the datagram (spec §9
/// "cyclic references" note): ranges, not borrows, so `Message` stays a
/// plain owned struct instead of a self-referential one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// One `(data_set, template)` couple (spec §3 "Data couple"). `template`
/// is `None` when no matching template had been admitted yet at decode
/// time (`UnknownTemplate`, spec §7) — the couple still travels the
/// pipeline (spec §4.5 "message with all template refs null still
/// traverses the pipeline").
#[derive(Clone)]
pub struct DataCouple {
    pub flowset_id: u16,
    pub range: ByteRange,
    pub template: Option<TemplateRef>,
}

/// One decoded record's position, flattened across all of a message's data
/// couples so profile/channel routing (spec §4.6) can address records
/// directly without re-deriving couple boundaries.
#[derive(Debug, Clone, Copy)]
pub struct RecordLocation {
    pub couple_index: usize,
    pub range: ByteRange,
}

/// Per-record routing/enrichment metadata (spec §3 "Per-data-record
/// metadata array"). Populated by the pipeline's preprocessor after
/// decode, not by `decode_message` itself (spec §4.5 keeps channel
/// resolution a preprocessor responsibility, §4.2 keeps decode blind to
/// profiles).
#[derive(Debug, Clone, Default)]
pub struct RecordMetadata {
    pub channels: Vec<crate::profile::ChannelId>,
}

/// An owned, decoded datagram (spec §3 "Message"). Travels the pipeline as
/// `Arc<Message>`; `Arc`'s strong count *is* the reference count spec §3/§8
/// describe — there is no separate manual increment/decrement path, the
/// same choice made for `TemplateRef` in `template.rs`.
#[derive(Clone)]
pub struct Message {
    pub header: Header,
    pub buffer: Vec<u8>,
    pub input_info: Arc<InputInfo>,
    pub source_crc: u32,
    pub source_status: SourceStatus,
    pub template_set_count: usize,
    pub options_template_set_count: usize,
    pub data_couples: Vec<DataCouple>,
    pub records: Vec<RecordLocation>,
    pub metadata: Vec<RecordMetadata>,
    pub collisions: Vec<TemplateCollision>,
}

impl Message {
    pub fn data_set_payload(&self, couple: &DataCouple) -> &[u8] {
        &self.buffer[couple.range.start..couple.range.end]
    }

    pub fn record_bytes(&self, loc: &RecordLocation) -> &[u8] {
        &self.buffer[loc.range.start..loc.range.end]
    }

    /// A message produced purely to let non-record-bearing stages fire
    /// (time-window rotation, heartbeats, spec §4.5) — header present,
    /// nothing decodable.
    pub fn is_empty_signal(&self) -> bool {
        self.data_couples.is_empty() && self.template_set_count == 0 && self.options_template_set_count == 0
    }
}

/// `decode(buffer, len, input_info, source_status) → Message` (spec §4.2).
/// `buffer` must already be in IPFIX wire shape (version 10); callers
/// holding NetFlow v9/v5 bytes normalize first (see `normalize`).
pub fn decode_message(
    buffer: Vec<u8>,
    input_info: Arc<InputInfo>,
    source_status: SourceStatus,
    store: &TemplateStore,
) -> Result<Message, DecodeError> {
    let header = Header::read(&buffer)?;
    if header.version != IPFIX_VERSION {
        return Err(DecodeError::UnknownVersion(header.version));
    }
    if header.length as usize > buffer.len() {
        return Err(DecodeError::DeclaredLengthExceedsBuffer {
            declared: header.length as usize,
            buffer: buffer.len(),
        });
    }

    let source_crc = input_info.source_crc();
    let odid = header.observation_domain_id;
    let msg_len = header.length as usize;

    let mut template_set_count = 0usize;
    let mut options_template_set_count = 0usize;
    let mut data_couples = Vec::new();
    let mut collisions = Vec::new();

    let mut offset = HEADER_LEN;
    while offset < msg_len {
        let set = SetHeader::read(&buffer[offset..]).ok_or(DecodeError::MalformedSet { length: 0 })?;
        if set.length < SET_HEADER_LEN as u16 || offset + set.length as usize > msg_len {
            return Err(DecodeError::MalformedSet {
                length: set.length as usize,
            });
        }

        let payload_start = offset + SET_HEADER_LEN;
        let payload_end = offset + set.length as usize;
        let payload = &buffer[payload_start..payload_end];

        match set.id {
            TEMPLATE_SET_ID => {
                template_set_count += 1;
                admit_templates(store, odid, source_crc, payload, false, &mut collisions)?;
            }
            OPTIONS_TEMPLATE_SET_ID => {
                options_template_set_count += 1;
                admit_templates(store, odid, source_crc, payload, true, &mut collisions)?;
            }
            id if id < MIN_DATA_SET_ID => {
                return Err(DecodeError::UnknownSetId(id));
            }
            id => {
                let key = TemplateKey::new(odid, source_crc, id);
                data_couples.push(DataCouple {
                    flowset_id: id,
                    range: ByteRange {
                        start: payload_start,
                        end: payload_end,
                    },
                    template: store.lookup(key),
                });
            }
        }

        offset = payload_end;
    }

    let mut records = Vec::new();
    for (idx, couple) in data_couples.iter().enumerate() {
        let Some(template) = &couple.template else {
            continue;
        };
        let payload = &buffer[couple.range.start..couple.range.end];
        let mut local_offset = 0usize;
        for view in crate::record::records_in_set(payload, template) {
            let len = view.bytes.len();
            records.push(RecordLocation {
                couple_index: idx,
                range: ByteRange {
                    start: couple.range.start + local_offset,
                    end: couple.range.start + local_offset + len,
                },
            });
            local_offset += len;
        }
    }
    let metadata = vec![RecordMetadata::default(); records.len()];

    Ok(Message {
        header,
        buffer,
        input_info,
        source_crc,
        source_status,
        template_set_count,
        options_template_set_count,
        data_couples,
        records,
        metadata,
        collisions,
    })
}

/// Walks every template/options-template record in one set's payload,
/// admitting it (or acting on the RFC 7011 §8.1 withdrawal signal:
/// `field_count == 0`) via the store (spec §4.2, §4.1).
fn admit_templates(
    store: &TemplateStore,
    odid: u32,
    source_crc: u32,
    payload: &[u8],
    is_options: bool,
    collisions: &mut Vec<TemplateCollision>,
) -> Result<(), DecodeError> {
    let mut offset = 0usize;
    while offset + 4 <= payload.len() {
        let template_id = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let field_count = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);

        if field_count == 0 {
            // All-templates or single-template withdrawal (RFC 7011 §8.1).
            let all_withdrawal_id = if is_options { OPTIONS_TEMPLATE_SET_ID } else { TEMPLATE_SET_ID };
            if template_id == all_withdrawal_id {
                store.withdraw_all_for_source_kind(odid, source_crc, is_options);
            } else {
                store.withdraw(TemplateKey::new(odid, source_crc, template_id));
            }
            offset += 4;
            continue;
        }

        match store.add(odid, source_crc, &payload[offset..], is_options) {
            Ok((_tpl, collision, consumed)) => {
                if let Some(c) = collision {
                    collisions.push(c);
                }
                offset += consumed;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl From<crate::error::TemplateError> for DecodeError {
    fn from(e: crate::error::TemplateError) -> Self {
        match e {
            crate::error::TemplateError::InvalidTemplate { implied, available, .. } => DecodeError::MalformedSet {
                length: implied.max(available),
            },
            crate::error::TemplateError::InvalidScope { .. } | crate::error::TemplateError::ReservedTemplateId(_) => {
                DecodeError::MalformedSet { length: 0 }
            }
        }
    }
}

/// NetFlow v9 → IPFIX and NetFlow v5 → IPFIX normalization (spec §4.2
/// "Normalization rules"). Both land on the exact wire shape
/// `decode_message` expects; sFlow is out of scope here (spec §1: external
/// converter emits v5-shaped bytes upstream of this crate).
pub mod normalize {
    use super::*;

    pub const NETFLOW_V9_VERSION: u16 = 9;
    pub const NETFLOW_V5_VERSION: u16 = 5;

    /// Rewrites a NetFlow v9 datagram's header into IPFIX header shape and
    /// remaps set ids `0 -> 2` (template) and `1 -> 3` (options template);
    /// data-set ids are untouched (spec §4.2). v9's header layout up to
    /// and including `source_id` is byte-compatible with IPFIX's
    /// `(version, length, export_time, sequence_number, source_id)` except
    /// for the version field itself and the set-id remap, so this is an
    /// in-place rewrite, no reallocation.
    pub fn from_netflow_v9(buf: &mut [u8]) -> Result<(), DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != NETFLOW_V9_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        buf[0..2].copy_from_slice(&IPFIX_VERSION.to_be_bytes());

        let declared_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if declared_len > buf.len() {
            return Err(DecodeError::DeclaredLengthExceedsBuffer {
                declared: declared_len,
                buffer: buf.len(),
            });
        }

        let mut offset = HEADER_LEN;
        while offset + SET_HEADER_LEN <= declared_len {
            let id = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            if len < SET_HEADER_LEN || offset + len > declared_len {
                return Err(DecodeError::MalformedSet { length: len });
            }
            let remapped = match id {
                0 => Some(TEMPLATE_SET_ID),
                1 => Some(OPTIONS_TEMPLATE_SET_ID),
                _ => None,
            };
            if let Some(new_id) = remapped {
                buf[offset..offset + 2].copy_from_slice(&new_id.to_be_bytes());
            }
            offset += len;
        }
        Ok(())
    }

    /// The 17-field synthetic IPFIX template NetFlow v5 is normalized
    /// against (spec §4.2 "Build one synthetic template with 17 IEs").
    /// Field order and widths mirror the v5 wire record exactly so the
    /// byte-for-byte conversion below needs no repacking beyond widening
    /// the two timestamp fields.
    pub const V5_SYNTHETIC_TEMPLATE_ID: u16 = 256;

    /// `(ie_id, length)` pairs, in wire order, for the synthetic template.
    pub const V5_SYNTHETIC_FIELDS: [(u16, u16); 17] = [
        (8, 4),   // sourceIPv4Address
        (12, 4),  // destinationIPv4Address
        (15, 4),  // ipNextHopIPv4Address
        (10, 2),  // ingressInterface
        (14, 2),  // egressInterface
        (2, 4),   // packetDeltaCount
        (1, 4),   // octetDeltaCount
        (152, 8), // flowStartMilliseconds
        (153, 8), // flowEndMilliseconds
        (7, 2),   // sourceTransportPort
        (11, 2),  // destinationTransportPort
        (210, 1), // paddingOctets
        (6, 1),   // tcpControlBits
        (4, 1),   // protocolIdentifier
        (5, 1),   // ipClassOfService
        (16, 2),  // bgpSourceAsNumber
        (17, 2),  // bgpDestinationAsNumber
    ];

    /// Builds the synthetic template's wire bytes (template header + field
    /// specifiers), for injection into the emitted IPFIX datagram.
    pub fn v5_synthetic_template_bytes() -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + V5_SYNTHETIC_FIELDS.len() * 4);
        out.extend_from_slice(&V5_SYNTHETIC_TEMPLATE_ID.to_be_bytes());
        out.extend_from_slice(&(V5_SYNTHETIC_FIELDS.len() as u16).to_be_bytes());
        for (id, len) in V5_SYNTHETIC_FIELDS {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
        }
        out
    }

    const V5_HEADER_LEN: usize = 24;
    const V5_RECORD_LEN: usize = 48;
    const V5_SYNTHETIC_RECORD_LEN: usize = 4 + 4 + 4 + 2 + 2 + 4 + 4 + 8 + 8 + 2 + 2 + 1 + 1 + 1 + 1 + 2 + 2; // 52: v5's 48 minus the 4 mask/pad bytes we drop, plus 8 from widening the two timestamps to 64 bits

    /// Per-source v5 conversion state: a rewritten sequence-number space
    /// (spec §4.2 "Rewrite sequence numbers into the IPFIX numbering
    /// space") and the counters that decide when to re-inject the
    /// synthetic template (spec §4.2 "periodically, controlled either by
    /// a packet counter or a wall-clock interval").
    pub struct V5State {
        ipfix_sequence_number: AtomicU64,
        packets_since_template: AtomicU64,
        last_template_unix_millis: AtomicU64,
        template_refresh_packets: u64,
        template_refresh_millis: u64,
    }

    impl V5State {
        pub fn new(template_refresh_packets: u64, template_refresh: Duration) -> Self {
            V5State {
                ipfix_sequence_number: AtomicU64::new(0),
                packets_since_template: AtomicU64::new(0),
                last_template_unix_millis: AtomicU64::new(0),
                template_refresh_packets,
                template_refresh_millis: template_refresh.as_millis() as u64,
            }
        }

        fn should_emit_template(&self, now_unix_millis: u64) -> bool {
            let packets = self.packets_since_template.load(Ordering::Relaxed);
            let last = self.last_template_unix_millis.load(Ordering::Relaxed);
            if last == 0 {
                return true; // first sight
            }
            if self.template_refresh_packets > 0 && packets >= self.template_refresh_packets {
                return true;
            }
            if self.template_refresh_millis > 0 && now_unix_millis.saturating_sub(last) >= self.template_refresh_millis {
                return true;
            }
            false
        }
    }

    /// Converts one NetFlow v5 datagram into an IPFIX-shaped buffer (spec
    /// §4.2, §8 scenario 1). `now_unix_millis` drives the wall-clock half
    /// of the template refresh policy.
    pub fn from_netflow_v5(buf: &[u8], state: &V5State, now_unix_millis: u64) -> Result<Vec<u8>, DecodeError> {
        if buf.len() < V5_HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: V5_HEADER_LEN,
                have: buf.len(),
            });
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != NETFLOW_V5_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let sys_uptime = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let unix_secs = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let unix_nsecs = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let raw_sequence = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        let _ = raw_sequence; // superseded by our own IPFIX-space counter

        let needed = V5_HEADER_LEN + count * V5_RECORD_LEN;
        if buf.len() < needed {
            return Err(DecodeError::Truncated { need: needed, have: buf.len() });
        }

        let emit_template = state.should_emit_template(now_unix_millis);
        let template_bytes = if emit_template { v5_synthetic_template_bytes() } else { Vec::new() };

        let data_len = 4 + count * V5_SYNTHETIC_RECORD_LEN;
        let template_set_len = if emit_template { 4 + template_bytes.len() } else { 0 };
        let total_len = HEADER_LEN + template_set_len + data_len;

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        out.extend_from_slice(&(total_len as u16).to_be_bytes());
        out.extend_from_slice(&unix_secs.to_be_bytes());
        let seq = state.ipfix_sequence_number.fetch_add(1, Ordering::Relaxed) as u32;
        out.extend_from_slice(&seq.to_be_bytes());
        // The observation-domain id is derived from engine_type/engine_id
        // (spec §9 Open Question: "masking with 0xF000" left as the wire
        // behavior, unconfirmed as intentional). We preserve the wire
        // behavior rather than guessing at intent: ODID = engine bytes.
        let engine_type = buf[20];
        let engine_id = buf[21];
        let odid = u32::from(engine_type) << 8 | u32::from(engine_id);
        out.extend_from_slice(&odid.to_be_bytes());

        if emit_template {
            out.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
            out.extend_from_slice(&(template_set_len as u16).to_be_bytes());
            out.extend_from_slice(&template_bytes);
        }

        out.extend_from_slice(&MIN_DATA_SET_ID.to_be_bytes());
        out.extend_from_slice(&(data_len as u16).to_be_bytes());

        for i in 0..count {
            let rec = &buf[V5_HEADER_LEN + i * V5_RECORD_LEN..V5_HEADER_LEN + (i + 1) * V5_RECORD_LEN];
            let first_switched = u32::from_be_bytes(rec[24..28].try_into().unwrap());
            let last_switched = u32::from_be_bytes(rec[28..32].try_into().unwrap());
            let flow_start_millis = sysuptime_to_absolute_millis(first_switched, sys_uptime, unix_secs, unix_nsecs);
            let flow_end_millis = sysuptime_to_absolute_millis(last_switched, sys_uptime, unix_secs, unix_nsecs);

            out.extend_from_slice(&rec[0..4]); // src addr
            out.extend_from_slice(&rec[4..8]); // dst addr
            out.extend_from_slice(&rec[8..12]); // next hop
            out.extend_from_slice(&rec[12..14]); // in-if
            out.extend_from_slice(&rec[14..16]); // out-if
            out.extend_from_slice(&rec[16..20]); // packets
            out.extend_from_slice(&rec[20..24]); // octets
            out.extend_from_slice(&flow_start_millis.to_be_bytes());
            out.extend_from_slice(&flow_end_millis.to_be_bytes());
            out.extend_from_slice(&rec[32..34]); // src port
            out.extend_from_slice(&rec[34..36]); // dst port
            out.push(0); // padding
            out.push(rec[37]); // tcp flags
            out.push(rec[38]); // protocol
            out.push(rec[39]); // tos
            out.extend_from_slice(&rec[40..42]); // src as
            out.extend_from_slice(&rec[42..44]); // dst as
        }

        state.packets_since_template.store(if emit_template { 0 } else { state.packets_since_template.load(Ordering::Relaxed) + count as u64 }, Ordering::Relaxed);
        if emit_template {
            state.last_template_unix_millis.store(now_unix_millis, Ordering::Relaxed);
        }

        Ok(out)
    }

    /// Converts a v5 record's sysUpTime-relative 32-bit millisecond
    /// timestamp into an absolute 64-bit Unix-epoch millisecond timestamp
    /// (spec §4.2, §8 scenario 1), using the same arithmetic as the
    /// original's `convert_packet_from_v5` (`current_time - sys_uptime +
    /// record_time`, here with the unix_secs/unix_nsecs header fields as
    /// "current time" and the record's relative offset already baked into
    /// `sys_uptime`'s reference frame).
    fn sysuptime_to_absolute_millis(record_millis: u32, sys_uptime_millis: u32, unix_secs: u32, unix_nsecs: u32) -> u64 {
        let export_millis = unix_secs as u64 * 1000 + unix_nsecs as u64 / 1_000_000;
        let offset = sys_uptime_millis as i64 - record_millis as i64;
        (export_millis as i64 - offset) as u64
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ie::IeRef;
        use crate::record::RecordView;

        #[test]
        fn templated_v5_decode_matches_scenario_1() {
            let mut header = Vec::new();
            header.extend_from_slice(&NETFLOW_V5_VERSION.to_be_bytes());
            header.extend_from_slice(&2u16.to_be_bytes()); // count
            header.extend_from_slice(&1_000_000u32.to_be_bytes()); // sysUpTime
            header.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // unix_secs
            header.extend_from_slice(&0u32.to_be_bytes()); // unix_nsecs
            header.extend_from_slice(&0u32.to_be_bytes()); // seq
            header.push(0); // engine_type
            header.push(0); // engine_id
            header.extend_from_slice(&0u16.to_be_bytes()); // sampling

            // Exercises all four of scenario 1's sysUpTime-relative
            // timestamps: two per record, across both records.
            let mut rec1 = vec![0u8; 48];
            rec1[24..28].copy_from_slice(&990_000u32.to_be_bytes());
            rec1[28..32].copy_from_slice(&999_000u32.to_be_bytes());

            let mut rec2 = vec![0u8; 48];
            rec2[24..28].copy_from_slice(&985_000u32.to_be_bytes());
            rec2[28..32].copy_from_slice(&1_000_000u32.to_be_bytes());

            let mut buf = header;
            buf.extend_from_slice(&rec1);
            buf.extend_from_slice(&rec2);

            let state = V5State::new(0, Duration::from_secs(60));
            let out = from_netflow_v5(&buf, &state, 1_700_000_000_500).unwrap();

            let hdr = Header::read(&out).unwrap();
            assert_eq!(hdr.version, IPFIX_VERSION);

            assert_eq!(
                sysuptime_to_absolute_millis(990_000, 1_000_000, 1_700_000_000, 0),
                1_699_999_990_000
            );
            assert_eq!(
                sysuptime_to_absolute_millis(999_000, 1_000_000, 1_700_000_000, 0),
                1_699_999_999_000
            );
            assert_eq!(
                sysuptime_to_absolute_millis(985_000, 1_000_000, 1_700_000_000, 0),
                1_699_999_985_000
            );
            assert_eq!(
                sysuptime_to_absolute_millis(1_000_000, 1_000_000, 1_700_000_000, 0),
                1_700_000_000_000
            );

            // Decode the buffer `from_netflow_v5` actually produced and check
            // the synthetic template was admitted with both scenario 1's
            // widened timestamp fields intact.
            let store = TemplateStore::new();
            let input_info = Arc::new(InputInfo {
                transport: Transport::Udp,
                source_addr: IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 9)),
                source_port: 2055,
                dest_addr: IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)),
                dest_port: 4739,
                template_life_time: None,
                options_template_life_time: None,
                template_life_packet: None,
                options_template_life_packet: None,
            });
            let msg = decode_message(out, input_info, SourceStatus::New, &store).unwrap();

            assert_eq!(msg.template_set_count, 1);
            assert_eq!(msg.data_couples.len(), 1);
            let template = msg.data_couples[0].template.as_ref().expect("synthetic template should be admitted").clone();
            assert_eq!(template.fields.len(), V5_SYNTHETIC_FIELDS.len());
            assert_eq!(msg.records.len(), 2);

            let flow_start = IeRef::standard(152); // flowStartMilliseconds
            let flow_end = IeRef::standard(153); // flowEndMilliseconds

            let expected = [(990_000u64, 1_699_999_990_000u64, 1_699_999_999_000u64), (985_000, 1_699_999_985_000, 1_700_000_000_000)];
            for (loc, (_, expected_start, expected_end)) in msg.records.iter().zip(expected) {
                let bytes = msg.record_bytes(loc);
                let view = RecordView { bytes, template: &template };
                let start = u64::from_be_bytes(view.field(flow_start).unwrap().try_into().unwrap());
                let end = u64::from_be_bytes(view.field(flow_end).unwrap().try_into().unwrap());
                assert_eq!(start, expected_start);
                assert_eq!(end, expected_end);
            }
        }

        #[test]
        fn rewrites_v9_header_and_set_ids() {
            let mut buf = Vec::new();
            buf.extend_from_slice(&NETFLOW_V9_VERSION.to_be_bytes());
            buf.extend_from_slice(&20u16.to_be_bytes()); // length
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&7u32.to_be_bytes()); // source id
            buf.extend_from_slice(&0u16.to_be_bytes()); // set id 0 -> template
            buf.extend_from_slice(&4u16.to_be_bytes()); // set length (header only)

            from_netflow_v9(&mut buf).unwrap();
            assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), IPFIX_VERSION);
            assert_eq!(u16::from_be_bytes([buf[16], buf[17]]), TEMPLATE_SET_ID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateStore;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    fn input_info() -> Arc<InputInfo> {
        Arc::new(InputInfo {
            transport: Transport::Udp,
            source_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: 2100,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: 4739,
            template_life_time: Some(Duration::from_secs(1800)),
            options_template_life_time: Some(Duration::from_secs(1800)),
            template_life_packet: None,
            options_template_life_packet: None,
        })
    }

    #[test]
    fn rejects_declared_length_under_header_length() {
        let store = TemplateStore::new();
        let buf = vec![0u8; 8];
        let err = decode_message(buf, input_info(), SourceStatus::New, &store).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn decodes_template_set_then_data_set() {
        let store = TemplateStore::new();

        let template_record = hex!("012c 0002 0008 0004 000c 0004");
        let mut buf = Vec::new();
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        let template_set_len = 4 + template_record.len();
        let data = hex!("0a000001 0a000002");
        let data_set_len = 4 + data.len();
        let total_len = HEADER_LEN + template_set_len + data_set_len;
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes()); // odid

        buf.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        buf.extend_from_slice(&(template_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&template_record);

        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&(data_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&data);

        let msg = decode_message(buf, input_info(), SourceStatus::New, &store).unwrap();
        assert_eq!(msg.template_set_count, 1);
        assert_eq!(msg.data_couples.len(), 1);
        assert!(msg.data_couples[0].template.is_some());
        assert_eq!(msg.records.len(), 1);
    }

    #[test]
    fn data_set_without_template_is_null_couple_not_error() {
        let store = TemplateStore::new();
        let data = hex!("0a000001 0a000002");
        let data_set_len = 4 + data.len();
        let total_len = HEADER_LEN + data_set_len;

        let mut buf = Vec::new();
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&(data_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&data);

        let msg = decode_message(buf, input_info(), SourceStatus::New, &store).unwrap();
        assert_eq!(msg.data_couples.len(), 1);
        assert!(msg.data_couples[0].template.is_none());
        assert!(msg.records.is_empty());
    }

    #[test]
    fn malformed_set_length_is_rejected() {
        let store = TemplateStore::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(HEADER_LEN as u16 + 4).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // zero-length set

        let err = decode_message(buf, input_info(), SourceStatus::New, &store).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedSet { .. }));
    }

    #[test]
    fn unknown_set_id_below_256_is_rejected() {
        let store = TemplateStore::new();
        let mut buf = Vec::new();
        let total_len = HEADER_LEN + 4;
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&42u16.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());

        let err = decode_message(buf, input_info(), SourceStatus::New, &store).unwrap_err();
        assert_eq!(err, DecodeError::UnknownSetId(42));
    }

    #[test]
    fn withdrawal_signal_clears_templates_for_source() {
        let store = TemplateStore::new();
        store.add(1, input_info().source_crc(), &hex!("012c 0002 0008 0004 000c 0004"), false).unwrap();

        let withdrawal_record = hex!("0002 0000"); // template_id=2 (all), field_count=0
        let mut buf = Vec::new();
        let set_len = 4 + withdrawal_record.len();
        let total_len = HEADER_LEN + set_len;
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        buf.extend_from_slice(&(set_len as u16).to_be_bytes());
        buf.extend_from_slice(&withdrawal_record);

        decode_message(buf, input_info(), SourceStatus::Opened, &store).unwrap();

        let key = TemplateKey::new(1, input_info().source_crc(), 300);
        assert!(store.lookup(key).is_none());
    }
}
