//! Original exporter IP address enrichment (spec §11, supplemented from the
//! original's `intermediate/odip/odip.c`, there named "joinflows_ip.c").
//!
//! Adds the source address a datagram actually arrived from as a field on
//! every data record that doesn't already carry one, so that downstream
//! consumers merging data from several exporters behind one collector can
//! still tell them apart. IPv4 sources get a 4-byte field (private element
//! id 403); IPv6 sources get a 16-byte field (id 404), matching the
//! original's `ODIP4_FIELD`/`ODIP6_FIELD`.
//!
//! Every affected template gains one field, so this stage needs its own
//! template ids distinct from the exporter's — it keeps a private
//! `TemplateStore` for the "original plus odip field" variants it
//! synthesizes, keyed the same way the main decode store is (spec §3
//! "Template key"), just under a fixed source discriminator of its own
//! rather than the exporter's.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use log::warn;

use crate::decode::{ByteRange, DataCouple, SourceStatus, IPFIX_VERSION};
use crate::ie::IeRef;
use crate::plugin::{into_owned_message, IntermediatePlugin, PipelineMessage};
use crate::record::record_length;
use crate::template::{TemplateField, TemplateRef, TemplateStore};

pub const ODIP4_FIELD: IeRef = IeRef::standard(403);
pub const ODIP6_FIELD: IeRef = IeRef::standard(404);

/// Arbitrary, fixed discriminator for the synthetic templates this stage
/// registers in its private store — never an exporter's real `source_crc`,
/// so it can never collide with one (spec §3 "Template key" is a pure
/// lookup key, not a network identity, so a made-up constant is valid here).
const OWN_SOURCE_CRC: u32 = 0x0D1F_0001;

fn serialize_fields(fields: &[TemplateField]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.len() * 4);
    for f in fields {
        let mut raw_id = f.ie.id;
        if f.ie.enterprise != 0 {
            raw_id |= 0x8000;
        }
        out.extend_from_slice(&raw_id.to_be_bytes());
        out.extend_from_slice(&f.length.to_be_bytes());
        if f.ie.enterprise != 0 {
            out.extend_from_slice(&f.ie.enterprise.to_be_bytes());
        }
    }
    out
}

fn build_template_record(template_id: u16, fields: &[TemplateField], scope_field_count: Option<u16>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&template_id.to_be_bytes());
    buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    if let Some(scope) = scope_field_count {
        buf.extend_from_slice(&scope.to_be_bytes());
    }
    buf.extend_from_slice(&serialize_fields(fields));
    buf
}

/// Original exporter IP enrichment intermediate stage (spec §11).
pub struct Odip {
    store: TemplateStore,
    cache: DashMap<(u32, u16, bool), TemplateRef>,
}

impl Odip {
    pub fn new() -> Self {
        Odip {
            store: TemplateStore::new(),
            cache: DashMap::new(),
        }
    }

    /// Returns the "original fields plus odip field" variant of `template`
    /// for this `odid`, synthesizing and registering it on first use and
    /// reusing the same template id on every later call (spec §11 "one new
    /// template id per original template, stable for the life of the
    /// exporter's templates").
    fn odip_template(&self, odid: u32, original: &TemplateRef, odip_field: IeRef, odip_len: u16) -> Option<TemplateRef> {
        let is_options = original.scope_field_count().is_some();
        let cache_key = (odid, original.template_id, is_options);
        if let Some(existing) = self.cache.get(&cache_key) {
            return Some(Arc::clone(&existing));
        }

        let mut fields = original.fields.clone();
        fields.push(TemplateField { ie: odip_field, length: odip_len });

        let Some(new_id) = self.store.allocate_id() else {
            warn!("odip template id space exhausted, leaving template {} unmodified", original.template_id);
            return None;
        };
        let record = build_template_record(new_id, &fields, original.scope_field_count());
        let new_template = match self.store.add(odid, OWN_SOURCE_CRC, &record, is_options) {
            Ok((tpl, _collision, _consumed)) => tpl,
            Err(e) => {
                warn!("failed to register odip variant of template {}: {}", original.template_id, e);
                return None;
            }
        };

        self.cache.insert(cache_key, Arc::clone(&new_template));
        Some(new_template)
    }

    fn odip_field_for(&self, addr: IpAddr) -> (IeRef, u16, Vec<u8>) {
        match addr {
            IpAddr::V4(v4) => (ODIP4_FIELD, 4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (ODIP6_FIELD, 16, v6.octets().to_vec()),
        }
    }
}

impl Default for Odip {
    fn default() -> Self {
        Self::new()
    }
}

impl IntermediatePlugin for Odip {
    fn name(&self) -> &str {
        "odip"
    }

    fn process_message(&mut self, msg: PipelineMessage, pass: &mut dyn FnMut(PipelineMessage)) {
        if msg.source_status == SourceStatus::Closed || msg.header.version != IPFIX_VERSION {
            pass(msg);
            return;
        }

        let (odip_field, odip_len, addr_bytes) = self.odip_field_for(msg.input_info.source_addr);
        let odid = msg.header.observation_domain_id;

        // Nothing to do if every couple's template already carries the field.
        let needs_rewrite = msg
            .data_couples
            .iter()
            .any(|c| c.template.as_ref().map_or(false, |t| t.contains_field(odip_field).is_none()));
        if !needs_rewrite {
            pass(msg);
            return;
        }

        let mut owned = into_owned_message(msg);
        let old_couples = std::mem::take(&mut owned.data_couples);
        let old_buffer = std::mem::take(&mut owned.buffer);

        let mut new_buffer = Vec::with_capacity(old_buffer.len() + old_couples.len() * (4 + odip_len as usize * 16));
        new_buffer.extend_from_slice(&old_buffer[0..crate::decode::HEADER_LEN]);

        let mut new_couples = Vec::with_capacity(old_couples.len());
        for couple in old_couples {
            // `couple.range` spans the data-set payload only; decode strips
            // the 4-byte set header before storing it (spec §3 "Data
            // couple"), so every branch below must re-emit that header
            // itself rather than copying it from `old_buffer`.
            let payload = &old_buffer[couple.range.start..couple.range.end];

            let Some(template) = couple.template.clone() else {
                new_buffer.extend_from_slice(&couple.flowset_id.to_be_bytes());
                new_buffer.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
                let payload_start = new_buffer.len();
                new_buffer.extend_from_slice(payload);
                new_couples.push(DataCouple {
                    flowset_id: couple.flowset_id,
                    range: ByteRange { start: payload_start, end: new_buffer.len() },
                    template: None,
                });
                continue;
            };

            let new_template = if template.contains_field(odip_field).is_some() {
                None
            } else {
                self.odip_template(odid, &template, odip_field, odip_len)
            };

            let Some(new_template) = new_template else {
                new_buffer.extend_from_slice(&couple.flowset_id.to_be_bytes());
                new_buffer.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
                let payload_start = new_buffer.len();
                new_buffer.extend_from_slice(payload);
                new_couples.push(DataCouple {
                    flowset_id: couple.flowset_id,
                    range: ByteRange { start: payload_start, end: new_buffer.len() },
                    template: Some(template),
                });
                continue;
            };

            new_buffer.extend_from_slice(&new_template.template_id.to_be_bytes());
            let set_len_pos = new_buffer.len();
            new_buffer.extend_from_slice(&0u16.to_be_bytes()); // length, patched below
            let payload_start = new_buffer.len();

            let mut offset = 0usize;
            while offset < payload.len() {
                let rest = &payload[offset..];
                let len = match record_length(rest, &template) {
                    Some(l) if l > 0 => l,
                    _ => break,
                };
                new_buffer.extend_from_slice(&rest[..len]);
                new_buffer.extend_from_slice(&addr_bytes);
                offset += len;
            }
            let set_len = (new_buffer.len() - (set_len_pos - 2)) as u16;
            new_buffer[set_len_pos..set_len_pos + 2].copy_from_slice(&set_len.to_be_bytes());
            new_couples.push(DataCouple {
                flowset_id: new_template.template_id,
                range: ByteRange { start: payload_start, end: new_buffer.len() },
                template: Some(new_template),
            });
        }

        let total_len = new_buffer.len() as u16;
        new_buffer[2..4].copy_from_slice(&total_len.to_be_bytes());

        owned.records = new_couples
            .iter()
            .enumerate()
            .flat_map(|(idx, couple)| {
                let Some(template) = &couple.template else {
                    return Vec::new();
                };
                let set_bytes = &new_buffer[couple.range.start..couple.range.end];
                let mut locs = Vec::new();
                let mut offset = 0usize;
                while offset < set_bytes.len() {
                    let rest = &set_bytes[offset..];
                    let len = match record_length(rest, template) {
                        Some(l) if l > 0 => l,
                        _ => break,
                    };
                    locs.push(crate::decode::RecordLocation {
                        couple_index: idx,
                        range: ByteRange {
                            start: couple.range.start + offset,
                            end: couple.range.start + offset + len,
                        },
                    });
                    offset += len;
                }
                locs
            })
            .collect();

        if owned.records.len() != owned.metadata.len() {
            warn!("odip rewrite changed record count ({} -> {}); truncating metadata rather than misaligning it", owned.metadata.len(), owned.records.len());
            owned.metadata.resize(owned.records.len(), Default::default());
        }

        owned.buffer = new_buffer;
        owned.data_couples = new_couples;
        pass(Arc::new(owned));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_message, InputInfo, Transport};
    use crate::ie::IeRef;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    fn input_info(addr: Ipv4Addr) -> Arc<InputInfo> {
        Arc::new(InputInfo {
            transport: Transport::Udp,
            source_addr: IpAddr::V4(addr),
            source_port: 2100,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: 4739,
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        })
    }

    fn ipfix_with_one_record() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());

        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&hex!("012c 0002 0008 0004 000c 0004"));

        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&hex!("0a000001 c0a80001"));

        let len = buf.len() as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    #[test]
    fn appends_source_ip_field_to_records_lacking_one() {
        let store = TemplateStore::new();
        let info = input_info(Ipv4Addr::new(203, 0, 113, 7));
        let msg = decode_message(ipfix_with_one_record(), info, SourceStatus::New, &store).unwrap();

        let mut plugin = Odip::new();
        let mut out = Vec::new();
        plugin.process_message(Arc::new(msg), &mut |m| out.push(m));
        let rewritten = out.pop().unwrap();

        assert_eq!(rewritten.data_couples.len(), 1);
        let couple = &rewritten.data_couples[0];
        let template = couple.template.as_ref().unwrap();
        assert!(template.contains_field(ODIP4_FIELD).is_some());

        let record = &rewritten.buffer[couple.range.start + 4..couple.range.end];
        assert_eq!(&record[8..12], &[203, 0, 113, 7]);
        assert_eq!(rewritten.records.len(), rewritten.metadata.len());
    }

    #[test]
    fn reuses_the_same_synthetic_template_across_messages() {
        let store = TemplateStore::new();
        let info = input_info(Ipv4Addr::new(203, 0, 113, 7));
        let msg1 = decode_message(ipfix_with_one_record(), info.clone(), SourceStatus::New, &store).unwrap();
        let msg2 = decode_message(ipfix_with_one_record(), info, SourceStatus::Opened, &store).unwrap();

        let mut plugin = Odip::new();
        let mut out = Vec::new();
        plugin.process_message(Arc::new(msg1), &mut |m| out.push(m));
        plugin.process_message(Arc::new(msg2), &mut |m| out.push(m));

        let id_a = out[0].data_couples[0].template.as_ref().unwrap().template_id;
        let id_b = out[1].data_couples[0].template.as_ref().unwrap().template_id;
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn template_already_carrying_the_field_is_left_alone() {
        let store = TemplateStore::new();
        let info = input_info(Ipv4Addr::new(203, 0, 113, 7));

        let mut buf = Vec::new();
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&16u16.to_be_bytes());
        buf.extend_from_slice(&hex!("012c 0003 0008 0004 000c 0004 0193 0004"));
        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&16u16.to_be_bytes());
        buf.extend_from_slice(&hex!("0a000001 c0a80001 cb007107"));
        let len = buf.len() as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());

        let msg = decode_message(buf, info, SourceStatus::New, &store).unwrap();
        let original_len = msg.buffer.len();

        let mut plugin = Odip::new();
        let mut out = Vec::new();
        plugin.process_message(Arc::new(msg), &mut |m| out.push(m));
        let passed = out.pop().unwrap();
        assert_eq!(passed.buffer.len(), original_len);
    }
}
