//! Record walker (component C3, spec §3 "Data record", §4.3).
//!
//! A data record has no stored length of its own: callers always walk it
//! against the template that shaped it. This module never allocates and
//! never copies field bytes — every return value borrows the caller's
//! slice, matching spec §4.3 ("the walker never allocates").
//!
//! Grounded in `examples/original_source/base/src/ipfix_message.c`'s
//! `data_record_length`/`get_data_record_count` plus the variable-length
//! encoding rule from RFC 7011 §7 ("255 escape" prefix).

use crate::ie::IeRef;
use crate::template::Template;

/// Reads the variable-length prefix at the start of `buf` (spec §4.3,
/// §6.6): `< 255` is the length itself (1 byte consumed); `255` is
/// followed by a big-endian 16-bit length (3 bytes consumed).
fn read_var_length(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first < 255 {
        Some((first as usize, 1))
    } else {
        let len = u16::from_be_bytes([*buf.get(1)?, *buf.get(2)?]);
        Some((len as usize, 3))
    }
}

/// Total byte length of one record under `template`, without reading past
/// `buf`'s end. For a fixed-length template this is `fixed_part_length`
/// with no walk needed; otherwise every field (including the length
/// prefixes themselves) is walked once.
///
/// Returns `None` if the record would read past `buf` — the caller (the
/// set iterator below) treats that as "stop, no more records" rather than
/// a hard error (spec §4.3 "a malformed record stops the walk early").
pub fn record_length(buf: &[u8], template: &Template) -> Option<usize> {
    if !template.has_variable_length {
        let len = template.fixed_part_length as usize;
        return (buf.len() >= len).then_some(len);
    }

    let mut offset = 0usize;
    for f in &template.fields {
        if f.is_variable() {
            let (len, consumed) = read_var_length(buf.get(offset..)?)?;
            offset = offset.checked_add(consumed)?.checked_add(len)?;
        } else {
            offset = offset.checked_add(f.length as usize)?;
        }
        if offset > buf.len() {
            return None;
        }
    }
    Some(offset)
}

/// A field-addressable view over one record's bytes (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub bytes: &'a [u8],
    pub template: &'a Template,
}

impl<'a> RecordView<'a> {
    /// `record_length(view)` (spec §4.3).
    pub fn len(&self) -> usize {
        record_length(self.bytes, self.template).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `field(view, ie_ref)` (spec §4.3): returns the byte slice for `ie`,
    /// or `None` if the template doesn't carry it (`FieldNotFound`, spec
    /// §7, surfaces as `None` rather than an error). Enterprise-zero IEs
    /// that hit the template's offset cache skip the walk entirely.
    pub fn field(&self, ie: IeRef) -> Option<&'a [u8]> {
        if ie.enterprise == 0 {
            if let Some(offset) = self.template.cache_lookup(ie) {
                let len = self.template.field_length(ie)? as usize;
                return self.bytes.get(offset as usize..offset as usize + len);
            }
        }
        walk_for_field(self.bytes, self.template, ie)
    }
}

fn walk_for_field<'a>(bytes: &'a [u8], template: &Template, ie: IeRef) -> Option<&'a [u8]> {
    let mut offset = 0usize;
    for f in &template.fields {
        if f.is_variable() {
            let (len, consumed) = read_var_length(bytes.get(offset..)?)?;
            let start = offset + consumed;
            let end = start + len;
            if f.ie == ie {
                return bytes.get(start..end);
            }
            offset = end;
        } else {
            let end = offset + f.length as usize;
            if f.ie == ie {
                return bytes.get(offset..end);
            }
            offset = end;
        }
    }
    None
}

/// `set_field(view, ie_ref, value)` (spec §4.3): in-place write. Requires
/// exclusive access to the underlying buffer, which stages only have
/// before a message starts traveling the shared pipeline (spec §9's
/// "in-place when single owner" idiom) — downstream stages that need to
/// mutate a shared `Message` build a replacement instead (see
/// `pipeline::Stage`).
pub fn set_field(bytes: &mut [u8], template: &Template, ie: IeRef, value: &[u8]) -> Result<(), SetFieldError> {
    let mut offset = 0usize;
    for f in &template.fields {
        let (start, end) = if f.is_variable() {
            let (len, consumed) = read_var_length(&bytes[offset..]).ok_or(SetFieldError::Truncated)?;
            (offset + consumed, offset + consumed + len)
        } else {
            (offset, offset + f.length as usize)
        };
        if f.ie == ie {
            if end - start != value.len() {
                return Err(SetFieldError::SizeMismatch {
                    expected: end - start,
                    got: value.len(),
                });
            }
            bytes[start..end].copy_from_slice(value);
            return Ok(());
        }
        offset = end;
    }
    Err(SetFieldError::NotFound)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFieldError {
    NotFound,
    Truncated,
    SizeMismatch { expected: usize, got: usize },
}

/// Lazy sequence of record views over one data set's payload (spec §4.3
/// "records(set, template)"). `buf` is the set's payload *after* the
/// 4-byte set header has already been stripped by the caller.
pub struct RecordIter<'a> {
    buf: &'a [u8],
    template: &'a Template,
}

pub fn records_in_set<'a>(buf: &'a [u8], template: &'a Template) -> RecordIter<'a> {
    RecordIter { buf, template }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = RecordView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let len = record_length(self.buf, self.template)?;
        if len == 0 {
            // A zero-length fixed part (e.g. an all-variable template whose
            // first field is an empty string) would otherwise spin forever.
            return None;
        }
        let (record, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(RecordView {
            bytes: record,
            template,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateStore;
    use hex_literal::hex;

    const TEMPLATE_300: [u8; 12] = hex!("012c 0002 0008 0004 000c 0004");

    #[test]
    fn fixed_template_yields_expected_record_count() {
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &TEMPLATE_300, false).unwrap();

        // two 8-byte records (4 + 4)
        let data = hex!("0a000001 0a000002 0a000003 0a000004");
        let records: Vec<_> = records_in_set(&data, &tpl).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field(IeRef::standard(8)).unwrap(), &hex!("0a000001"));
        assert_eq!(records[1].field(IeRef::standard(12)).unwrap(), &hex!("0a000004"));
    }

    #[test]
    fn trailing_short_bytes_stop_the_walk_without_erroring() {
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &TEMPLATE_300, false).unwrap();

        let data = hex!("0a000001 0a000002 0a0000"); // 11 bytes: one full record + 3 stray bytes
        let records: Vec<_> = records_in_set(&data, &tpl).collect();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn empty_set_yields_zero_records() {
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &TEMPLATE_300, false).unwrap();
        let records: Vec<_> = records_in_set(&[], &tpl).collect();
        assert!(records.is_empty());
    }

    #[test]
    fn variable_length_field_with_zero_extended_length() {
        let field_buf = hex!("012d 0001 0084 ffff"); // one field, IE 132, var length
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 8, &field_buf, false).unwrap();

        // 0xFF escape followed by a zero extended length -> empty slice
        let data = hex!("ff 0000");
        let view = records_in_set(&data, &tpl).next().unwrap();
        assert_eq!(view.field(IeRef::standard(0x84)).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn set_field_round_trips_for_fixed_length_field() {
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &TEMPLATE_300, false).unwrap();
        let mut data = hex!("0a000001 0a000002").to_vec();

        set_field(&mut data, &tpl, IeRef::standard(8), &[192, 168, 1, 1]).unwrap();
        let view = RecordView { bytes: &data, template: &tpl };
        assert_eq!(view.field(IeRef::standard(8)).unwrap(), &[192, 168, 1, 1]);
    }

    #[test]
    fn set_field_rejects_size_mismatch() {
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &TEMPLATE_300, false).unwrap();
        let mut data = hex!("0a000001 0a000002").to_vec();
        let err = set_field(&mut data, &tpl, IeRef::standard(8), &[1, 2, 3]).unwrap_err();
        assert_eq!(err, SetFieldError::SizeMismatch { expected: 4, got: 3 });
    }
}
