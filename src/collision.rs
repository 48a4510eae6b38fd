//! Template collision mapper (component C4, spec §4.4).
//!
//! Grounded in `examples/original_source/base/src/storage/ipfix/files.c`'s
//! `tmapper_process_template`/`TMAPPER_ACTION`: when archival storage mixes
//! several sources under one output file, two sources sharing an ODID may
//! reuse the same `template_id` with incompatible field lists, which would
//! otherwise corrupt the merged file. The mapper remembers, per source, the
//! id a given wire template was rewritten to so every later data set from
//! that source gets mapped consistently.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use crate::template::{Template, TemplateField, MIN_TEMPLATE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionAction {
    /// Identical template already occupies this id in the merged output, or
    /// this is the first sighting of that id — no rewrite needed.
    Pass,
    /// A different template already occupies this id; `new_id` is a freshly
    /// allocated id in the ODID's id space, remembered for this source.
    Rewrite,
    /// The id space `256..=65535` is exhausted; this wire template cannot be
    /// stored under any id.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotKey {
    odid: u32,
    is_options: bool,
    template_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SourceKey {
    odid: u32,
    source_crc: u32,
    is_options: bool,
    wire_template_id: u16,
}

/// Fingerprint cheap enough to store and compare without cloning a whole
/// `Template` (spec's `same_fields` notion, narrowed to what `Pass`/
/// `Rewrite` need to decide).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(Vec<TemplateField>);

fn fingerprint(tpl: &Template) -> Fingerprint {
    Fingerprint(tpl.fields.clone())
}

struct Slot {
    fingerprint: Fingerprint,
    template_id: u16,
}

/// Per-merged-output collision resolver. One mapper instance is shared by
/// every archival storage worker writing into the same output file (spec
/// §4.4 "used by archival storage").
pub struct CollisionMapper {
    slots: DashMap<SlotKey, Slot>,
    remembered: DashMap<SourceKey, (CollisionAction, Option<u16>)>,
    next_alloc_id: AtomicU32,
}

impl CollisionMapper {
    pub fn new() -> Self {
        CollisionMapper {
            slots: DashMap::new(),
            remembered: DashMap::new(),
            next_alloc_id: AtomicU32::new(MIN_TEMPLATE_ID as u32),
        }
    }

    fn allocate_id(&self) -> Option<u16> {
        let candidate = self.next_alloc_id.fetch_add(1, Ordering::Relaxed);
        (candidate <= u16::MAX as u32).then_some(candidate as u16)
    }

    /// `process(src_info, wire_template, kind) → (action, new_id)` (spec
    /// §4.4). `odid`/`source_crc` stand in for `src_info` (spec §3 "Template
    /// key" decomposition already used throughout this crate).
    pub fn process(&self, odid: u32, source_crc: u32, wire_template: &Template, is_options: bool) -> (CollisionAction, Option<u16>) {
        let source_key = SourceKey {
            odid,
            source_crc,
            is_options,
            wire_template_id: wire_template.template_id,
        };
        if let Some(remembered) = self.remembered.get(&source_key) {
            return *remembered;
        }

        let fp = fingerprint(wire_template);
        let slot_key = SlotKey {
            odid,
            is_options,
            template_id: wire_template.template_id,
        };

        // Read the existing slot's fingerprint (if any) into an owned value
        // first, so the dashmap shard's read guard is dropped before we
        // potentially need to take a write lock on a colliding insert below
        // (holding both at once across match arms would deadlock).
        let existing_fp = self.slots.get(&slot_key).map(|s| s.fingerprint.clone());

        let outcome = match existing_fp {
            None => {
                self.slots.insert(
                    slot_key,
                    Slot {
                        fingerprint: fp,
                        template_id: wire_template.template_id,
                    },
                );
                (CollisionAction::Pass, Some(wire_template.template_id))
            }
            Some(existing) if existing == fp => (CollisionAction::Pass, Some(wire_template.template_id)),
            Some(_) => match self.allocate_id() {
                Some(new_id) => {
                    self.slots.insert(
                        SlotKey {
                            odid,
                            is_options,
                            template_id: new_id,
                        },
                        Slot {
                            fingerprint: fp,
                            template_id: new_id,
                        },
                    );
                    (CollisionAction::Rewrite, Some(new_id))
                }
                None => (CollisionAction::Duplicate, None),
            },
        };

        self.remembered.insert(source_key, outcome);
        outcome
    }

    /// `templates(odid, kind) → list` (spec §4.4): the ids currently
    /// occupied in the merged output's namespace, for header-block
    /// regeneration when a storage window opens.
    pub fn templates(&self, odid: u32, is_options: bool) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|entry| entry.key().odid == odid && entry.key().is_options == is_options)
            .map(|entry| entry.value().template_id)
            .collect()
    }
}

impl Default for CollisionMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateStore;
    use hex_literal::hex;

    fn template(store: &TemplateStore, odid: u32, crc: u32, buf: &[u8]) -> std::sync::Arc<Template> {
        store.add(odid, crc, buf, false).unwrap().0
    }

    #[test]
    fn first_sighting_passes_through() {
        let store = TemplateStore::new();
        let mapper = CollisionMapper::new();
        let tpl = template(&store, 1, 7, &hex!("012c 0002 0008 0004 000c 0004"));

        let (action, new_id) = mapper.process(1, 7, &tpl, false);
        assert_eq!(action, CollisionAction::Pass);
        assert_eq!(new_id, Some(300));
    }

    #[test]
    fn colliding_fields_get_rewritten_and_remembered() {
        let store = TemplateStore::new();
        let mapper = CollisionMapper::new();

        let tpl_a = template(&store, 1, 7, &hex!("012c 0002 0008 0004 000c 0004"));
        let tpl_b = template(&store, 1, 42, &hex!("012c 0001 0004 0001"));

        let (action_a, id_a) = mapper.process(1, 7, &tpl_a, false);
        assert_eq!(action_a, CollisionAction::Pass);
        assert_eq!(id_a, Some(300));

        let (action_b, id_b) = mapper.process(1, 42, &tpl_b, false);
        assert_eq!(action_b, CollisionAction::Rewrite);
        assert_ne!(id_b, Some(300));

        // Same source, same wire id, remembered without re-deciding.
        let (action_b2, id_b2) = mapper.process(1, 42, &tpl_b, false);
        assert_eq!(action_b2, action_b);
        assert_eq!(id_b2, id_b);
    }

    #[test]
    fn identical_fields_from_different_sources_pass() {
        let store = TemplateStore::new();
        let mapper = CollisionMapper::new();

        let tpl_a = template(&store, 1, 7, &hex!("012c 0002 0008 0004 000c 0004"));
        let tpl_b = template(&store, 1, 42, &hex!("012c 0002 0008 0004 000c 0004"));

        let (action_a, _) = mapper.process(1, 7, &tpl_a, false);
        let (action_b, id_b) = mapper.process(1, 42, &tpl_b, false);

        assert_eq!(action_a, CollisionAction::Pass);
        assert_eq!(action_b, CollisionAction::Pass);
        assert_eq!(id_b, Some(300));
    }

    #[test]
    fn exhausted_id_space_reports_duplicate() {
        let store = TemplateStore::new();
        let mapper = CollisionMapper::new();
        mapper.next_alloc_id.store(u16::MAX as u32 + 1, Ordering::Relaxed);

        let tpl_a = template(&store, 1, 7, &hex!("012c 0002 0008 0004 000c 0004"));
        let tpl_b = template(&store, 1, 42, &hex!("012c 0001 0004 0001"));
        mapper.process(1, 7, &tpl_a, false);
        let (action, new_id) = mapper.process(1, 42, &tpl_b, false);

        assert_eq!(action, CollisionAction::Duplicate);
        assert_eq!(new_id, None);
    }
}
