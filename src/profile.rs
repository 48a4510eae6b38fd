//! Profile/channel routing tree (spec §4.6, §6.5).
//!
//! Grounded in `examples/original_source/base/src/utils/profiles/profile_events.c`,
//! which walks a similarly shaped profile/channel tree once per record and
//! records channel membership in a bitset (`bitset.h`); here the "bitset"
//! is just `Vec<ChannelId>` per record, since Rust's `Vec` is cheap enough
//! at the sizes a profile tree realistically reaches and needs no manual
//! bit-twiddling to stay correct.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::decode::{InputInfo, Message};
use crate::filter::{EvalContext, FilterExpr};
use crate::ie::ElementDictionary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileType {
    Normal,
    Shadow,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: ProfileId,
    pub parent: Option<ProfileId>,
    pub name: String,
    pub directory: PathBuf,
    pub profile_type: ProfileType,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub profile: ProfileId,
    pub name: String,
    pub filter: FilterExpr,
}

/// Read-only tree consumed by the pipeline (spec §6.5). Built externally
/// (the XML/config loader is out of scope, spec §1) and handed to the
/// preprocessor as an `Arc<ProfileTree>` that can be atomically swapped.
pub struct ProfileTree {
    profiles: HashMap<ProfileId, Profile>,
    channels: HashMap<ChannelId, Channel>,
    children: HashMap<ProfileId, Vec<ProfileId>>,
    root: ProfileId,
}

impl ProfileTree {
    pub fn builder(root: Profile) -> ProfileTreeBuilder {
        ProfileTreeBuilder::new(root)
    }

    pub fn root(&self) -> ProfileId {
        self.root
    }

    pub fn channel_profile(&self, channel: ChannelId) -> Option<&Profile> {
        let c = self.channels.get(&channel)?;
        self.profiles.get(&c.profile)
    }

    /// Full slash-separated path from the root to this channel's profile,
    /// e.g. `"/customers/acme"` (spec §6.5 `channel_path`).
    pub fn channel_path(&self, channel: ChannelId) -> Option<String> {
        let profile = self.channel_profile(channel)?;
        let mut parts = vec![profile.name.clone()];
        let mut cur = profile.parent;
        while let Some(pid) = cur {
            let p = self.profiles.get(&pid)?;
            parts.push(p.name.clone());
            cur = p.parent;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    pub fn channel_name(&self, channel: ChannelId) -> Option<&str> {
        self.channels.get(&channel).map(|c| c.name.as_str())
    }

    pub fn profile_children(&self, profile: ProfileId) -> &[ProfileId] {
        self.children.get(&profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn profile_channels(&self, profile: ProfileId) -> Vec<ChannelId> {
        self.channels.values().filter(|c| c.profile == profile).map(|c| c.id).collect()
    }

    pub fn profile_type(&self, profile: ProfileId) -> Option<ProfileType> {
        self.profiles.get(&profile).map(|p| p.profile_type)
    }

    pub fn profile_directory(&self, profile: ProfileId) -> Option<&std::path::Path> {
        self.profiles.get(&profile).map(|p| p.directory.as_path())
    }

    pub fn all_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }
}

pub struct ProfileTreeBuilder {
    profiles: HashMap<ProfileId, Profile>,
    channels: HashMap<ChannelId, Channel>,
    children: HashMap<ProfileId, Vec<ProfileId>>,
    root: ProfileId,
}

impl ProfileTreeBuilder {
    fn new(root: Profile) -> Self {
        let root_id = root.id;
        let mut profiles = HashMap::new();
        profiles.insert(root_id, root);
        ProfileTreeBuilder {
            profiles,
            channels: HashMap::new(),
            children: HashMap::new(),
            root: root_id,
        }
    }

    pub fn add_profile(mut self, profile: Profile) -> Self {
        if let Some(parent) = profile.parent {
            self.children.entry(parent).or_default().push(profile.id);
        }
        self.profiles.insert(profile.id, profile);
        self
    }

    pub fn add_channel(mut self, channel: Channel) -> Self {
        self.channels.insert(channel.id, channel);
        self
    }

    pub fn build(self) -> ProfileTree {
        ProfileTree {
            profiles: self.profiles,
            channels: self.channels,
            children: self.children,
            root: self.root,
        }
    }
}

/// Evaluates every channel's filter for every decoded record in `message`
/// and records the matching set in `message.metadata` (spec §4.5
/// "Resolve each record's channels ... channel set of size zero is valid").
/// One pass per record, as the profile-events contract requires.
pub fn route(message: &mut Message, tree: &ProfileTree, dict: &dyn ElementDictionary) {
    let header = message.header;
    let input_info = message.input_info.clone();

    for (idx, loc) in message.records.iter().enumerate() {
        let couple = &message.data_couples[loc.couple_index];
        let Some(template) = &couple.template else { continue };
        let bytes = &message.buffer[loc.range.start..loc.range.end];
        let record = crate::record::RecordView {
            bytes,
            template: template.as_ref(),
        };
        let ctx = EvalContext {
            record,
            header: &header,
            input_info: input_info.as_ref(),
            dict,
        };

        let mut matched = Vec::new();
        for channel in tree.all_channels() {
            if channel.filter.eval(&ctx) {
                matched.push(channel.id);
            }
        }
        message.metadata[idx].channels = matched;
    }
}

/// Computed difference between two tree generations (spec §4.6
/// "Reconfiguration"): `created`/`deleted` by channel id, `updated` for
/// channels whose filter or profile membership changed. A storage stage
/// that encounters an unknown channel id triggers a reload and applies
/// this diff via callbacks before resuming routing.
#[derive(Debug, Default)]
pub struct ProfileTreeDiff {
    pub created: Vec<ChannelId>,
    pub updated: Vec<ChannelId>,
    pub deleted: Vec<ChannelId>,
}

pub fn diff(old: &ProfileTree, new: &ProfileTree) -> ProfileTreeDiff {
    let mut out = ProfileTreeDiff::default();
    for (id, new_channel) in &new.channels {
        match old.channel(*id) {
            None => out.created.push(*id),
            Some(old_channel) => {
                if old_channel.profile != new_channel.profile || !filter_text_eq(&old_channel.filter, &new_channel.filter) {
                    out.updated.push(*id);
                }
            }
        }
    }
    for id in old.channels.keys() {
        if !new.channels.contains_key(id) {
            out.deleted.push(*id);
        }
    }
    out
}

/// Structural comparison good enough to detect a real filter change;
/// exact AST equality isn't derived (the AST embeds compiled `Regex`,
/// which doesn't implement `PartialEq`), so this compares `Debug`
/// renderings, which is stable for a given parse and cheap enough at
/// reconfiguration-time frequency (spec: tree swaps are rare).
fn filter_text_eq(a: &FilterExpr, b: &FilterExpr) -> bool {
    format!("{:?}", a) == format!("{:?}", b)
}

/// Invoked by a pipeline stage after `diff` to apply a reconfiguration
/// (spec §4.6 "a diff between old and new trees yields create/update/
/// delete callback invocations").
pub trait ProfileTreeListener {
    fn on_channel_created(&mut self, tree: &ProfileTree, channel: ChannelId);
    fn on_channel_updated(&mut self, tree: &ProfileTree, channel: ChannelId);
    fn on_channel_deleted(&mut self, channel: ChannelId);
}

pub fn apply_diff(listener: &mut dyn ProfileTreeListener, new_tree: &ProfileTree, diff: &ProfileTreeDiff) {
    for &id in &diff.deleted {
        listener.on_channel_deleted(id);
    }
    for &id in &diff.created {
        listener.on_channel_created(new_tree, id);
    }
    for &id in &diff.updated {
        listener.on_channel_updated(new_tree, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{SourceStatus, Transport};
    use crate::ie::BuiltinDictionary;
    use crate::template::TemplateStore;
    use hex_literal::hex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, OnceLock};

    fn dict() -> &'static dyn ElementDictionary {
        static DICT: OnceLock<BuiltinDictionary> = OnceLock::new();
        DICT.get_or_init(BuiltinDictionary::new)
    }

    fn tree() -> ProfileTree {
        let root = Profile {
            id: ProfileId(0),
            parent: None,
            name: "root".into(),
            directory: PathBuf::from("/data"),
            profile_type: ProfileType::Normal,
        };
        ProfileTree::builder(root)
            .add_channel(Channel {
                id: ChannelId(1),
                profile: ProfileId(0),
                name: "https".into(),
                filter: crate::filter::parse("SRCPORT = 443", dict()).unwrap(),
            })
            .add_channel(Channel {
                id: ChannelId(2),
                profile: ProfileId(0),
                name: "http".into(),
                filter: crate::filter::parse("DSTPORT = 80", dict()).unwrap(),
            })
            .build()
    }

    fn input_info(port: u16, dport: u16) -> Arc<InputInfo> {
        Arc::new(InputInfo {
            transport: Transport::Udp,
            source_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: port,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: dport,
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        })
    }

    fn decode_one(store: &TemplateStore, src_port: u16, dst_port: u16) -> crate::decode::Message {
        let template_record = hex!("012c 0001 0007 0002");
        let mut buf = Vec::new();
        buf.extend_from_slice(&crate::decode::IPFIX_VERSION.to_be_bytes());
        let template_set_len = 4 + template_record.len();
        let data = src_port.to_be_bytes();
        let data_set_len = 4 + data.len();
        let total_len = crate::decode::HEADER_LEN + template_set_len + data_set_len;
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&crate::decode::TEMPLATE_SET_ID.to_be_bytes());
        buf.extend_from_slice(&(template_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&template_record);
        buf.extend_from_slice(&300u16.to_be_bytes());
        buf.extend_from_slice(&(data_set_len as u16).to_be_bytes());
        buf.extend_from_slice(&data);

        crate::decode::decode_message(buf, input_info(src_port, dst_port), SourceStatus::New, store).unwrap()
    }

    #[test]
    fn routes_matching_channel_scenario_5() {
        let store = TemplateStore::new();
        let tree = tree();

        let mut msg = decode_one(&store, 443, 12345);
        route(&mut msg, &tree, dict());
        assert_eq!(msg.metadata[0].channels, vec![ChannelId(1)]);

        let mut msg = decode_one(&store, 80, 80);
        route(&mut msg, &tree, dict());
        assert_eq!(msg.metadata[0].channels, vec![ChannelId(2)]);

        let mut msg = decode_one(&store, 1234, 5678);
        route(&mut msg, &tree, dict());
        assert!(msg.metadata[0].channels.is_empty());
    }

    #[test]
    fn diff_detects_created_and_deleted_channels() {
        let old = tree();
        let root = Profile {
            id: ProfileId(0),
            parent: None,
            name: "root".into(),
            directory: PathBuf::from("/data"),
            profile_type: ProfileType::Normal,
        };
        let new = ProfileTree::builder(root)
            .add_channel(Channel {
                id: ChannelId(2),
                profile: ProfileId(0),
                name: "http".into(),
                filter: crate::filter::parse("DSTPORT = 8080", dict()).unwrap(),
            })
            .add_channel(Channel {
                id: ChannelId(3),
                profile: ProfileId(0),
                name: "new-channel".into(),
                filter: crate::filter::parse("EXISTS SourceIPv4Address", dict()).unwrap(),
            })
            .build();

        let d = diff(&old, &new);
        assert_eq!(d.created, vec![ChannelId(3)]);
        assert_eq!(d.deleted, vec![ChannelId(1)]);
        assert_eq!(d.updated, vec![ChannelId(2)]);
    }
}
