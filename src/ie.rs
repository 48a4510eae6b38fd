//! Information Element references and the element-dictionary collaborator
//! (spec §3 "Information Element reference", §6.4).
//!
//! The wire-level top bit that flags an enterprise-specific field is
//! stripped during decode (`decode::read_template_field`); from here on an
//! IE is always the separated pair `(enterprise, id)`.

use std::collections::HashMap;
use std::fmt;

/// `(enterprise_number, element_id)`. Built-in (IANA) elements use
/// `enterprise == 0`. `PartialOrd`/`Ord`/`Hash` make this usable directly as
/// a `HashMap`/`BTreeMap` key, which the template offset cache and filter
/// field resolution both rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IeRef {
    pub enterprise: u32,
    pub id: u16,
}

impl IeRef {
    pub const fn new(enterprise: u32, id: u16) -> Self {
        IeRef { enterprise, id }
    }

    pub const fn standard(id: u16) -> Self {
        IeRef { enterprise: 0, id }
    }
}

impl fmt::Display for IeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enterprise == 0 {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}:{}", self.enterprise, self.id)
        }
    }
}

/// Wire data type of an Information Element (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    OctetArray,
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float32,
    Float64,
    Boolean,
    Mac,
    String,
    DateTimeSeconds,
    DateTimeMilli,
    DateTimeMicro,
    DateTimeNano,
    Ipv4,
    Ipv6,
    BasicList,
    SubTemplateList,
    SubTemplateMultiList,
    Unassigned,
}

/// Reduction/aggregation semantic of an Information Element (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSemantic {
    Default,
    Quantity,
    TotalCounter,
    DeltaCounter,
    Identifier,
    Flags,
    List,
    Unassigned,
}

/// A resolved Information Element definition.
#[derive(Debug, Clone)]
pub struct ElementDef {
    pub ie: IeRef,
    pub name: &'static str,
    pub element_type: ElementType,
    pub semantic: ElementSemantic,
}

/// Result of a name lookup (spec §6.4): a name may be ambiguous across
/// enterprises unless qualified `"<ent>:<name>"`.
#[derive(Debug, Clone, Default)]
pub struct ElementLookup {
    pub count: usize,
    pub first: Option<ElementDef>,
}

/// Read-only lookup contract for the (externally loaded) element
/// dictionary. Concrete XML-backed loaders are out of scope (spec §1); this
/// crate ships one reference implementation (`BuiltinDictionary`) seeded
/// from the well-known IANA IPFIX elements, enough to run the tests and the
/// demo binary without an external loader.
pub trait ElementDictionary: Send + Sync {
    fn by_id(&self, id: u16, enterprise: u32) -> Option<ElementDef>;
    fn by_name(&self, name: &str, case_sensitive: bool) -> ElementLookup;
}

macro_rules! builtin_elements {
    ($( $id:expr => $name:ident : $ty:ident / $sem:ident ),* $(,)?) => {
        /// Seed table of well-known enterprise-0 elements, named after the
        /// teacher's `flow::ipfix::FieldType` enum but kept as data instead
        /// of a closed enum so arbitrary/enterprise IEs still round-trip.
        fn seed() -> Vec<(u16, &'static str, ElementType, ElementSemantic)> {
            vec![ $( ($id, stringify!($name), ElementType::$ty, ElementSemantic::$sem) ),* ]
        }
    };
}

builtin_elements! {
    1 => OctetDeltaCount: Unsigned64 / DeltaCounter,
    2 => PacketDeltaCount: Unsigned64 / DeltaCounter,
    4 => ProtocolIdentifier: Unsigned8 / Identifier,
    5 => IpClassOfService: Unsigned8 / Identifier,
    6 => TcpControlBits: Unsigned8 / Flags,
    7 => SourceTransportPort: Unsigned16 / Identifier,
    8 => SourceIPv4Address: Ipv4 / Identifier,
    9 => SourceIPv4PrefixLength: Unsigned8 / Identifier,
    10 => IngressInterface: Unsigned32 / Identifier,
    11 => DestinationTransportPort: Unsigned16 / Identifier,
    12 => DestinationIPv4Address: Ipv4 / Identifier,
    13 => DestinationIPv4PrefixLength: Unsigned8 / Identifier,
    14 => EgressInterface: Unsigned32 / Identifier,
    15 => IpNextHopIPv4Address: Ipv4 / Identifier,
    16 => BgpSourceAsNumber: Unsigned32 / Identifier,
    17 => BgpDestinationAsNumber: Unsigned32 / Identifier,
    21 => FlowEndSysUpTime: Unsigned32 / Default,
    22 => FlowStartSysUpTime: Unsigned32 / Default,
    27 => SourceIPv6Address: Ipv6 / Identifier,
    28 => DestinationIPv6Address: Ipv6 / Identifier,
    32 => IcmpTypeCodeIPv4: Unsigned16 / Identifier,
    34 => SamplingInterval: Unsigned32 / Default,
    38 => EngineType: Unsigned8 / Identifier,
    39 => EngineId: Unsigned8 / Identifier,
    52 => MinimumTTL: Unsigned8 / Default,
    53 => MaximumTTL: Unsigned8 / Default,
    58 => VlanId: Unsigned16 / Identifier,
    60 => IpVersion: Unsigned8 / Identifier,
    61 => FlowDirection: Unsigned8 / Identifier,
    85 => OctetTotalCount: Unsigned64 / TotalCounter,
    86 => PacketTotalCount: Unsigned64 / TotalCounter,
    128 => BgpNextAdjacentAsNumber: Unsigned32 / Identifier,
    129 => BgpPrevAdjacentAsNumber: Unsigned32 / Identifier,
    130 => ExporterIPv4Address: Ipv4 / Identifier,
    131 => ExporterIPv6Address: Ipv6 / Identifier,
    136 => FlowEndReason: Unsigned8 / Identifier,
    143 => MeteringProcessId: Unsigned32 / Identifier,
    144 => ExportingProcessId: Unsigned32 / Identifier,
    145 => TemplateId: Unsigned16 / Identifier,
    149 => ObservationDomainId: Unsigned32 / Identifier,
    150 => FlowStartSeconds: DateTimeSeconds / Default,
    151 => FlowEndSeconds: DateTimeSeconds / Default,
    152 => FlowStartMilliseconds: DateTimeMilli / Default,
    153 => FlowEndMilliseconds: DateTimeMilli / Default,
    154 => FlowStartMicroseconds: DateTimeMicro / Default,
    155 => FlowEndMicroseconds: DateTimeMicro / Default,
    156 => FlowStartNanoseconds: DateTimeNano / Default,
    157 => FlowEndNanoseconds: DateTimeNano / Default,
    160 => SystemInitTimeMilliseconds: DateTimeMilli / Default,
    169 => DestinationIPv6Prefix: Ipv6 / Identifier,
    170 => SourceIPv6Prefix: Ipv6 / Identifier,
    180 => UdpSourcePort: Unsigned16 / Identifier,
    181 => UdpDestinationPort: Unsigned16 / Identifier,
    182 => TcpSourcePort: Unsigned16 / Identifier,
    183 => TcpDestinationPort: Unsigned16 / Identifier,
    192 => IpTTL: Unsigned8 / Default,
    195 => IpDiffServCodePoint: Unsigned8 / Identifier,
    211 => CollectorIPv4Address: Ipv4 / Identifier,
    212 => CollectorIPv6Address: Ipv6 / Identifier,
    217 => ExporterTransportPort: Unsigned16 / Identifier,
    225 => PostNATSourceIPv4Address: Ipv4 / Identifier,
    226 => PostNATDestinationIPv4Address: Ipv4 / Identifier,
    236 => VRFname: String / Identifier,
    291 => BasicListElement: BasicList / List,
    292 => SubTemplateListElement: SubTemplateList / List,
    293 => SubTemplateMultiListElement: SubTemplateMultiList / List,
}

/// Reference element dictionary seeded with the well-known IANA IPFIX
/// registry entries the collector needs to interpret its own synthetic
/// templates (v5/v9 normalization) and to run the filter engine's tests.
/// A real deployment supplies its own `ElementDictionary` loaded from the
/// XML registry (spec §6.4, out of scope for this core).
pub struct BuiltinDictionary {
    by_id: HashMap<(u32, u16), ElementDef>,
    by_name: HashMap<String, Vec<ElementDef>>,
}

impl BuiltinDictionary {
    pub fn new() -> Self {
        let mut by_id = HashMap::new();
        let mut by_name: HashMap<String, Vec<ElementDef>> = HashMap::new();

        for (id, name, element_type, semantic) in seed() {
            let def = ElementDef {
                ie: IeRef::standard(id),
                name,
                element_type,
                semantic,
            };
            by_id.insert((0u32, id), def.clone());
            by_name.entry(name.to_ascii_lowercase()).or_default().push(def);
        }

        BuiltinDictionary { by_id, by_name }
    }

    /// Register (or override) a definition, used by tests and by hosts that
    /// want to extend the built-in table with a handful of enterprise IEs
    /// without writing a full XML-backed dictionary.
    pub fn insert(&mut self, def: ElementDef) {
        self.by_id.insert((def.ie.enterprise, def.ie.id), def.clone());
        self.by_name.entry(def.name.to_ascii_lowercase()).or_default().push(def);
    }
}

impl Default for BuiltinDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementDictionary for BuiltinDictionary {
    fn by_id(&self, id: u16, enterprise: u32) -> Option<ElementDef> {
        self.by_id.get(&(enterprise, id)).cloned()
    }

    fn by_name(&self, name: &str, case_sensitive: bool) -> ElementLookup {
        let (enterprise_filter, bare) = match name.split_once(':') {
            Some((ent, rest)) => (ent.parse::<u32>().ok(), rest),
            None => (None, name),
        };

        let key = bare.to_ascii_lowercase();
        let candidates = match self.by_name.get(&key) {
            Some(v) => v.as_slice(),
            None => return ElementLookup::default(),
        };

        let matches: Vec<&ElementDef> = candidates
            .iter()
            .filter(|def| {
                let name_matches = if case_sensitive { def.name == bare } else { true };
                let ent_matches = enterprise_filter.map_or(true, |e| def.ie.enterprise == e);
                name_matches && ent_matches
            })
            .collect();

        ElementLookup {
            count: matches.len(),
            first: matches.first().map(|d| (*d).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_builtin_by_id() {
        let dict = BuiltinDictionary::new();
        let def = dict.by_id(8, 0).unwrap();
        assert_eq!(def.name, "SourceIPv4Address");
        assert_eq!(def.element_type, ElementType::Ipv4);
    }

    #[test]
    fn unknown_id_is_none() {
        let dict = BuiltinDictionary::new();
        assert!(dict.by_id(60000, 0).is_none());
    }

    #[test]
    fn looks_up_by_name_case_insensitive() {
        let dict = BuiltinDictionary::new();
        let lookup = dict.by_name("sourceipv4address", false);
        assert_eq!(lookup.count, 1);
        assert_eq!(lookup.first.unwrap().ie, IeRef::standard(8));
    }

    #[test]
    fn enterprise_qualified_name_restricts_scope() {
        let mut dict = BuiltinDictionary::new();
        dict.insert(ElementDef {
            ie: IeRef::new(12345, 8),
            name: "SourceIPv4Address",
            element_type: ElementType::Ipv4,
            semantic: ElementSemantic::Identifier,
        });

        let unqualified = dict.by_name("SourceIPv4Address", false);
        assert_eq!(unqualified.count, 2);

        let qualified = dict.by_name("12345:SourceIPv4Address", false);
        assert_eq!(qualified.count, 1);
        assert_eq!(qualified.first.unwrap().ie.enterprise, 12345);
    }
}
