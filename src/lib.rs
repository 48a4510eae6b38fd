//! IPFIX/NetFlow collector core: template management, wire decoding for
//! IPFIX (RFC 7011), NetFlow v9 and NetFlow v5, the record/filter/profile
//! routing layer, and the pipeline that wires input, intermediate, and
//! storage stages together behind bounded queues.
//!
//! A host application supplies concrete `plugin::InputPlugin`,
//! `plugin::IntermediatePlugin`, and `plugin::StoragePlugin` implementations
//! and assembles them with `pipeline::PipelineBuilder`; this crate ships the
//! wire-format handling, template store, and routing/filtering logic those
//! plugins run on top of, plus two intermediate stages (`intermediate`) that
//! are generic enough to belong in the core itself.

pub mod collision;
pub mod decode;
pub mod error;
pub mod filter;
pub mod ie;
pub mod intermediate;
pub mod logger;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod profile;
pub mod record;
pub mod settings;
pub mod template;
