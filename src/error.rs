//! Structured error taxonomy for the collector core (spec §7).
//!
//! Every leaf error is a small `thiserror` enum scoped to the module that
//! raises it; `CollectorError` aggregates them for callers that want one
//! type to match on. `PipelineError::StageFailure` is constructed in
//! `pipeline::run_stage`, which wraps every intermediate stage's
//! `process_message` call in `catch_unwind`: a panicking stage is caught,
//! logged via this error's `Display`, counted as a drop, and the one
//! message in flight is dropped — the stage's worker thread keeps running
//! and the next message in its queue is processed normally.

use thiserror::Error;

/// Errors raised while admitting or looking up templates (component C1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {template_id} field count implies more bytes ({implied}) than the set provides ({available})")]
    InvalidTemplate {
        template_id: u16,
        implied: usize,
        available: usize,
    },
    #[error("options template {template_id} has scope_field_count = 0")]
    InvalidScope { template_id: u16 },
    #[error("template id {0} is in the reserved range (< 256)")]
    ReservedTemplateId(u16),
}

/// Non-fatal notice: a template was redefined with a different field list.
/// Not an "error" in the propagation sense (spec §4.1/§7) — the new
/// template is still admitted — but callers may want to log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCollision {
    pub template_id: u16,
}

/// Errors raised while decoding a datagram into a `Message` (component C2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message header truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("declared message length {declared} exceeds buffer length {buffer}")]
    DeclaredLengthExceedsBuffer { declared: usize, buffer: usize },
    #[error("unknown netflow/ipfix version {0}")]
    UnknownVersion(u16),
    #[error("set of length {length} is malformed (zero length or overflows the message)")]
    MalformedSet { length: usize },
    #[error("set id {0} is below 256 and is neither the template (2) nor options-template (3) id")]
    UnknownSetId(u16),
}

/// Errors raised by a pipeline stage (component C5).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed processing a message: {reason}")]
    StageFailure { stage: String, reason: String },
    #[error("storage plugin '{0}' is permanently unusable")]
    StorageUnusable(String),
}

/// Top-level error aggregate for library consumers that want a single type.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
