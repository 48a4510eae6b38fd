//! External collaborator interfaces (spec §6): the traits a host
//! application implements to plug concrete transports, transforms, and
//! storage backends into the pipeline. Concrete implementations (besides
//! the demo UDP input/logging storage wired in `main.rs`) are out of scope
//! for this core crate, per spec §1.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::decode::{InputInfo, Message};
use crate::template::TemplateStore;

pub type PipelineMessage = Arc<Message>;

/// One event an input plugin's poll loop can report (spec §6.1).
pub enum PacketEvent {
    /// A raw datagram read from the transport, still in whatever wire
    /// dialect (IPFIX/NetFlow v9/v5) the source speaks.
    Packet { buffer: Vec<u8>, from: SocketAddr },
    /// The poll was interrupted (signal, shutdown request) with no data.
    Intr,
    /// The source cleanly closed (EOF on a stream transport, or an
    /// explicit disconnect notice).
    Closed,
    /// A transport-level error occurred; the plugin may still be polled
    /// again afterward.
    Error(String),
}

/// A concrete transport collaborator (spec §6.1). `init` takes whatever
/// configuration the host parsed (left to the implementor's own type);
/// this trait only fixes the run-loop shape the preprocessor drives.
pub trait InputPlugin: Send {
    fn get_packet(&mut self) -> PacketEvent;
    fn input_info(&self) -> Arc<InputInfo>;
    fn close(&mut self);
}

/// One transformation step in the pipeline chain (spec §4.5, §6.2).
/// `pass` is the primitive stages call to forward a (possibly replacement)
/// message downstream; not calling it at all drops the message.
pub trait IntermediatePlugin: Send {
    fn name(&self) -> &str;
    fn process_message(&mut self, msg: PipelineMessage, pass: &mut dyn FnMut(PipelineMessage));
    fn close(&mut self) {}
}

/// Takes ownership of a message for in-place mutation (spec §9's "in-place
/// when single owner" idiom, also used by `record::set_field`): most
/// messages reach an intermediate stage with `Arc` strong count 1, so this
/// is usually a plain move; a message still shared with another stage (rare
/// — only possible if a host rewires the chain with its own fan-out) is
/// cloned instead of mutated in place.
pub fn into_owned_message(msg: PipelineMessage) -> Message {
    Arc::try_unwrap(msg).unwrap_or_else(|shared| (*shared).clone())
}

/// A storage backend collaborator (spec §6.3).
pub trait StoragePlugin: Send {
    fn store_packet(&mut self, msg: &PipelineMessage, templates: &TemplateStore);
    /// Flush any buffered output now, independent of the normal windowing
    /// policy (e.g. on forced rotation or shutdown).
    fn store_now(&mut self) {}
    fn close(&mut self) {}
}
