//! The push side of the chat back end: the TLS socket server, the
//! per-user connection registry, the typed event bus, and the frame
//! codec that turns events into bytes on the wire.

pub mod codec;
pub mod events;
pub mod registry;
pub mod server;
