//! A [crate::source::Source] served over [crate::rpc].
//!
//! One side calls [attach] to expose a local source (typically a
//! [crate::source::FileSource]) on a connection; the other side wraps the
//! same connection in a [RemoteSource] and hands it to a
//! [crate::cache::Cache] as its backing store. The cache never sees the
//! transport: framing, dispatch, and failure mapping all stay in this
//! module and below.
//!
//! Requests and replies are fixed-width big-endian fields followed by raw
//! bytes; there is no schema beyond the operation names in this module.
//! There is no stateful file pointer to seek: every read and write
//! carries its own offset.

mod client;
mod server;

pub use client::RemoteSource;
pub use server::attach;

/// Operation names on the wire.
pub const OP_OPEN: &str = "open";
pub const OP_READ: &str = "read";
pub const OP_WRITE: &str = "write";
pub const OP_SIZE: &str = "size";
pub const OP_SYNC: &str = "sync";
pub const OP_CLOSE: &str = "close";
