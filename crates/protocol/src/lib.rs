//! Shared wire types for the statrpc bridge.
//!
//! This crate defines the protocol spoken between the host-side client and the
//! backend process running inside the sandbox, used by both `statrpc` (host)
//! and `statrpc-backend` (sandbox). Messages are single-level JSON objects, one
//! per line, each tagged with [`PROTOCOL_VERSION`].

mod codec;
mod message;
mod types;

pub use codec::{Frame, MAX_LINE_LENGTH, MessageCodec};
pub use message::{Envelope, MalformedMessage, Message, RequestId};
pub use types::{
    DirEntry, ErrorCode, ErrorPayload, ExistsResult, FileKind, PathParams, Permission,
    ReaddirResult, StatRecord,
};

/// Protocol version tag carried by every message.
pub const PROTOCOL_VERSION: &str = "v1";

/// Line the backend prints once before any protocol traffic.
pub const READY_SENTINEL: &str = "ready";

/// Method names understood by the backend.
pub mod methods {
    pub const STAT: &str = "stat";
    pub const EXISTS: &str = "exists";
    pub const READDIR: &str = "readdir";
}
