//! Worker transport
//!
//! The toolchain runs on a compute thread behind a message channel, the way it
//! would run in a background worker next to a UI thread. The interactive side
//! talks to it through [`WorkerTransport`]; the only blocking handshake between
//! the two is [`shared::SharedInput`], used when a sandboxed program reads stdin.

pub mod compute;
pub mod error;
pub mod protocol;
pub mod shared;
pub mod transport;

pub use error::TransportError;
pub use protocol::{HostMessage, Request, Response, ResponseId};
pub use shared::{LineReply, SharedInput};
pub use transport::{PendingResponse, WorkerTransport};
