//! IPC protocol between the `meetring` CLI and the daemon.
//!
//! Messages are length-prefixed JSON (4-byte big-endian length, then the
//! payload) wrapped in an [`Envelope`] carrying the protocol version and a
//! request id. Requests are keyed by an `action` string; responses by `type`.
//!
//! ```rust
//! use meetring_protocol::{Envelope, Request, decode_message, encode_message};
//!
//! let request = Envelope::request("req-1", Request::CheckAuth);
//! let bytes = encode_message(&request).unwrap();
//! let decoded: Envelope<Request> = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.payload, Request::CheckAuth);
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{decode_message, encode_message, read_frame, write_frame};
pub use types::{AuthStatus, Envelope, ErrorCode, ErrorResponse, Request, Response, StatusUpdate};

pub const PROTOCOL_VERSION: &str = "1";

/// Maximum frame payload (1 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
