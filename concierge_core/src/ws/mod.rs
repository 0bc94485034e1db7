//! The WebSocket streaming gateway: token issuance/verification, the raw
//! RFC 6455 codec, and per-connection handling.

pub mod codec;
pub mod gateway;
pub mod token;

pub use gateway::{encode_stream_frame, handle_connection, status_frame, ClientRegistry};
pub use token::{TokenGrant, TokenIssuer};
