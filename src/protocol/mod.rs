//! Protocol Module
//!
//! Defines the wire protocol for client-server communication.
//!
//! ## Protocol Format (length-prefixed binary)
//!
//! ### Frame Format
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (4)  │   Payload (bincode)         │
//! └──────────┴─────────────────────────────┘
//! ```
//! `Len` is big-endian and counts payload bytes only.
//!
//! ### Payloads
//! - Client → server: [`Request`] holding the parsed commands. The
//!   dispatcher accepts exactly one command per request.
//! - Server → client: [`Response`], either a reply, an error or a watch
//!   push notification.

mod command;
mod response;
mod codec;

pub use command::{Command, Request};
pub use response::{Response, Value};
pub use codec::{
    encode_request, decode_request, parse_request,
    encode_response, decode_response,
    read_frame, write_frame,
    read_request, write_request,
    read_response, write_response,
    HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
