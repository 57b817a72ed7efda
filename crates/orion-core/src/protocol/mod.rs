//! Newline-delimited JSON protocol spoken with the sidecar process.

mod codec;
mod types;

pub use codec::{decode_event, encode_command, CodecError, LineDecoder};
pub use types::{codes, Command, Event, QueryOptions, EVENT_KINDS};
