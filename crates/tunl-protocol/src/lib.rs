//! Wire protocol for the tunl control channel.
//!
//! A control channel carries one JSON text frame per message. Every frame
//! is an object with a `type` tag; the closed set of kinds and their fields
//! live in [`messages`], the text codec and its limits in [`codec`].

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, CodecError, MAX_FRAME_BYTES};
pub use messages::{ControlMessage, HeaderValue, Headers};
