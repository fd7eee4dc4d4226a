//! A lightweight, `#![no_std]` CoAP message model, ideal for embedded
//! environments.
//!
//! This crate provides the types used to decode, inspect and re-encode CoAP
//! messages (RFC 7252) without allocating: a parsed [Packet] borrows its
//! token, option values and payload from the input buffer, and serialization
//! writes into a caller-provided buffer. Option records are kept in ascending
//! option-number order; the wire deltas are recomputed on serialization.
//!
//! The model is deliberately small. Transport concerns (retransmission,
//! deduplication, block-wise transfer) belong to the embedding.
#![cfg_attr(not(test), no_std)]

pub mod error;
mod header;
mod packet;

pub use error::MessageError;
pub use header::{Header, MessageClass, MessageType, RequestType, ResponseType};
pub use packet::{
    parse_options_and_payload, serialize_options, CoapOption, OptionList, OptionRecord, Packet,
    COAP_PAYLOAD_MARKER, MAX_OPTION_COUNT, MAX_TOKEN_LEN,
};
