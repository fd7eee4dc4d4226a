//! Implementation of [OSCORE] (Object Security for Constrained RESTful
//! Environments), protecting CoAP messages end-to-end with keys either
//! pre-provisioned or established by an EDHOC handshake.
//!
//! The two entry points are [coap2oscore] (protect an outbound CoAP message)
//! and [oscore2coap] (unprotect an inbound OSCORE message). Both are pure
//! transformations over caller-provided buffers, driven by a mutable
//! [SecurityContext]; all per-context state (sender sequence number, replay
//! window, cached request correlation data) lives in the context, and all
//! operations on one context must be serialized by the embedding.
//!
//! [OSCORE]: https://datatracker.ietf.org/doc/html/rfc8613
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

mod aad;
mod nonce;
mod option;
mod protect;
mod unprotect;

pub mod context;

pub use aad::create_aad;
pub use context::{
    ContextConfig, ContextSnapshot, ReplayWindow, SecurityContext, MAX_KID_CONTEXT_LEN,
    MAX_KID_LEN, MAX_MASTER_SECRET_LEN, MAX_MASTER_SALT_LEN, MAX_NONCE_LEN,
};
pub use nonce::create_nonce;
pub use option::{
    decode_oscore_option, encode_oscore_option, inner_outer_option_split, is_class_e, piv_to_u64,
    ssn_to_piv, OscoreOption, SplitOptions, ECHO_OPTION, OBSERVE_OPTION, OSCORE_OPTION,
};
pub use protect::coap2oscore;
pub use unprotect::oscore2coap;

use shoals_coap::MessageError;
use shoals_shared::{CBORError, CryptoError, MessageBufferError};

/// Largest OSCORE plaintext (inner code, inner options, inner payload) we
/// handle; everything above is rejected, never reallocated.
pub const MAX_PLAINTEXT_LEN: usize = 1024;
pub const MAX_CIPHERTEXT_LEN: usize = MAX_PLAINTEXT_LEN + 16;
pub const MAX_AAD_LEN: usize = 100;
pub const MAX_PIV_LEN: usize = 5;
pub const OSCORE_OPT_VALUE_LEN: usize =
    2 + MAX_PIV_LEN + MAX_KID_LEN + MAX_KID_CONTEXT_LEN;
/// Largest CoAP message the transform accepts or produces.
pub const MAX_COAP_MSG_LEN: usize = 1280;

/// Sender sequence numbers beyond this cannot be encoded in a 5-byte partial
/// IV; the context refuses to send once it is reached.
pub const MAX_SSN: u64 = (1 << 40) - 1;

pub const OSCORE_VERSION: u8 = 1;
pub const ECHO_VALUE_LEN: usize = 8;

#[derive(Debug, PartialEq)]
pub enum OscoreError {
    /// Input bytes are not a well-formed CoAP/OSCORE message.
    MalformedPacket,
    TooManyOptions,
    BufferTooSmall,
    /// AEAD verification failed. Deliberately carries no detail.
    AuthFailed,
    /// The received (kid, kid context) pair does not address this context.
    ContextNotFound,
    /// The inbound message has no OSCORE option; hand it to the plain CoAP
    /// layer instead.
    NoOscoreOption,
    Replayed,
    SsnExhausted,
    /// First response after reboot lacks the expected ECHO value.
    EchoMismatch,
    InvalidContext,
    UnsupportedAlgorithm,
}

impl From<MessageError> for OscoreError {
    fn from(error: MessageError) -> Self {
        match error {
            MessageError::TooManyOptions => OscoreError::TooManyOptions,
            MessageError::BufferTooSmall => OscoreError::BufferTooSmall,
            _ => OscoreError::MalformedPacket,
        }
    }
}

impl From<MessageBufferError> for OscoreError {
    fn from(_: MessageBufferError) -> Self {
        OscoreError::BufferTooSmall
    }
}

impl From<CBORError> for OscoreError {
    fn from(error: CBORError) -> Self {
        match error {
            CBORError::DecodingError => OscoreError::MalformedPacket,
            CBORError::EncodingError => OscoreError::BufferTooSmall,
        }
    }
}

impl From<CryptoError> for OscoreError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::UnsupportedAlgorithm => OscoreError::UnsupportedAlgorithm,
            CryptoError::BufferTooSmall => OscoreError::BufferTooSmall,
            _ => OscoreError::AuthFailed,
        }
    }
}
