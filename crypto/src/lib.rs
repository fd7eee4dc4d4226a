//! Dispatch to the cryptographic backend selected by cargo features.
//!
//! Backends implement `shoals_shared::Crypto`; the protocol crates are
//! generic over that trait and never name a backend directly. Hosts use the
//! RustCrypto backend (the default); constrained targets plug in their own.
#![no_std]

pub use shoals_shared::Crypto as CryptoTrait;

#[cfg(feature = "rustcrypto")]
mod rustcrypto {
    pub use shoals_crypto_rustcrypto::Crypto;

    /// A backend seeded from the operating system's entropy source.
    pub fn default_crypto() -> Crypto<rand_core::OsRng> {
        Crypto::new(rand_core::OsRng)
    }
}

#[cfg(feature = "rustcrypto")]
pub use rustcrypto::*;
