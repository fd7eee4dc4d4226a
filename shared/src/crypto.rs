use crate::{BytesEcdhElem, BytesHashLen, BytesMaxHash, BytesSignature};

/// AEAD algorithms usable for EDHOC ciphertexts and OSCORE payloads, by their
/// COSE registrations.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum AeadAlg {
    AesCcm16_64_128,
    AesCcm16_128_128,
    A128Gcm,
    ChaCha20Poly1305,
}

impl AeadAlg {
    pub fn from_cose_id(id: i32) -> Option<AeadAlg> {
        match id {
            10 => Some(AeadAlg::AesCcm16_64_128),
            30 => Some(AeadAlg::AesCcm16_128_128),
            1 => Some(AeadAlg::A128Gcm),
            24 => Some(AeadAlg::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub const fn cose_id(self) -> i32 {
        match self {
            AeadAlg::AesCcm16_64_128 => 10,
            AeadAlg::AesCcm16_128_128 => 30,
            AeadAlg::A128Gcm => 1,
            AeadAlg::ChaCha20Poly1305 => 24,
        }
    }

    pub const fn key_len(self) -> usize {
        match self {
            AeadAlg::ChaCha20Poly1305 => 32,
            _ => 16,
        }
    }

    pub const fn nonce_len(self) -> usize {
        match self {
            AeadAlg::AesCcm16_64_128 | AeadAlg::AesCcm16_128_128 => 13,
            AeadAlg::A128Gcm | AeadAlg::ChaCha20Poly1305 => 12,
        }
    }

    pub const fn tag_len(self) -> usize {
        match self {
            AeadAlg::AesCcm16_64_128 => 8,
            _ => 16,
        }
    }
}

/// Hash algorithms usable with HKDF.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum HkdfAlg {
    Sha256,
    Sha384,
}

impl HkdfAlg {
    pub const fn hash_len(self) -> usize {
        match self {
            HkdfAlg::Sha256 => 32,
            HkdfAlg::Sha384 => 48,
        }
    }
}

/// Curves usable for the ephemeral and static Diffie-Hellman exchanges.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum EcdhCurve {
    X25519,
    P256,
}

/// Signature algorithms usable for signature-based authentication methods.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub enum SignatureAlg {
    EdDsa,
    Es256,
}

#[derive(Debug, PartialEq)]
#[repr(C)]
pub enum CryptoError {
    DecryptionFailed,
    SignatureInvalid,
    UnsupportedAlgorithm,
    BufferTooSmall,
}

/// The interface between the protocol crates and a cryptographic backend.
///
/// All inputs and outputs are raw byte strings; point formats are the
/// protocols' (x-coordinate for P-256, u-coordinate for X25519). Backends are
/// expected to be constant-time in key material.
pub trait Crypto: core::fmt::Debug {
    fn sha256_digest(&mut self, message: &[u8]) -> BytesHashLen;

    /// HKDF-Extract over the hash of `alg`; the PRK occupies the first
    /// `alg.hash_len()` bytes of the result.
    fn hkdf_extract(&mut self, alg: HkdfAlg, salt: &[u8], ikm: &[u8]) -> BytesMaxHash;

    /// HKDF-Expand over the hash of `alg`, filling all of `okm`.
    ///
    /// `okm.len()` must not exceed 255 times the hash length; all callers in
    /// this workspace stay well below that bound.
    fn hkdf_expand(&mut self, alg: HkdfAlg, prk: &[u8], info: &[u8], okm: &mut [u8]);

    /// Seals `plaintext` into `ciphertext` (plaintext followed by the tag) and
    /// returns the written length.
    fn aead_encrypt(
        &mut self,
        alg: AeadAlg,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> Result<usize, CryptoError>;

    /// Opens `ciphertext` (with trailing tag) into `plaintext` and returns the
    /// written length. Tag mismatch yields [CryptoError::DecryptionFailed] and
    /// leaves no plaintext behind.
    fn aead_decrypt(
        &mut self,
        alg: AeadAlg,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        plaintext: &mut [u8],
    ) -> Result<usize, CryptoError>;

    fn ecdh(
        &mut self,
        curve: EcdhCurve,
        private_key: &BytesEcdhElem,
        public_key: &BytesEcdhElem,
    ) -> BytesEcdhElem;

    /// Generates an ephemeral key pair, returned as (private, public).
    fn generate_key_pair(&mut self, curve: EcdhCurve) -> (BytesEcdhElem, BytesEcdhElem);

    fn sign(
        &mut self,
        alg: SignatureAlg,
        private_key: &BytesEcdhElem,
        message: &[u8],
    ) -> BytesSignature;

    /// Verifies a signature against a public key given as its x-coordinate
    /// (Ed25519: the key itself) and, for ES256, an optional y-coordinate.
    /// Without a y-coordinate the backend reconstructs the point from x.
    fn verify(
        &mut self,
        alg: SignatureAlg,
        public_key: &BytesEcdhElem,
        public_key_y: Option<&BytesEcdhElem>,
        message: &[u8],
        signature: &BytesSignature,
    ) -> Result<(), CryptoError>;

    fn get_random_byte(&mut self) -> u8;

    fn fill_random(&mut self, buffer: &mut [u8]);
}
