//! Crypto backend for the shoals crates over the RustCrypto stack.
//!
//! Covers every algorithm the cipher-suite and OSCORE configuration surfaces
//! can name: AES-CCM (both tag lengths), AES-128-GCM, ChaCha20-Poly1305,
//! HKDF over SHA-256/384, X25519 and P-256 ECDH, Ed25519 and ECDSA P-256
//! signatures.
#![no_std]

use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use ccm::consts::{U13, U16, U8};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::elliptic_curve::point::DecompressPoint;
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::elliptic_curve::subtle::Choice;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha384};

use shoals_shared::{
    AeadAlg, BytesEcdhElem, BytesHashLen, BytesMaxHash, BytesSignature, Crypto as CryptoTrait,
    CryptoError, EcdhCurve, HkdfAlg, SignatureAlg, MAX_HASH_LEN, SHA256_DIGEST_LEN,
};

type AesCcm8 = ccm::Ccm<aes::Aes128, U8, U13>;
type AesCcm16 = ccm::Ccm<aes::Aes128, U16, U13>;

/// A [CryptoTrait] implementation over the RustCrypto crates, generic over
/// the random number source.
pub struct Crypto<Rng: RngCore + CryptoRng> {
    rng: Rng,
}

impl<Rng: RngCore + CryptoRng> Crypto<Rng> {
    pub const fn new(rng: Rng) -> Self {
        Self { rng }
    }
}

impl<Rng: RngCore + CryptoRng> core::fmt::Debug for Crypto<Rng> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("shoals_crypto_rustcrypto::Crypto")
    }
}

fn seal<A: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
    ciphertext: &mut [u8],
) -> Result<usize, CryptoError> {
    let cipher = A::new_from_slice(key).map_err(|_| CryptoError::UnsupportedAlgorithm)?;
    if nonce.len() != core::mem::size_of::<Nonce<A>>() {
        return Err(CryptoError::UnsupportedAlgorithm);
    }
    let body_len = plaintext.len();
    let Some(body) = ciphertext.get_mut(..body_len) else {
        return Err(CryptoError::BufferTooSmall);
    };
    body.copy_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, body)
        .map_err(|_| CryptoError::BufferTooSmall)?;
    let total = body_len + tag.len();
    let Some(tag_out) = ciphertext.get_mut(body_len..total) else {
        return Err(CryptoError::BufferTooSmall);
    };
    tag_out.copy_from_slice(&tag);
    Ok(total)
}

fn open<A: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    plaintext: &mut [u8],
) -> Result<usize, CryptoError> {
    let cipher = A::new_from_slice(key).map_err(|_| CryptoError::UnsupportedAlgorithm)?;
    if nonce.len() != core::mem::size_of::<Nonce<A>>() {
        return Err(CryptoError::UnsupportedAlgorithm);
    }
    let tag_len = core::mem::size_of::<Tag<A>>();
    let body_len = ciphertext
        .len()
        .checked_sub(tag_len)
        .ok_or(CryptoError::DecryptionFailed)?;
    let Some(body_out) = plaintext.get_mut(..body_len) else {
        return Err(CryptoError::BufferTooSmall);
    };
    body_out.copy_from_slice(&ciphertext[..body_len]);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            body_out,
            Tag::<A>::from_slice(&ciphertext[body_len..]),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(body_len)
}

fn p256_public_from_x(x: &BytesEcdhElem, y: Option<&BytesEcdhElem>) -> Option<p256::PublicKey> {
    match y {
        Some(y) => {
            let point = p256::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(x),
                GenericArray::from_slice(y),
                false,
            );
            p256::PublicKey::from_encoded_point(&point).into()
        }
        None => {
            // x-only: lift to either of the two conjugate points; their x
            // coordinate (all ECDH ever uses) is the same
            let affine = p256::AffinePoint::decompress(GenericArray::from_slice(x), Choice::from(0));
            Option::<p256::AffinePoint>::from(affine).and_then(|a| p256::PublicKey::from_affine(a).ok())
        }
    }
}

impl<Rng: RngCore + CryptoRng> CryptoTrait for Crypto<Rng> {
    fn sha256_digest(&mut self, message: &[u8]) -> BytesHashLen {
        Sha256::digest(message).into()
    }

    fn hkdf_extract(&mut self, alg: HkdfAlg, salt: &[u8], ikm: &[u8]) -> BytesMaxHash {
        let mut out: BytesMaxHash = [0x00; MAX_HASH_LEN];
        match alg {
            HkdfAlg::Sha256 => {
                let (prk, _) = hkdf::Hkdf::<Sha256>::extract(Some(salt), ikm);
                out[..SHA256_DIGEST_LEN].copy_from_slice(&prk);
            }
            HkdfAlg::Sha384 => {
                let (prk, _) = hkdf::Hkdf::<Sha384>::extract(Some(salt), ikm);
                out.copy_from_slice(&prk);
            }
        }
        out
    }

    fn hkdf_expand(&mut self, alg: HkdfAlg, prk: &[u8], info: &[u8], okm: &mut [u8]) {
        match alg {
            HkdfAlg::Sha256 => hkdf::Hkdf::<Sha256>::from_prk(prk)
                .expect("PRK is one hash long")
                .expand(info, okm)
                .expect("OKM length within HKDF bounds"),
            HkdfAlg::Sha384 => hkdf::Hkdf::<Sha384>::from_prk(prk)
                .expect("PRK is one hash long")
                .expand(info, okm)
                .expect("OKM length within HKDF bounds"),
        }
    }

    fn aead_encrypt(
        &mut self,
        alg: AeadAlg,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> Result<usize, CryptoError> {
        match alg {
            AeadAlg::AesCcm16_64_128 => seal::<AesCcm8>(key, nonce, aad, plaintext, ciphertext),
            AeadAlg::AesCcm16_128_128 => seal::<AesCcm16>(key, nonce, aad, plaintext, ciphertext),
            AeadAlg::A128Gcm => seal::<aes_gcm::Aes128Gcm>(key, nonce, aad, plaintext, ciphertext),
            AeadAlg::ChaCha20Poly1305 => {
                seal::<chacha20poly1305::ChaCha20Poly1305>(key, nonce, aad, plaintext, ciphertext)
            }
        }
    }

    fn aead_decrypt(
        &mut self,
        alg: AeadAlg,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        plaintext: &mut [u8],
    ) -> Result<usize, CryptoError> {
        match alg {
            AeadAlg::AesCcm16_64_128 => open::<AesCcm8>(key, nonce, aad, ciphertext, plaintext),
            AeadAlg::AesCcm16_128_128 => open::<AesCcm16>(key, nonce, aad, ciphertext, plaintext),
            AeadAlg::A128Gcm => open::<aes_gcm::Aes128Gcm>(key, nonce, aad, ciphertext, plaintext),
            AeadAlg::ChaCha20Poly1305 => {
                open::<chacha20poly1305::ChaCha20Poly1305>(key, nonce, aad, ciphertext, plaintext)
            }
        }
    }

    fn ecdh(
        &mut self,
        curve: EcdhCurve,
        private_key: &BytesEcdhElem,
        public_key: &BytesEcdhElem,
    ) -> BytesEcdhElem {
        match curve {
            EcdhCurve::X25519 => x25519_dalek::x25519(*private_key, *public_key),
            EcdhCurve::P256 => {
                let secret =
                    p256::SecretKey::from_slice(private_key).expect("valid P-256 scalar");
                let public =
                    p256_public_from_x(public_key, None).expect("valid P-256 x-coordinate");
                let shared = p256::ecdh::diffie_hellman(
                    secret.to_nonzero_scalar(),
                    public.as_affine(),
                );
                let mut out: BytesEcdhElem = [0x00; 32];
                out.copy_from_slice(shared.raw_secret_bytes());
                out
            }
        }
    }

    fn generate_key_pair(&mut self, curve: EcdhCurve) -> (BytesEcdhElem, BytesEcdhElem) {
        match curve {
            EcdhCurve::X25519 => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(&mut self.rng);
                let public = x25519_dalek::PublicKey::from(&secret);
                (secret.to_bytes(), public.to_bytes())
            }
            EcdhCurve::P256 => {
                let secret = p256::SecretKey::random(&mut self.rng);
                let public = secret.public_key();
                let point = p256::EncodedPoint::from(public);
                let mut x: BytesEcdhElem = [0x00; 32];
                x.copy_from_slice(point.x().expect("generated point is not at infinity"));
                let mut private: BytesEcdhElem = [0x00; 32];
                private.copy_from_slice(&secret.to_bytes());
                (private, x)
            }
        }
    }

    fn sign(
        &mut self,
        alg: SignatureAlg,
        private_key: &BytesEcdhElem,
        message: &[u8],
    ) -> BytesSignature {
        match alg {
            SignatureAlg::EdDsa => {
                let key = ed25519_dalek::SigningKey::from_bytes(private_key);
                key.sign(message).to_bytes()
            }
            SignatureAlg::Es256 => {
                let key = p256::ecdsa::SigningKey::from_slice(private_key)
                    .expect("valid P-256 scalar");
                let signature: p256::ecdsa::Signature = key.sign(message);
                let mut out: BytesSignature = [0x00; 64];
                out.copy_from_slice(&signature.to_bytes());
                out
            }
        }
    }

    fn verify(
        &mut self,
        alg: SignatureAlg,
        public_key: &BytesEcdhElem,
        public_key_y: Option<&BytesEcdhElem>,
        message: &[u8],
        signature: &BytesSignature,
    ) -> Result<(), CryptoError> {
        match alg {
            SignatureAlg::EdDsa => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
                    .map_err(|_| CryptoError::SignatureInvalid)?;
                let signature = ed25519_dalek::Signature::from_bytes(signature);
                key.verify(message, &signature)
                    .map_err(|_| CryptoError::SignatureInvalid)
            }
            SignatureAlg::Es256 => {
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::SignatureInvalid)?;
                let verify_with = |parity: u8| -> Result<(), CryptoError> {
                    let affine = p256::AffinePoint::decompress(
                        GenericArray::from_slice(public_key),
                        Choice::from(parity),
                    );
                    let affine = Option::<p256::AffinePoint>::from(affine)
                        .ok_or(CryptoError::SignatureInvalid)?;
                    let key = p256::ecdsa::VerifyingKey::from_affine(affine)
                        .map_err(|_| CryptoError::SignatureInvalid)?;
                    key.verify(message, &signature)
                        .map_err(|_| CryptoError::SignatureInvalid)
                };
                match public_key_y {
                    Some(y) => {
                        let public = p256_public_from_x(public_key, Some(y))
                            .ok_or(CryptoError::SignatureInvalid)?;
                        let key = p256::ecdsa::VerifyingKey::from_affine(*public.as_affine())
                            .map_err(|_| CryptoError::SignatureInvalid)?;
                        key.verify(message, &signature)
                            .map_err(|_| CryptoError::SignatureInvalid)
                    }
                    // x-only credential: the signature verifies against
                    // exactly one of the two conjugate points
                    None => verify_with(0).or_else(|_| verify_with(1)),
                }
            }
        }
    }

    fn get_random_byte(&mut self) -> u8 {
        self.rng.next_u32() as u8
    }

    fn fill_random(&mut self, buffer: &mut [u8]) {
        self.rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// xorshift-based stand-in so the tests run without an OS entropy source.
    struct TestRng(u64);

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for TestRng {}

    fn test_crypto() -> Crypto<TestRng> {
        Crypto::new(TestRng(0x2545f4914f6cdd1d))
    }

    #[test]
    fn test_aead_roundtrip_all_algorithms() {
        let mut crypto = test_crypto();
        let algs = [
            (AeadAlg::AesCcm16_64_128, 16, 13),
            (AeadAlg::AesCcm16_128_128, 16, 13),
            (AeadAlg::A128Gcm, 16, 12),
            (AeadAlg::ChaCha20Poly1305, 32, 12),
        ];
        for (alg, key_len, nonce_len) in algs {
            let key = [0x42u8; 32];
            let nonce = [0x24u8; 13];
            let mut ciphertext = [0u8; 64];
            let len = crypto
                .aead_encrypt(
                    alg,
                    &key[..key_len],
                    &nonce[..nonce_len],
                    b"aad",
                    b"hello",
                    &mut ciphertext,
                )
                .unwrap();
            assert_eq!(len, 5 + alg.tag_len());

            let mut plaintext = [0u8; 64];
            let len = crypto
                .aead_decrypt(
                    alg,
                    &key[..key_len],
                    &nonce[..nonce_len],
                    b"aad",
                    &ciphertext[..len],
                    &mut plaintext,
                )
                .unwrap();
            assert_eq!(&plaintext[..len], b"hello");

            // flipped bit in the tag
            let mut tampered = ciphertext;
            tampered[5] ^= 0x01;
            assert_eq!(
                crypto
                    .aead_decrypt(
                        alg,
                        &key[..key_len],
                        &nonce[..nonce_len],
                        b"aad",
                        &tampered[..5 + alg.tag_len()],
                        &mut plaintext,
                    )
                    .unwrap_err(),
                CryptoError::DecryptionFailed
            );
        }
    }

    #[test]
    fn test_ecdh_agreement() {
        let mut crypto = test_crypto();
        for curve in [EcdhCurve::X25519, EcdhCurve::P256] {
            let (a_priv, a_pub) = crypto.generate_key_pair(curve);
            let (b_priv, b_pub) = crypto.generate_key_pair(curve);
            let ab = crypto.ecdh(curve, &a_priv, &b_pub);
            let ba = crypto.ecdh(curve, &b_priv, &a_pub);
            assert_eq!(ab, ba);
        }
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let mut crypto = test_crypto();
        let seed = [0x07u8; 32];
        let public = ed25519_dalek::SigningKey::from_bytes(&seed)
            .verifying_key()
            .to_bytes();
        let signature = crypto.sign(SignatureAlg::EdDsa, &seed, b"message");
        crypto
            .verify(SignatureAlg::EdDsa, &public, None, b"message", &signature)
            .unwrap();
        assert!(crypto
            .verify(SignatureAlg::EdDsa, &public, None, b"other", &signature)
            .is_err());
    }

    #[test]
    fn test_es256_sign_verify_x_only() {
        let mut crypto = test_crypto();
        let (private, public_x) = crypto.generate_key_pair(EcdhCurve::P256);
        let signature = crypto.sign(SignatureAlg::Es256, &private, b"message");
        // x-only verification must succeed regardless of the point's parity
        crypto
            .verify(SignatureAlg::Es256, &public_x, None, b"message", &signature)
            .unwrap();
        assert!(crypto
            .verify(SignatureAlg::Es256, &public_x, None, b"other", &signature)
            .is_err());
    }

    #[test]
    fn test_hkdf_sha256_rfc5869_case_1() {
        let mut crypto = test_crypto();
        let ikm = [0x0bu8; 22];
        let salt: [u8; 13] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
        ];
        let info: [u8; 10] = [0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9];
        let prk = crypto.hkdf_extract(HkdfAlg::Sha256, &salt, &ikm);
        let mut okm = [0u8; 42];
        crypto.hkdf_expand(HkdfAlg::Sha256, &prk[..32], &info, &mut okm);
        assert_eq!(
            okm[..8],
            [0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a]
        );
    }
}
