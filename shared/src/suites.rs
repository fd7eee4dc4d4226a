use crate::{AeadAlg, EcdhCurve, EDHOCError, HkdfAlg, SignatureAlg};

/// An EDHOC cipher suite (RFC 9528, Section 3.6): the algorithms for the
/// handshake itself plus the application algorithms handed to OSCORE.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct CipherSuite {
    pub id: u8,
    pub aead: AeadAlg,
    pub hash: HkdfAlg,
    pub mac_length: usize,
    pub curve: EcdhCurve,
    pub sign_alg: SignatureAlg,
    pub app_aead: AeadAlg,
    pub app_hash: HkdfAlg,
}

impl CipherSuite {
    /// Looks up one of the supported suites 0..=3.
    pub fn from_id(id: u8) -> Result<CipherSuite, EDHOCError> {
        match id {
            0 => Ok(CipherSuite {
                id: 0,
                aead: AeadAlg::AesCcm16_64_128,
                hash: HkdfAlg::Sha256,
                mac_length: 8,
                curve: EcdhCurve::X25519,
                sign_alg: SignatureAlg::EdDsa,
                app_aead: AeadAlg::AesCcm16_64_128,
                app_hash: HkdfAlg::Sha256,
            }),
            1 => Ok(CipherSuite {
                id: 1,
                aead: AeadAlg::AesCcm16_128_128,
                hash: HkdfAlg::Sha256,
                mac_length: 16,
                curve: EcdhCurve::X25519,
                sign_alg: SignatureAlg::EdDsa,
                app_aead: AeadAlg::AesCcm16_64_128,
                app_hash: HkdfAlg::Sha256,
            }),
            2 => Ok(CipherSuite {
                id: 2,
                aead: AeadAlg::AesCcm16_64_128,
                hash: HkdfAlg::Sha256,
                mac_length: 8,
                curve: EcdhCurve::P256,
                sign_alg: SignatureAlg::Es256,
                app_aead: AeadAlg::AesCcm16_64_128,
                app_hash: HkdfAlg::Sha256,
            }),
            3 => Ok(CipherSuite {
                id: 3,
                aead: AeadAlg::AesCcm16_128_128,
                hash: HkdfAlg::Sha256,
                mac_length: 16,
                curve: EcdhCurve::P256,
                sign_alg: SignatureAlg::Es256,
                app_aead: AeadAlg::AesCcm16_64_128,
                app_hash: HkdfAlg::Sha256,
            }),
            _ => Err(EDHOCError::UnsupportedCipherSuite),
        }
    }

    pub fn key_len(&self) -> usize {
        self.aead.key_len()
    }

    pub fn iv_len(&self) -> usize {
        self.aead.nonce_len()
    }

    pub fn tag_len(&self) -> usize {
        self.aead.tag_len()
    }

    pub fn hash_len(&self) -> usize {
        self.hash.hash_len()
    }
}

/// The suite selected by the initiator is the last element of `SUITES_I`; the
/// responder accepts it iff it appears in its own supported list.
pub fn selected_suite(suites_i: &[u8], supported: &[u8]) -> Result<u8, EDHOCError> {
    let selected = *suites_i.last().ok_or(EDHOCError::ParsingError)?;
    if supported.contains(&selected) {
        Ok(selected)
    } else {
        Err(EDHOCError::UnsupportedCipherSuite)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_suite_lookup() {
        let suite = CipherSuite::from_id(2).unwrap();
        assert_eq!(suite.curve, EcdhCurve::P256);
        assert_eq!(suite.mac_length, 8);
        assert_eq!(suite.tag_len(), 8);
        let suite = CipherSuite::from_id(1).unwrap();
        assert_eq!(suite.curve, EcdhCurve::X25519);
        assert_eq!(suite.tag_len(), 16);
        assert!(CipherSuite::from_id(24).is_err());
    }

    #[test]
    fn test_selected_suite() {
        assert_eq!(selected_suite(&[2], &[0, 1, 2, 3]), Ok(2));
        assert_eq!(selected_suite(&[5, 2], &[0, 1, 2, 3]), Ok(2));
        assert_eq!(
            selected_suite(&[6], &[0, 1]),
            Err(EDHOCError::UnsupportedCipherSuite)
        );
    }
}
