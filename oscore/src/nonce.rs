//! AEAD nonce construction (RFC 8613, Section 5.2).

use crate::OscoreError;

/// Computes the nonce from the ID of the endpoint that generated the partial
/// IV, the partial IV itself and the common IV:
///
/// ```text
/// nonce = (len(id) || pad(id, nonce_len - 6) || pad(piv, 5)) XOR common_iv
/// ```
///
/// `nonce` must be as long as `common_iv`; both are the AEAD nonce length.
pub fn create_nonce(
    id: &[u8],
    piv: &[u8],
    common_iv: &[u8],
    nonce: &mut [u8],
) -> Result<(), OscoreError> {
    let n = common_iv.len();
    if nonce.len() != n || id.len() > n - 6 || piv.len() > 5 || piv.is_empty() {
        return Err(OscoreError::InvalidContext);
    }

    nonce.fill(0);
    nonce[0] = id.len() as u8;
    let id_end = 1 + (n - 6);
    nonce[id_end - id.len()..id_end].copy_from_slice(id);
    nonce[n - piv.len()..].copy_from_slice(piv);

    for (nonce_byte, iv_byte) in nonce.iter_mut().zip(common_iv) {
        *nonce_byte ^= iv_byte;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    /// RFC 8613 Appendix C.4: empty sender ID, sequence number 20.
    #[test]
    fn test_nonce_request_c4() {
        let common_iv = hex!("4622d4dd6d944168eefb549868");
        let mut nonce = [0u8; 13];
        create_nonce(&[], &[0x14], &common_iv, &mut nonce).unwrap();
        assert_eq!(nonce, hex!("4622d4dd6d944168eefb54987c"));
    }

    #[test]
    fn test_nonce_layout() {
        // zero common IV exposes the plain layout: len(id), padded id,
        // padded piv
        let common_iv = [0u8; 13];
        let mut nonce = [0u8; 13];
        create_nonce(&[0xaa], &[0x01, 0x02], &common_iv, &mut nonce).unwrap();
        assert_eq!(nonce, hex!("01000000000000aa0000000102"));
    }

    #[test]
    fn test_piv_must_be_present() {
        let common_iv = [0u8; 13];
        let mut nonce = [0u8; 13];
        assert!(create_nonce(&[], &[], &common_iv, &mut nonce).is_err());
    }
}
