//! Additional authenticated data construction (RFC 8613, Section 5.4).

use shoals_shared::{encode_enc_structure, AeadAlg, CBOREncoder};

use crate::OscoreError;

// aad_array = [oscore_version, [alg_aead], request_kid, request_piv, options]
const MAX_AAD_ARRAY_LEN: usize = 1 + 1 + 3 + 2 + 9 + 7 + 1;

/// Serializes the full `Enc_structure` over the external AAD array
/// `[oscore_version, [alg_aead], request_kid, request_piv, h'']` into `out`
/// and returns the written length.
///
/// Requests and responses alike authenticate the *request's* kid and partial
/// IV, binding each response to the request it answers. The trailing empty
/// byte string is the (unused) Class I options field.
pub fn create_aad(
    aead_alg: AeadAlg,
    request_kid: &[u8],
    request_piv: &[u8],
    out: &mut [u8],
) -> Result<usize, OscoreError> {
    let mut aad_array = [0u8; MAX_AAD_ARRAY_LEN];
    let mut encoder = CBOREncoder::new(&mut aad_array);
    encoder.array(5)?;
    encoder.uint(crate::OSCORE_VERSION as usize)?;
    encoder.array(1)?;
    encoder.int(aead_alg.cose_id())?;
    encoder.bytes(request_kid)?;
    encoder.bytes(request_piv)?;
    encoder.bytes(&[])?;
    let aad_array_len = encoder.position();

    let len = encode_enc_structure(&[], &aad_array[..aad_array_len], out)?;
    Ok(len)
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    /// RFC 8613 Appendix C.4: empty request kid, partial IV 20.
    #[test]
    fn test_aad_request() {
        let mut out = [0u8; crate::MAX_AAD_LEN];
        let len = create_aad(AeadAlg::AesCcm16_64_128, &[], &[0x14], &mut out).unwrap();
        // Enc_structure over aad_array 8501810a40411440
        assert_eq!(
            &out[..len],
            &hex!("8368456e63727970743040488501810a40411440")
        );
    }
}
