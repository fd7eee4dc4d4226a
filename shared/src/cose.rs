use crate::{CBOREncoder, CBORError};

/// COSE context strings (RFC 9052, Sections 4.4 and 5.3).
pub const COSE_ENCRYPT0: &str = "Encrypt0";
pub const COSE_SIGNATURE1: &str = "Signature1";

/// Serializes the Enc_structure `["Encrypt0", protected, external_aad]` used
/// as additional data for every COSE_Encrypt0 in EDHOC and OSCORE.
pub fn encode_enc_structure(
    protected: &[u8],
    external_aad: &[u8],
    out: &mut [u8],
) -> Result<usize, CBORError> {
    let mut encoder = CBOREncoder::new(out);
    encoder.array(3)?;
    encoder.text(COSE_ENCRYPT0)?;
    encoder.bytes(protected)?;
    encoder.bytes(external_aad)?;
    Ok(encoder.position())
}

/// Serializes the Sig_structure `["Signature1", protected, external_aad,
/// payload]` signed by signature-authenticating EDHOC parties.
pub fn encode_sig_structure(
    protected: &[u8],
    external_aad: &[u8],
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, CBORError> {
    let mut encoder = CBOREncoder::new(out);
    encoder.array(4)?;
    encoder.text(COSE_SIGNATURE1)?;
    encoder.bytes(protected)?;
    encoder.bytes(external_aad)?;
    encoder.bytes(payload)?;
    Ok(encoder.position())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_enc_structure() {
        let mut out = [0u8; 64];
        let len = encode_enc_structure(&[], &[0xaa, 0xbb], &mut out).unwrap();
        // ["Encrypt0", h'', h'aabb']
        assert_eq!(
            &out[..len],
            &[
                0x83, 0x68, b'E', b'n', b'c', b'r', b'y', b'p', b't', b'0', 0x40, 0x42, 0xaa, 0xbb
            ]
        );
    }
}
