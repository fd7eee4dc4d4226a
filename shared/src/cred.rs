use crate::*;

pub const MAX_CRED_LEN: usize = 192;
pub type BufferCred = ByteBuffer<MAX_CRED_LEN>;

/// An authentication credential in CCS form (an RFC 8392 claims set carrying
/// a COSE_Key in its `cnf` claim), together with the fields EDHOC needs from
/// it: the kid and the public key coordinates.
///
/// A credential identified only by kid (as received in a compact `ID_CRED_X`)
/// has an empty `value`; such a credential can be compared against a stored
/// one but carries no key material of its own.
#[derive(Clone, Copy, Debug)]
pub struct CredentialRPK {
    pub value: BufferCred,
    pub public_key: BytesEcdhElem,
    pub public_key_y: Option<BytesEcdhElem>,
    pub kid: u8,
}

impl CredentialRPK {
    pub fn new(value: BufferCred) -> Result<Self, EDHOCError> {
        let (kid, public_key, public_key_y) = Self::parse_ccs(value.as_slice())?;
        Ok(CredentialRPK {
            value,
            public_key,
            public_key_y,
            kid,
        })
    }

    /// Reference-only credential, known by kid alone.
    pub fn new_from_kid(kid: u8) -> Self {
        CredentialRPK {
            value: BufferCred::new(),
            public_key: [0x00; ECDH_ELEM_LEN],
            public_key_y: None,
            kid,
        }
    }

    pub fn reference_only(&self) -> bool {
        self.value.is_empty()
    }

    /// `ID_CRED_X` as the kid map `{4: h'kid'}`.
    pub fn get_id_cred(&self) -> BytesIdCred {
        [0xa1, 0x04, 0x41, self.kid]
    }

    fn parse_ccs(
        value: &[u8],
    ) -> Result<(u8, BytesEcdhElem, Option<BytesEcdhElem>), EDHOCError> {
        let mut kid = None;
        let mut x = None;
        let mut y = None;

        let mut decoder = CBORDecoder::new(value);
        let claims = decoder.map()?;
        for _ in 0..claims {
            let claim = decoder.i8()?;
            if claim == 8 {
                // cnf claim, carrying the COSE_Key under its label 1
                let cnf = decoder.map()?;
                for _ in 0..cnf {
                    if decoder.i8()? == 1 {
                        let params = decoder.map()?;
                        for _ in 0..params {
                            match decoder.i8()? {
                                2 => {
                                    let id = decoder.bytes()?;
                                    kid = Some(*id.first().ok_or(EDHOCError::ParsingError)?);
                                }
                                -2 => {
                                    let mut elem: BytesEcdhElem = [0x00; ECDH_ELEM_LEN];
                                    elem.copy_from_slice(decoder.bytes_sized(ECDH_ELEM_LEN)?);
                                    x = Some(elem);
                                }
                                -3 => {
                                    let mut elem: BytesEcdhElem = [0x00; ECDH_ELEM_LEN];
                                    elem.copy_from_slice(decoder.bytes_sized(ECDH_ELEM_LEN)?);
                                    y = Some(elem);
                                }
                                _ => decoder.skip()?,
                            }
                        }
                    } else {
                        decoder.skip()?;
                    }
                }
            } else {
                decoder.skip()?;
            }
        }

        match (kid, x) {
            (Some(kid), Some(x)) => Ok((kid, x, y)),
            _ => Err(EDHOCError::ParsingError),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    const CRED_TV: &[u8] = &hex!("A2026008A101A5010202410A2001215820BBC34960526EA4D32E940CAD2A234148DDC21791A12AFBCBAC93622046DD44F02258204519E257236B2A0CE2023F0931F1F386CA7AFDA64FCDE0108C224C51EABF6072");

    #[test]
    fn test_parse_ccs() {
        let cred = CredentialRPK::new(CRED_TV.try_into().unwrap()).unwrap();
        assert_eq!(cred.kid, 0x0a);
        assert_eq!(
            cred.public_key,
            hex!("BBC34960526EA4D32E940CAD2A234148DDC21791A12AFBCBAC93622046DD44F0")
        );
        assert!(cred.public_key_y.is_some());
        assert!(!cred.reference_only());
        assert_eq!(cred.get_id_cred(), [0xa1, 0x04, 0x41, 0x0a]);
    }

    #[test]
    fn test_reference_only() {
        let cred = CredentialRPK::new_from_kid(0x2b);
        assert!(cred.reference_only());
        assert_eq!(cred.kid, 0x2b);
    }

    #[test]
    fn test_parse_garbage() {
        let garbage: &[u8] = &hex!("0102030405");
        assert!(CredentialRPK::new(garbage.try_into().unwrap()).is_err());
    }
}
