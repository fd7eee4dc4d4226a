//! Option classification, the E/U split and the OSCORE option value codec
//! (RFC 8613, Sections 4, 6.1 and 8).

use shoals_coap::{OptionList, Packet};
use shoals_shared::ByteBuffer;

use crate::context::{MAX_KID_CONTEXT_LEN, MAX_KID_LEN};
use crate::{OscoreError, MAX_PIV_LEN, OSCORE_OPT_VALUE_LEN};

pub const OBSERVE_OPTION: u16 = 6;
pub const OSCORE_OPTION: u16 = 9;
pub const ECHO_OPTION: u16 = 252;

const OSCORE_OPT_KID_K_MASK: u8 = 0x08;
const OSCORE_OPT_KIDC_H_MASK: u8 = 0x10;
const OSCORE_OPT_PIV_N_MASK: u8 = 0x07;
const OSCORE_OPT_RESERVED_MASK: u8 = 0xe0;

/// Class E options are encrypted and integrity protected inside the OSCORE
/// payload; everything not in the small Class U set is Class E
/// (RFC 8613, Section 4.1).
pub fn is_class_e(number: u16) -> bool {
    // Uri-Host, Uri-Port, OSCORE, Proxy-Uri, Proxy-Scheme stay outer
    !matches!(number, 3 | 7 | 9 | 35 | 39)
}

/// The two halves of a split option list.
#[derive(Debug, Default)]
pub struct SplitOptions<'a> {
    pub e: OptionList<'a>,
    pub u: OptionList<'a>,
}

/// Splits a packet's options into the E-options that go into the plaintext
/// and the U-options that stay on the outer packet.
///
/// Observe is special (RFC 8613, Section 4.1.3.5): it appears in both lists;
/// in a request both carry the original value, in a response (notification)
/// the inner value is elided.
pub fn inner_outer_option_split<'a>(packet: &Packet<'a>) -> Result<SplitOptions<'a>, OscoreError> {
    let mut split = SplitOptions::default();

    for record in packet.options.iter() {
        match record.number {
            OBSERVE_OPTION => {
                if packet.is_request() {
                    // registrations/cancellations are requests
                    split.e.push(record.number, record.value)?;
                } else {
                    // notifications are responses; the inner value is elided
                    split.e.push(record.number, &[])?;
                }
                split.u.push(record.number, record.value)?;
            }
            number if is_class_e(number) => {
                split.e.push(record.number, record.value)?;
            }
            _ => {
                split.u.push(record.number, record.value)?;
            }
        }
    }

    Ok(split)
}

/// Decoded OSCORE option value.
#[derive(Debug, Default, PartialEq)]
pub struct OscoreOption {
    pub piv: ByteBuffer<MAX_PIV_LEN>,
    pub kid: Option<ByteBuffer<MAX_KID_LEN>>,
    pub kid_context: Option<ByteBuffer<MAX_KID_CONTEXT_LEN>>,
}

/// Encodes the OSCORE option value: flag byte, partial IV, length-prefixed
/// kid context, kid. An absent-everything combination encodes as the empty
/// value.
pub fn encode_oscore_option(
    piv: &[u8],
    kid: Option<&[u8]>,
    kid_context: Option<&[u8]>,
    out: &mut ByteBuffer<OSCORE_OPT_VALUE_LEN>,
) -> Result<(), OscoreError> {
    out.len = 0;
    if piv.is_empty() && kid.is_none() && kid_context.is_none() {
        return Ok(());
    }
    if piv.len() > MAX_PIV_LEN {
        return Err(OscoreError::BufferTooSmall);
    }

    let mut flags = piv.len() as u8;
    if kid.is_some() {
        flags |= OSCORE_OPT_KID_K_MASK;
    }
    if kid_context.is_some() {
        flags |= OSCORE_OPT_KIDC_H_MASK;
    }
    out.push(flags)?;
    out.extend_from_slice(piv)?;
    if let Some(kid_context) = kid_context {
        out.push(kid_context.len() as u8)?;
        out.extend_from_slice(kid_context)?;
    }
    if let Some(kid) = kid {
        out.extend_from_slice(kid)?;
    }
    Ok(())
}

/// Decodes an OSCORE option value. The empty value is valid and stands for
/// "no PIV, no kid, no kid context" (typical responses).
pub fn decode_oscore_option(value: &[u8]) -> Result<OscoreOption, OscoreError> {
    let mut option = OscoreOption::default();
    let Some((&flags, mut rest)) = value.split_first() else {
        return Ok(option);
    };

    if flags & OSCORE_OPT_RESERVED_MASK != 0 {
        return Err(OscoreError::MalformedPacket);
    }
    let piv_len = (flags & OSCORE_OPT_PIV_N_MASK) as usize;
    if piv_len > MAX_PIV_LEN {
        return Err(OscoreError::MalformedPacket);
    }

    if rest.len() < piv_len {
        return Err(OscoreError::MalformedPacket);
    }
    option.piv.fill_with_slice(&rest[..piv_len])?;
    rest = &rest[piv_len..];

    if flags & OSCORE_OPT_KIDC_H_MASK != 0 {
        let Some((&s, tail)) = rest.split_first() else {
            return Err(OscoreError::MalformedPacket);
        };
        if tail.len() < s as usize {
            return Err(OscoreError::MalformedPacket);
        }
        option.kid_context = Some(
            ByteBuffer::new_from_slice(&tail[..s as usize])
                .map_err(|_| OscoreError::MalformedPacket)?,
        );
        rest = &tail[s as usize..];
    }

    if flags & OSCORE_OPT_KID_K_MASK != 0 {
        option.kid =
            Some(ByteBuffer::new_from_slice(rest).map_err(|_| OscoreError::MalformedPacket)?);
    } else if !rest.is_empty() {
        return Err(OscoreError::MalformedPacket);
    }

    Ok(option)
}

/// Minimal big-endian encoding of a sender sequence number; zero encodes as
/// the single byte `0x00` (RFC 8613, Section 6.1).
pub fn ssn_to_piv(ssn: u64) -> ByteBuffer<MAX_PIV_LEN> {
    let bytes = ssn.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    // infallible: at most 5 significant bytes below MAX_SSN
    ByteBuffer::new_from_slice(&bytes[first.max(3)..]).unwrap_or_default()
}

pub fn piv_to_u64(piv: &[u8]) -> u64 {
    piv.iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;
    use shoals_coap::{MessageClass, RequestType, ResponseType};

    #[test]
    fn test_class_split() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.options.push(3, b"host").unwrap(); // Uri-Host: U
        packet.options.push(11, b"tv1").unwrap(); // Uri-Path: E
        packet.options.push(12, &[0x00]).unwrap(); // Content-Format: E
        packet.options.push(35, b"coap://p").unwrap(); // Proxy-Uri: U

        let split = inner_outer_option_split(&packet).unwrap();
        let e_numbers: [u16; 2] = [11, 12];
        let u_numbers: [u16; 2] = [3, 35];
        assert_eq!(split.e.len(), 2);
        for (record, n) in split.e.iter().zip(e_numbers) {
            assert_eq!(record.number, n);
        }
        assert_eq!(split.u.len(), 2);
        for (record, n) in split.u.iter().zip(u_numbers) {
            assert_eq!(record.number, n);
        }
    }

    #[test]
    fn test_observe_request_in_both() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.options.push(6, &[0x00]).unwrap();

        let split = inner_outer_option_split(&packet).unwrap();
        assert_eq!(split.e.find(6).unwrap().value, &[0x00]);
        assert_eq!(split.u.find(6).unwrap().value, &[0x00]);
    }

    #[test]
    fn test_observe_notification_inner_elided() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.options.push(6, &[0x2a]).unwrap();

        let split = inner_outer_option_split(&packet).unwrap();
        assert_eq!(split.e.find(6).unwrap().value, &[] as &[u8]);
        assert_eq!(split.u.find(6).unwrap().value, &[0x2a]);
    }

    /// RFC 8613 Appendix C.4: kid present but empty, partial IV 20.
    #[test]
    fn test_encode_option_c4() {
        let mut out = ByteBuffer::new();
        encode_oscore_option(&[0x14], Some(&[]), None, &mut out).unwrap();
        assert_eq!(out.as_slice(), &hex!("0914"));
    }

    #[test]
    fn test_option_roundtrip() {
        let cases: &[(&[u8], Option<&[u8]>, Option<&[u8]>)] = &[
            (&[0x14], Some(&[]), None),
            (&[0x00], Some(&[0x42]), None),
            (&[0x01, 0x02], Some(&[0x01]), Some(&[0xaa, 0xbb])),
            (&[0x05], None, None),
            (&[], None, None),
        ];
        for (piv, kid, kid_context) in cases {
            let mut out = ByteBuffer::new();
            encode_oscore_option(piv, *kid, *kid_context, &mut out).unwrap();
            let decoded = decode_oscore_option(out.as_slice()).unwrap();
            assert_eq!(decoded.piv.as_slice(), *piv);
            assert_eq!(decoded.kid.as_ref().map(|k| k.as_slice()), *kid);
            assert_eq!(
                decoded.kid_context.as_ref().map(|k| k.as_slice()),
                *kid_context
            );
        }
    }

    #[test]
    fn test_decode_reserved_bits_rejected() {
        assert_eq!(
            decode_oscore_option(&[0x29, 0x14]).unwrap_err(),
            OscoreError::MalformedPacket
        );
    }

    #[test]
    fn test_decode_truncated_rejected() {
        // flag byte announces a 2-byte piv, only one present
        assert_eq!(
            decode_oscore_option(&[0x0a, 0x14]).unwrap_err(),
            OscoreError::MalformedPacket
        );
    }

    #[test]
    fn test_piv_encoding() {
        assert_eq!(ssn_to_piv(0).as_slice(), &[0x00]);
        assert_eq!(ssn_to_piv(0x14).as_slice(), &[0x14]);
        assert_eq!(ssn_to_piv(255).as_slice(), &[0xff]);
        assert_eq!(ssn_to_piv(256).as_slice(), &[0x01, 0x00]);
        assert_eq!(
            ssn_to_piv(crate::MAX_SSN).as_slice(),
            &[0xff, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(piv_to_u64(&[0x01, 0x00]), 256);
        assert_eq!(piv_to_u64(&[0x00]), 0);
    }

    #[test]
    fn test_split_is_stable() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.options.push(1, &[0xaa]).unwrap();
        packet.options.push(11, b"a").unwrap();
        packet.options.push(11, b"b").unwrap();
        packet.options.push(17, &[0x00]).unwrap();
        let split = inner_outer_option_split(&packet).unwrap();

        // re-serialize the E-list, re-parse, re-split: same E-list
        let mut buf = [0u8; 64];
        let len = shoals_coap::serialize_options(&split.e, &mut buf).unwrap();
        let (reparsed, _) = shoals_coap::parse_options_and_payload(&buf[..len]).unwrap();
        let mut inner = Packet::new();
        inner.header.code = packet.header.code;
        inner.options = reparsed;
        let resplit = inner_outer_option_split(&inner).unwrap();

        assert_eq!(resplit.e.len(), split.e.len());
        for (a, b) in resplit.e.iter().zip(split.e.iter()) {
            assert_eq!(a, b);
        }
        assert!(resplit.u.is_empty());
    }

    #[test]
    fn test_echo_is_class_e() {
        assert!(is_class_e(ECHO_OPTION));
        assert!(!is_class_e(OSCORE_OPTION));
    }
}
