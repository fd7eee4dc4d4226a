//! Common data structures used by the shoals protocol crates
//!
//! This crate is separate from the protocol crates ([shoals], shoals-oscore,
//! shoals-coap) to avoid circular dependencies between them and the pluggable
//! crypto backends: every backend implements the [Crypto] trait defined here
//! against the buffer and algorithm types defined here. As most of these types
//! are re-exported by the main crates, it is recommended to use them through
//! those re-exports wherever possible.
//!
//! [shoals]: https://docs.rs/shoals/
#![cfg_attr(not(test), no_std)]

pub use cbor_decoder::*;
pub use cbor_encoder::*;
pub use edhoc_parser::*;
pub use helpers::*;

mod crypto;
pub use crypto::{AeadAlg, Crypto, CryptoError, EcdhCurve, HkdfAlg, SignatureAlg};

mod cred;
pub use cred::*;

mod cose;
pub use cose::*;

mod suites;
pub use suites::*;

// Sized for the largest plaintext we compose: a credential carried by value
// plus a 64-byte signature plus one EAD item.
pub const MAX_MESSAGE_SIZE_LEN: usize = 384;

pub const ID_CRED_LEN: usize = 4;
pub const SUITES_LEN: usize = 9;
pub const ECDH_ELEM_LEN: usize = 32;
pub const SHA256_DIGEST_LEN: usize = 32;
pub const MAX_HASH_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 64;
pub const MAX_CONN_ID_LEN: usize = 8;

// KDF context is <<ID_CRED_X, TH_X, CRED_X, ? EAD_X>>, dominated by the
// credential appearing both as identifier (by value) and as credential.
pub const MAX_KDF_CONTEXT_LEN: usize = 512;
pub const MAX_BUFFER_LEN: usize = 384;

pub const CBOR_BYTE_STRING: u8 = 0x58u8;
pub const CBOR_BYTE_STRING_2BYTES: u8 = 0x59u8;
pub const CBOR_TEXT_STRING: u8 = 0x78u8;
pub const CBOR_UINT_1BYTE: u8 = 0x18u8;
pub const CBOR_UINT_2BYTES: u8 = 0x19u8;
pub const CBOR_NEG_INT_1BYTE_START: u8 = 0x20u8;
pub const CBOR_NEG_INT_1BYTE_END: u8 = 0x37u8;
pub const CBOR_UINT_1BYTE_START: u8 = 0x0u8;
pub const CBOR_UINT_1BYTE_END: u8 = 0x17u8;
pub const CBOR_NIL: u8 = 0xf6u8;
pub const CBOR_MAJOR_TEXT_STRING: u8 = 0x60u8;
pub const CBOR_MAJOR_BYTE_STRING: u8 = 0x40u8;
pub const CBOR_MAJOR_ARRAY: u8 = 0x80u8;
pub const CBOR_MAJOR_MAP: u8 = 0xa0u8;

pub const MAX_INFO_LEN: usize = 1 + 3 + MAX_KDF_CONTEXT_LEN + 3;

pub const ENC_STRUCTURE_LEN: usize = 8 + 5 + MAX_HASH_LEN; // 8 for "Encrypt0"

pub const MAX_EAD_SIZE_LEN: usize = 64;

pub type BytesSuites = [u8; SUITES_LEN];
/// The cipher suites this implementation speaks.
pub const EDHOC_SUPPORTED_SUITES: &[u8] = &[0, 1, 2, 3];

pub type BytesIdCred = [u8; ID_CRED_LEN];
pub type BytesEcdhElem = [u8; ECDH_ELEM_LEN];
pub type BytesHashLen = [u8; SHA256_DIGEST_LEN];
pub type BytesMaxHash = [u8; MAX_HASH_LEN];
pub type BytesSignature = [u8; SIGNATURE_LEN];
pub type BytesMaxBuffer = [u8; MAX_BUFFER_LEN];
pub type BytesMaxContextBuffer = [u8; MAX_KDF_CONTEXT_LEN];
pub type BytesMaxInfoBuffer = [u8; MAX_INFO_LEN];

pub type BufferMessage1 = EdhocMessageBuffer;
pub type BufferMessage2 = EdhocMessageBuffer;
pub type BufferMessage3 = EdhocMessageBuffer;
pub type BufferMessage4 = EdhocMessageBuffer;
pub type BufferErrorMessage = EdhocMessageBuffer;
pub type BufferCiphertext2 = EdhocMessageBuffer;
pub type BufferCiphertext3 = EdhocMessageBuffer;
pub type BufferCiphertext4 = EdhocMessageBuffer;
pub type BufferPlaintext2 = EdhocMessageBuffer;
pub type BufferPlaintext3 = EdhocMessageBuffer;
pub type BufferPlaintext4 = EdhocMessageBuffer;
pub type BufferSigOrMac = ByteBuffer<SIGNATURE_LEN>;
pub type EADMessageBuffer = ByteBuffer<MAX_EAD_SIZE_LEN>;

#[repr(C)]
#[derive(PartialEq, Debug)]
pub enum EDHOCError {
    UnknownPeer = 1,
    AuthenticationFailed = 2,
    UnsupportedMethod = 3,
    UnsupportedCipherSuite = 4,
    ParsingError = 5,
    EadLabelTooLongError = 6,
    EadTooLongError = 7,
    UnknownCriticalEad = 8,
    ErrorMessageReceived = 9,
    UnknownError = 10,
}

/// EDHOC authentication method, combining signature and static-DH
/// authentication on the two sides (RFC 9528, Section 3.2).
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum EdhocMethod {
    SigSig = 0,
    SigStat = 1,
    StatSig = 2,
    StatStat = 3,
}

impl EdhocMethod {
    pub fn from_u8(method: u8) -> Result<Self, EDHOCError> {
        match method {
            0 => Ok(EdhocMethod::SigSig),
            1 => Ok(EdhocMethod::SigStat),
            2 => Ok(EdhocMethod::StatSig),
            3 => Ok(EdhocMethod::StatStat),
            _ => Err(EDHOCError::UnsupportedMethod),
        }
    }

    /// The initiator authenticates with a signature (otherwise static DH).
    pub fn initiator_signs(&self) -> bool {
        matches!(self, EdhocMethod::SigSig | EdhocMethod::SigStat)
    }

    /// The responder authenticates with a signature (otherwise static DH).
    pub fn responder_signs(&self) -> bool {
        matches!(self, EdhocMethod::SigSig | EdhocMethod::StatSig)
    }
}

/// A connection identifier, either a CBOR one-byte integer (stored in its raw
/// wire encoding) or a short byte string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnId {
    Int(u8),
    Bytes(ByteBuffer<MAX_CONN_ID_LEN>),
}

impl ConnId {
    /// Wraps an integer identifier; only -24..=23 fit the one-byte encoding.
    pub fn from_int(value: i8) -> Option<ConnId> {
        if (0..=23).contains(&value) {
            Some(ConnId::Int(value as u8))
        } else if (-24..0).contains(&value) {
            Some(ConnId::Int(
                CBOR_NEG_INT_1BYTE_START - 1 + value.unsigned_abs(),
            ))
        } else {
            None
        }
    }

    pub fn from_slice(value: &[u8]) -> Result<ConnId, MessageBufferError> {
        Ok(ConnId::Bytes(ByteBuffer::new_from_slice(value)?))
    }

    /// The byte-string form used as an OSCORE Sender/Recipient ID (RFC 9528,
    /// Appendix A.1).
    pub fn as_oscore_id(&self) -> &[u8] {
        match self {
            ConnId::Int(b) => core::slice::from_ref(b),
            ConnId::Bytes(buf) => buf.as_slice(),
        }
    }

    pub fn encode(&self, encoder: &mut CBOREncoder) -> Result<(), CBORError> {
        match self {
            ConnId::Int(b) => encoder.int_raw(*b),
            ConnId::Bytes(buf) => encoder.bytes(buf.as_slice()),
        }
    }

    pub fn decode(decoder: &mut CBORDecoder) -> Result<ConnId, CBORError> {
        let current = decoder.current()?;
        if CBORDecoder::is_u8(current) || CBORDecoder::is_i8(current) {
            Ok(ConnId::Int(decoder.int_raw()?))
        } else {
            let bytes = decoder.bytes()?;
            ByteBuffer::new_from_slice(bytes)
                .map(ConnId::Bytes)
                .map_err(|_| CBORError::DecodingError)
        }
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct InitiatorStart {
    pub method: EdhocMethod,
    pub suites_i: BytesSuites,
    pub suites_i_len: usize,
    pub x: BytesEcdhElem,   // ephemeral private key of myself
    pub g_x: BytesEcdhElem, // ephemeral public key of myself
}

#[derive(Debug)]
pub struct ResponderStart {
    pub supported_suites: BytesSuites,
    pub supported_suites_len: usize,
}

#[derive(Debug)]
pub struct ProcessingM1 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub y: BytesEcdhElem,
    pub g_y: BytesEcdhElem,
    pub c_i: ConnId,
    pub g_x: BytesEcdhElem, // ephemeral public key of the initiator
    pub h_message_1: BytesHashLen,
}

#[derive(Debug)]
pub struct WaitM2 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub x: BytesEcdhElem, // ephemeral private key of the initiator
    pub h_message_1: BytesHashLen,
}

#[derive(Debug)]
pub struct WaitM3 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub y: BytesEcdhElem, // ephemeral private key of the responder
    pub prk_3e2m: BytesHashLen,
    pub th_3: BytesHashLen,
}

#[derive(Debug)]
pub struct ProcessingM2 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub sig_or_mac_2: BufferSigOrMac,
    pub prk_2e: BytesHashLen,
    pub th_2: BytesHashLen,
    pub x: BytesEcdhElem,
    pub g_y: BytesEcdhElem,
    pub plaintext_2: BufferPlaintext2,
    pub c_r: ConnId,
    pub cred_r_transfer: CredentialTransfer,
    pub ead_2: Option<EADItem>,
}

#[derive(Debug)]
pub struct ProcessedM2 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub prk_3e2m: BytesHashLen,
    pub prk_4e3m: BytesHashLen,
    pub th_3: BytesHashLen,
    pub i: BytesEcdhElem, // private authentication key of the initiator
}

#[derive(Debug)]
pub struct ProcessingM3 {
    pub method: EdhocMethod,
    pub suite: CipherSuite,
    pub sig_or_mac_3: BufferSigOrMac,
    pub y: BytesEcdhElem, // ephemeral private key of the responder
    pub prk_3e2m: BytesHashLen,
    pub th_3: BytesHashLen,
    pub plaintext_3: BufferPlaintext3,
    pub cred_i_transfer: CredentialTransfer,
    pub ead_3: Option<EADItem>,
}

#[derive(Debug)]
#[repr(C)]
pub struct Completed {
    pub suite: CipherSuite,
    pub prk_4e3m: BytesHashLen,
    pub th_4: BytesHashLen,
    pub prk_out: BytesHashLen,
    pub prk_exporter: BytesHashLen,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub enum CredentialTransfer {
    ByReference,
    ByValue,
}

#[derive(PartialEq, Debug)]
#[repr(C)]
pub enum MessageBufferError {
    BufferAlreadyFull,
    SliceTooLong,
}

/// An owned u8 vector of a limited length
///
/// It is used to represent the various messages in encrypted and in decrypted
/// form, as well as other data items whose maximum size is known at compile
/// time. Exceeding the capacity is an error, never a reallocation.
#[repr(C)]
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct ByteBuffer<const N: usize> {
    pub content: [u8; N],
    pub len: usize,
}

pub type EdhocMessageBuffer = ByteBuffer<MAX_MESSAGE_SIZE_LEN>;

impl<const N: usize> Default for ByteBuffer<N> {
    fn default() -> Self {
        ByteBuffer {
            content: [0; N],
            len: 0,
        }
    }
}

impl<const N: usize> ByteBuffer<N> {
    pub fn new() -> Self {
        ByteBuffer {
            content: [0u8; N],
            len: 0,
        }
    }

    pub fn new_from_slice(slice: &[u8]) -> Result<Self, MessageBufferError> {
        let mut buffer = Self::new();
        if buffer.fill_with_slice(slice).is_ok() {
            Ok(buffer)
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.content.get(index).copied()
    }

    pub fn push(&mut self, item: u8) -> Result<(), MessageBufferError> {
        if self.len < self.content.len() {
            self.content[self.len] = item;
            self.len += 1;
            Ok(())
        } else {
            Err(MessageBufferError::BufferAlreadyFull)
        }
    }

    pub fn get_slice(&self, start: usize, len: usize) -> Option<&[u8]> {
        self.content.get(start..start + len)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[0..self.len]
    }

    pub fn fill_with_slice(&mut self, slice: &[u8]) -> Result<(), MessageBufferError> {
        if slice.len() <= self.content.len() {
            self.len = slice.len();
            self.content[..self.len].copy_from_slice(slice);
            Ok(())
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn extend_from_slice(&mut self, slice: &[u8]) -> Result<(), MessageBufferError> {
        if self.len + slice.len() <= self.content.len() {
            self.content[self.len..self.len + slice.len()].copy_from_slice(slice);
            self.len += slice.len();
            Ok(())
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn from_hex(hex: &str) -> Self {
        let mut buffer = Self::new();
        buffer.len = hex.len() / 2;
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let chunk_str = core::str::from_utf8(chunk).unwrap();
            buffer.content[i] = u8::from_str_radix(chunk_str, 16).unwrap();
        }
        buffer
    }
}

impl<const N: usize> TryFrom<&[u8]> for ByteBuffer<N> {
    type Error = MessageBufferError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::new_from_slice(slice)
    }
}

/// An External Authorization Data item (RFC 9528, Section 3.8).
///
/// A negative wire label marks the item critical; the stored label is the
/// absolute value.
#[derive(Clone, Debug, PartialEq)]
pub struct EADItem {
    pub label: u8,
    pub is_critical: bool,
    pub value: Option<EADMessageBuffer>,
}

impl EADItem {
    pub fn new() -> Self {
        EADItem {
            label: 0,
            is_critical: false,
            value: None,
        }
    }

    pub fn new_full(
        label: u8,
        is_critical: bool,
        value: Option<&[u8]>,
    ) -> Result<Self, MessageBufferError> {
        let value = match value {
            Some(v) => Some(EADMessageBuffer::new_from_slice(v)?),
            None => None,
        };
        Ok(EADItem {
            label,
            is_critical,
            value,
        })
    }
}

impl Default for EADItem {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum IdCred<'a> {
    CompactKid(u8),
    FullCredential(&'a [u8]),
}

mod helpers {
    use super::*;

    /// Encodes the EDHOC-KDF `info` CBOR sequence `(label, context, length)`.
    pub fn encode_info(
        label: u8,
        context: &BytesMaxContextBuffer,
        context_len: usize,
        length: usize,
    ) -> (BytesMaxInfoBuffer, usize) {
        let mut info: BytesMaxInfoBuffer = [0x00; MAX_INFO_LEN];

        // construct info with inline cbor encoding
        info[0] = label;
        let mut info_len = if context_len < 24 {
            info[1] = context_len as u8 | CBOR_MAJOR_BYTE_STRING;
            info[2..2 + context_len].copy_from_slice(&context[..context_len]);
            2 + context_len
        } else if context_len <= 255 {
            info[1] = CBOR_BYTE_STRING;
            info[2] = context_len as u8;
            info[3..3 + context_len].copy_from_slice(&context[..context_len]);
            3 + context_len
        } else {
            info[1] = CBOR_BYTE_STRING_2BYTES;
            info[2] = (context_len >> 8) as u8;
            info[3] = (context_len & 0xff) as u8;
            info[4..4 + context_len].copy_from_slice(&context[..context_len]);
            4 + context_len
        };

        info_len = if length < 24 {
            info[info_len] = length as u8;
            info_len + 1
        } else if length <= 255 {
            info[info_len] = CBOR_UINT_1BYTE;
            info[info_len + 1] = length as u8;
            info_len + 2
        } else {
            info[info_len] = CBOR_UINT_2BYTES;
            info[info_len + 1] = (length >> 8) as u8;
            info[info_len + 2] = (length & 0xff) as u8;
            info_len + 3
        };

        (info, info_len)
    }
}

mod edhoc_parser {
    use super::*;

    pub fn parse_ead(buffer: &[u8]) -> Result<Option<EADItem>, EDHOCError> {
        // assuming label is a single byte integer (negative or positive)
        if let Some((&label, tail)) = buffer.split_first() {
            let label_res = if CBORDecoder::is_u8(label) {
                // CBOR unsigned integer (0..=23)
                Ok((label, false))
            } else if CBORDecoder::is_i8(label) {
                // CBOR negative integer (-1..=-24)
                Ok((label - (CBOR_NEG_INT_1BYTE_START - 1), true))
            } else {
                Err(EDHOCError::ParsingError)
            };

            if let Ok((label, is_critical)) = label_res {
                let ead_value = if !tail.is_empty() {
                    // EAD value is present
                    let value = EADMessageBuffer::new_from_slice(tail)
                        .map_err(|_| EDHOCError::EadTooLongError)?;
                    Some(value)
                } else {
                    None
                };
                Ok(Some(EADItem {
                    label,
                    is_critical,
                    value: ead_value,
                }))
            } else {
                Err(EDHOCError::ParsingError)
            }
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn parse_suites_i(
        mut decoder: CBORDecoder,
    ) -> Result<(BytesSuites, usize, CBORDecoder), EDHOCError> {
        let mut suites_i: BytesSuites = Default::default();
        if let Ok(curr) = decoder.current() {
            if CBOR_UINT_1BYTE_START == CBORDecoder::type_of(curr) {
                suites_i[0] = decoder.u8()?;
                let suites_i_len = 1;
                Ok((suites_i, suites_i_len, decoder))
            } else if CBOR_MAJOR_ARRAY == CBORDecoder::type_of(curr)
                && CBORDecoder::info_of(curr) >= 2
            {
                // NOTE: arrays must be at least 2 items long, otherwise the compact encoding (int) must be used
                let suites_i_len = decoder.array()?;
                if suites_i_len <= suites_i.len() {
                    for i in 0..suites_i_len {
                        suites_i[i] = decoder.u8()?;
                    }
                    Ok((suites_i, suites_i_len, decoder))
                } else {
                    Err(EDHOCError::ParsingError)
                }
            } else {
                Err(EDHOCError::ParsingError)
            }
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn parse_message_1(
        rcvd_message_1: &BufferMessage1,
    ) -> Result<
        (
            EdhocMethod,
            BytesSuites,
            usize,
            BytesEcdhElem,
            ConnId,
            Option<EADItem>,
        ),
        EDHOCError,
    > {
        let mut decoder = CBORDecoder::new(rcvd_message_1.as_slice());
        let method = EdhocMethod::from_u8(decoder.u8()?)?;

        let (suites_i, suites_i_len, mut decoder) = parse_suites_i(decoder)?;

        let mut g_x: BytesEcdhElem = [0x00; ECDH_ELEM_LEN];
        g_x.copy_from_slice(decoder.bytes_sized(ECDH_ELEM_LEN)?);

        let c_i = ConnId::decode(&mut decoder)?;

        // if there is still more to parse, the rest will be the EAD_1
        if rcvd_message_1.len > decoder.position() {
            // NOTE: we assume a single EAD item
            let ead_1 = parse_ead(decoder.remaining_buffer()?)?;
            Ok((method, suites_i, suites_i_len, g_x, c_i, ead_1))
        } else if decoder.finished() {
            Ok((method, suites_i, suites_i_len, g_x, c_i, None))
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn parse_message_2(
        rcvd_message_2: &BufferMessage2,
    ) -> Result<(BytesEcdhElem, BufferCiphertext2, ConnId), EDHOCError> {
        let mut ciphertext_2: BufferCiphertext2 = BufferCiphertext2::new();

        let mut decoder = CBORDecoder::new(rcvd_message_2.as_slice());

        // G_Y and CIPHERTEXT_2 are concatenated into a single bstr,
        // followed by C_R
        let decoded = decoder.bytes()?;
        let c_r = ConnId::decode(&mut decoder)?;
        if decoder.finished() {
            if let Some(key) = decoded.get(0..ECDH_ELEM_LEN) {
                let mut g_y: BytesEcdhElem = [0x00; ECDH_ELEM_LEN];
                g_y.copy_from_slice(key);
                if let Some(c2) = decoded.get(ECDH_ELEM_LEN..) {
                    if ciphertext_2.fill_with_slice(c2).is_ok() {
                        Ok((g_y, ciphertext_2, c_r))
                    } else {
                        Err(EDHOCError::ParsingError)
                    }
                } else {
                    Err(EDHOCError::ParsingError)
                }
            } else {
                Err(EDHOCError::ParsingError)
            }
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn parse_message_3(
        rcvd_message_3: &BufferMessage3,
    ) -> Result<BufferCiphertext3, EDHOCError> {
        let mut decoder = CBORDecoder::new(rcvd_message_3.as_slice());
        let ciphertext_3 = decoder.bytes()?;
        if decoder.finished() {
            BufferCiphertext3::new_from_slice(ciphertext_3).map_err(|_| EDHOCError::ParsingError)
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn parse_message_4(
        rcvd_message_4: &BufferMessage4,
    ) -> Result<BufferCiphertext4, EDHOCError> {
        let mut decoder = CBORDecoder::new(rcvd_message_4.as_slice());
        let ciphertext_4 = decoder.bytes()?;
        if decoder.finished() {
            BufferCiphertext4::new_from_slice(ciphertext_4).map_err(|_| EDHOCError::ParsingError)
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    fn decode_id_cred<'a>(decoder: &mut CBORDecoder<'a>) -> Result<IdCred<'a>, EDHOCError> {
        // NOTE: if len of bstr is 1, it is a compact kid and therefore should have been encoded as int
        let id_cred = if CBOR_MAJOR_BYTE_STRING == CBORDecoder::type_of(decoder.current()?)
            && CBORDecoder::info_of(decoder.current()?) > 1
        {
            IdCred::FullCredential(decoder.bytes()?)
        } else {
            IdCred::CompactKid(decoder.int_raw()?)
        };
        Ok(id_cred)
    }

    pub fn decode_plaintext_2(
        plaintext_2: &BufferPlaintext2,
        sig_or_mac_2_len: usize,
    ) -> Result<(IdCred, BufferSigOrMac, Option<EADItem>), EDHOCError> {
        let mut decoder = CBORDecoder::new(plaintext_2.as_slice());

        let id_cred_r = decode_id_cred(&mut decoder)?;

        let sig_or_mac_2 = BufferSigOrMac::new_from_slice(decoder.bytes_sized(sig_or_mac_2_len)?)
            .map_err(|_| EDHOCError::ParsingError)?;

        // if there is still more to parse, the rest will be the EAD_2
        if plaintext_2.len > decoder.position() {
            // assume only one EAD item
            let ead_2 = parse_ead(decoder.remaining_buffer()?)?;
            Ok((id_cred_r, sig_or_mac_2, ead_2))
        } else if decoder.finished() {
            Ok((id_cred_r, sig_or_mac_2, None))
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    pub fn decode_plaintext_3(
        plaintext_3: &BufferPlaintext3,
        sig_or_mac_3_len: usize,
    ) -> Result<(IdCred, BufferSigOrMac, Option<EADItem>), EDHOCError> {
        let mut decoder = CBORDecoder::new(plaintext_3.as_slice());

        let id_cred_i = decode_id_cred(&mut decoder)?;

        let sig_or_mac_3 = BufferSigOrMac::new_from_slice(decoder.bytes_sized(sig_or_mac_3_len)?)
            .map_err(|_| EDHOCError::ParsingError)?;

        // if there is still more to parse, the rest will be the EAD_3
        if plaintext_3.len > decoder.position() {
            // assume only one EAD item
            let ead_3 = parse_ead(decoder.remaining_buffer()?)?;
            Ok((id_cred_i, sig_or_mac_3, ead_3))
        } else if decoder.finished() {
            Ok((id_cred_i, sig_or_mac_3, None))
        } else {
            Err(EDHOCError::ParsingError)
        }
    }

    /// PLAINTEXT_4 is either empty or a single EAD item.
    pub fn decode_plaintext_4(
        plaintext_4: &BufferPlaintext4,
    ) -> Result<Option<EADItem>, EDHOCError> {
        if plaintext_4.is_empty() {
            Ok(None)
        } else {
            parse_ead(plaintext_4.as_slice())
        }
    }

    /// Decodes an EDHOC error message into its code and, for code 2, the
    /// responder's supported cipher suites.
    pub fn parse_error_message(
        rcvd_error: &BufferErrorMessage,
    ) -> Result<(i8, BytesSuites, usize), EDHOCError> {
        let mut decoder = CBORDecoder::new(rcvd_error.as_slice());
        let err_code = decoder.i8()?;
        if err_code == 2 {
            let (suites_r, suites_r_len, decoder) = parse_suites_i(decoder)?;
            decoder.ensure_finished()?;
            Ok((err_code, suites_r, suites_r_len))
        } else {
            // ERR_INFO is free-form; it is not interpreted further
            Ok((err_code, Default::default(), 0))
        }
    }
}

mod cbor_decoder {
    /// Decoder inspired by the [minicbor](https://crates.io/crates/minicbor) crate.
    use super::*;

    #[derive(Debug)]
    pub enum CBORError {
        DecodingError,
        EncodingError,
    }

    impl From<CBORError> for EDHOCError {
        fn from(error: CBORError) -> Self {
            match error {
                CBORError::DecodingError => EDHOCError::ParsingError,
                CBORError::EncodingError => EDHOCError::ParsingError,
            }
        }
    }

    #[derive(Debug)]
    pub struct CBORDecoder<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> CBORDecoder<'a> {
        pub fn new(bytes: &'a [u8]) -> Self {
            CBORDecoder { buf: bytes, pos: 0 }
        }

        fn read(&mut self) -> Result<u8, CBORError> {
            if let Some(b) = self.buf.get(self.pos) {
                self.pos += 1;
                Ok(*b)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Consume and return *n* bytes starting at the current position.
        fn read_slice(&mut self, n: usize) -> Result<&'a [u8], CBORError> {
            if let Some(b) = self
                .pos
                .checked_add(n)
                .and_then(|end| self.buf.get(self.pos..end))
            {
                self.pos += n;
                Ok(b)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        pub fn position(&self) -> usize {
            self.pos
        }

        pub fn finished(&self) -> bool {
            self.pos == self.buf.len()
        }

        pub fn ensure_finished(&self) -> Result<(), CBORError> {
            if self.finished() {
                Ok(())
            } else {
                Err(CBORError::DecodingError)
            }
        }

        pub fn remaining_buffer(&self) -> Result<&'a [u8], CBORError> {
            if let Some(buffer) = self.buf.get(self.pos..) {
                Ok(buffer)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Get the byte at the current position.
        pub fn current(&self) -> Result<u8, CBORError> {
            if let Some(b) = self.buf.get(self.pos) {
                Ok(*b)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Decode a `u8` value.
        pub fn u8(&mut self) -> Result<u8, CBORError> {
            let n = self.read()?;
            if (0..=0x17).contains(&n) {
                Ok(n)
            } else if 0x18 == n {
                self.read()
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Decode an `i8` value.
        pub fn i8(&mut self) -> Result<i8, CBORError> {
            let n = self.read()?;
            if (0..=0x17).contains(&n) {
                Ok(n as i8)
            } else if (0x20..=0x37).contains(&n) {
                Ok(-1 - (n - 0x20) as i8)
            } else if 0x18 == n {
                Ok(self.read()? as i8)
            } else if 0x38 == n {
                Ok(-1 - (self.read()? - 0x20) as i8)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Get the raw `i8` or `u8` value.
        pub fn int_raw(&mut self) -> Result<u8, CBORError> {
            let n = self.read()?;
            if (0..=0x17).contains(&n) || (0x20..=0x37).contains(&n) {
                Ok(n)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Decode a string slice.
        pub fn str(&mut self) -> Result<&'a [u8], CBORError> {
            let b = self.read()?;
            if CBOR_MAJOR_TEXT_STRING != Self::type_of(b) || Self::info_of(b) == 31 {
                Err(CBORError::DecodingError)
            } else {
                let n = self.as_usize(Self::info_of(b))?;
                self.read_slice(n)
            }
        }

        /// Decode a byte slice.
        pub fn bytes(&mut self) -> Result<&'a [u8], CBORError> {
            let b = self.read()?;
            if CBOR_MAJOR_BYTE_STRING != Self::type_of(b) || Self::info_of(b) == 31 {
                Err(CBORError::DecodingError)
            } else {
                let n = self.as_usize(Self::info_of(b))?;
                self.read_slice(n)
            }
        }

        /// Decode a byte slice of an expected size.
        pub fn bytes_sized(&mut self, expected_size: usize) -> Result<&'a [u8], CBORError> {
            let res = self.bytes()?;
            if res.len() == expected_size {
                Ok(res)
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Begin decoding an array.
        pub fn array(&mut self) -> Result<usize, CBORError> {
            let b = self.read()?;
            if CBOR_MAJOR_ARRAY != Self::type_of(b) {
                Err(CBORError::DecodingError)
            } else {
                match Self::info_of(b) {
                    31 => Err(CBORError::DecodingError), // no support for unknown size arrays
                    n => Ok(self.as_usize(n)?),
                }
            }
        }

        /// Begin decoding a map.
        pub fn map(&mut self) -> Result<usize, CBORError> {
            let b = self.read()?;
            if CBOR_MAJOR_MAP != Self::type_of(b) {
                Err(CBORError::DecodingError)
            } else {
                match Self::info_of(b) {
                    31 => Err(CBORError::DecodingError), // no support for unknown size maps
                    n => Ok(self.as_usize(n)?),
                }
            }
        }

        /// Skip over one definite-length data item, recursing into arrays
        /// and maps.
        pub fn skip(&mut self) -> Result<(), CBORError> {
            let b = self.current()?;
            match Self::type_of(b) {
                0x00 => {
                    self.u8()?;
                }
                0x20 => {
                    self.i8()?;
                }
                0x40 => {
                    self.bytes()?;
                }
                0x60 => {
                    self.str()?;
                }
                0x80 => {
                    let n = self.array()?;
                    for _ in 0..n {
                        self.skip()?;
                    }
                }
                0xa0 => {
                    let n = self.map()?;
                    for _ in 0..n {
                        self.skip()?;
                        self.skip()?;
                    }
                }
                0xe0 if b == CBOR_NIL => {
                    self.read()?;
                }
                _ => return Err(CBORError::DecodingError),
            };
            Ok(())
        }

        /// Decode a length value into usize.
        pub fn as_usize(&mut self, b: u8) -> Result<usize, CBORError> {
            if (0..=0x17).contains(&b) {
                Ok(usize::from(b))
            } else if 0x18 == b {
                self.read().map(usize::from)
            } else if 0x19 == b {
                let hi = self.read()?;
                let lo = self.read()?;
                Ok(usize::from(hi) << 8 | usize::from(lo))
            } else {
                Err(CBORError::DecodingError)
            }
        }

        /// Get the major type info of the given byte (highest 3 bits).
        pub fn type_of(b: u8) -> u8 {
            b & 0b111_00000
        }

        /// Get the additional type info of the given byte (lowest 5 bits).
        pub fn info_of(b: u8) -> u8 {
            b & 0b000_11111
        }

        /// Check for: an unsigned integer encoded as a single byte
        pub fn is_u8(byte: u8) -> bool {
            (CBOR_UINT_1BYTE_START..=CBOR_UINT_1BYTE_END).contains(&byte)
        }

        /// Check for: a negative integer encoded as a single byte
        pub fn is_i8(byte: u8) -> bool {
            (CBOR_NEG_INT_1BYTE_START..=CBOR_NEG_INT_1BYTE_END).contains(&byte)
        }
    }
}

mod cbor_encoder {
    /// Encoder counterpart of the decoder above, writing definite-length
    /// items into a caller-provided buffer.
    use super::*;

    #[derive(Debug)]
    pub struct CBOREncoder<'a> {
        buf: &'a mut [u8],
        pos: usize,
    }

    impl<'a> CBOREncoder<'a> {
        pub fn new(buf: &'a mut [u8]) -> Self {
            CBOREncoder { buf, pos: 0 }
        }

        pub fn position(&self) -> usize {
            self.pos
        }

        fn write(&mut self, b: u8) -> Result<(), CBORError> {
            if let Some(slot) = self.buf.get_mut(self.pos) {
                *slot = b;
                self.pos += 1;
                Ok(())
            } else {
                Err(CBORError::EncodingError)
            }
        }

        fn write_slice(&mut self, slice: &[u8]) -> Result<(), CBORError> {
            if let Some(end) = self.pos.checked_add(slice.len()) {
                if let Some(dst) = self.buf.get_mut(self.pos..end) {
                    dst.copy_from_slice(slice);
                    self.pos = end;
                    return Ok(());
                }
            }
            Err(CBORError::EncodingError)
        }

        fn type_len(&mut self, major: u8, len: usize) -> Result<(), CBORError> {
            if len < 24 {
                self.write(major | len as u8)
            } else if len <= 255 {
                self.write(major | 24)?;
                self.write(len as u8)
            } else if len <= 65535 {
                self.write(major | 25)?;
                self.write((len >> 8) as u8)?;
                self.write((len & 0xff) as u8)
            } else {
                Err(CBORError::EncodingError)
            }
        }

        pub fn uint(&mut self, value: usize) -> Result<(), CBORError> {
            self.type_len(0x00, value)
        }

        pub fn int(&mut self, value: i32) -> Result<(), CBORError> {
            if value >= 0 {
                self.type_len(0x00, value as usize)
            } else {
                self.type_len(0x20, (-1 - value) as usize)
            }
        }

        /// Write a raw single-byte integer encoding (0x00..=0x17, 0x20..=0x37).
        pub fn int_raw(&mut self, b: u8) -> Result<(), CBORError> {
            if CBORDecoder::is_u8(b) || CBORDecoder::is_i8(b) {
                self.write(b)
            } else {
                Err(CBORError::EncodingError)
            }
        }

        pub fn bytes(&mut self, b: &[u8]) -> Result<(), CBORError> {
            self.type_len(CBOR_MAJOR_BYTE_STRING, b.len())?;
            self.write_slice(b)
        }

        pub fn text(&mut self, s: &str) -> Result<(), CBORError> {
            self.type_len(CBOR_MAJOR_TEXT_STRING, s.len())?;
            self.write_slice(s.as_bytes())
        }

        pub fn array(&mut self, len: usize) -> Result<(), CBORError> {
            self.type_len(CBOR_MAJOR_ARRAY, len)
        }

        pub fn map(&mut self, len: usize) -> Result<(), CBORError> {
            self.type_len(CBOR_MAJOR_MAP, len)
        }

        pub fn null(&mut self) -> Result<(), CBORError> {
            self.write(CBOR_NIL)
        }

        /// Append pre-encoded CBOR bytes.
        pub fn raw(&mut self, b: &[u8]) -> Result<(), CBORError> {
            self.write_slice(b)
        }
    }
}


#[cfg(test)]
mod test_cbor_encoder {
    use super::*;

    #[test]
    fn test_cbor_encoder() {
        let mut buf = [0u8; 32];
        let mut encoder = CBOREncoder::new(&mut buf);
        encoder.uint(1).unwrap();
        encoder.int(-1).unwrap();
        encoder.text("hi").unwrap();
        encoder.bytes(&[0xFE, 0xFE]).unwrap();
        let len = encoder.position();
        assert_eq!(&buf[..len], &[0x01, 0x20, 0x62, 0x68, 0x69, 0x42, 0xFE, 0xFE]);
    }

    #[test]
    fn test_cbor_encoder_lengths() {
        let mut buf = [0u8; 512];
        let mut encoder = CBOREncoder::new(&mut buf);
        encoder.bytes(&[0xab; 200]).unwrap();
        assert_eq!(&buf[..2], &[0x58, 200]);
        let mut encoder = CBOREncoder::new(&mut buf);
        encoder.bytes(&[0xab; 300]).unwrap();
        assert_eq!(&buf[..3], &[0x59, 0x01, 0x2c]);
    }

    #[test]
    fn test_cbor_encoder_overflow() {
        let mut buf = [0u8; 2];
        let mut encoder = CBOREncoder::new(&mut buf);
        assert!(encoder.bytes(&[0x01, 0x02, 0x03]).is_err());
    }
}

#[cfg(test)]
mod test_conn_id {
    use super::*;

    #[test]
    fn test_int_encoding() {
        assert_eq!(ConnId::from_int(10), Some(ConnId::Int(0x0a)));
        assert_eq!(ConnId::from_int(-8), Some(ConnId::Int(0x27)));
        assert_eq!(ConnId::from_int(24), None);
        assert_eq!(ConnId::from_int(-25), None);
    }

    #[test]
    fn test_oscore_id() {
        let c = ConnId::from_int(-8).unwrap();
        assert_eq!(c.as_oscore_id(), &[0x27]);
        let c = ConnId::from_slice(&[0x01, 0x02]).unwrap();
        assert_eq!(c.as_oscore_id(), &[0x01, 0x02]);
    }

    #[test]
    fn test_roundtrip() {
        let mut buf = [0u8; 16];
        let c = ConnId::from_slice(&[0xde, 0xad]).unwrap();
        let mut encoder = CBOREncoder::new(&mut buf);
        c.encode(&mut encoder).unwrap();
        let len = encoder.position();
        let mut decoder = CBORDecoder::new(&buf[..len]);
        assert_eq!(ConnId::decode(&mut decoder).unwrap(), c);
    }
}
