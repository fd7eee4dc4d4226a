//! Implementation of [EDHOC] (Ephemeral Diffie-Hellman Over COSE), a lightweight authenticated key
//! exchange for the Internet of Things.
//!
//! The crate provides a high-level interface through the [EdhocInitiator] and the [EdhocResponder]
//! structs. Both these wrap the lower level state structs that are mainly used through internal
//! functions in the `edhoc` module. This separation keeps the protocol core free of API concerns.
//!
//! Both [EdhocInitiator] and [EdhocResponder] are used in a type stated way. Following the EDHOC
//! protocol, they generate (or process) messages, progressively provide more information about
//! their peer, and eventually devolve into an [EdhocInitiatorDone] and [EdhocResponderDone],
//! respectively, through which the EDHOC key material can be obtained. Illegal message orders are
//! unrepresentable: each transition consumes the old state.
//!
//! [EDHOC]: https://datatracker.ietf.org/doc/html/rfc9528
#![cfg_attr(not(test), no_std)]

pub use {shoals_shared::Crypto as CryptoTrait, shoals_shared::*};

mod edhoc;
pub use edhoc::*;

/// Starting point for performing EDHOC in the role of the Initiator.
#[derive(Debug)]
pub struct EdhocInitiator<Crypto: CryptoTrait> {
    state: InitiatorStart, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorWaitM2<Crypto: CryptoTrait> {
    state: WaitM2, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorProcessingM2<Crypto: CryptoTrait> {
    state: ProcessingM2, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorProcessedM2<Crypto: CryptoTrait> {
    state: ProcessedM2,    // opaque state
    cred_i: CredentialRPK, // I's full credential
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorDone<Crypto: CryptoTrait> {
    state: Completed,
    crypto: Crypto,
}

/// Starting point for performing EDHOC in the role of the Responder.
#[derive(Debug)]
pub struct EdhocResponder<'a, Crypto: CryptoTrait> {
    state: ResponderStart, // opaque state
    r: &'a [u8],           // private authentication key of R
    cred_r: CredentialRPK, // R's full credential
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderProcessedM1<'a, Crypto: CryptoTrait> {
    state: ProcessingM1,   // opaque state
    r: &'a [u8],           // private authentication key of R
    cred_r: CredentialRPK, // R's full credential
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderWaitM3<Crypto: CryptoTrait> {
    state: WaitM3, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderProcessingM3<Crypto: CryptoTrait> {
    state: ProcessingM3, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderDone<Crypto: CryptoTrait> {
    state: Completed,
    crypto: Crypto,
}

impl<'a, Crypto: CryptoTrait> EdhocResponder<'a, Crypto> {
    pub fn new(
        crypto: Crypto,
        r: &'a [u8],
        cred_r: CredentialRPK,
        supported_suites: &[u8],
    ) -> Result<Self, EDHOCError> {
        if r.len() != ECDH_ELEM_LEN {
            return Err(EDHOCError::UnknownError);
        }
        if supported_suites.is_empty() || supported_suites.len() > SUITES_LEN {
            return Err(EDHOCError::UnsupportedCipherSuite);
        }
        let mut suites: BytesSuites = Default::default();
        suites[..supported_suites.len()].copy_from_slice(supported_suites);

        Ok(EdhocResponder {
            state: ResponderStart {
                supported_suites: suites,
                supported_suites_len: supported_suites.len(),
            },
            r,
            cred_r,
            crypto,
        })
    }

    /// Processes a message 1.
    ///
    /// When the initiator selected a cipher suite the responder does not
    /// support, the responder is handed back together with the EDHOC error
    /// message to transmit; it stays receptive to a fresh message 1.
    #[allow(clippy::type_complexity)]
    pub fn process_message_1(
        mut self,
        message_1: &BufferMessage1,
    ) -> Result<
        (EdhocResponderProcessedM1<'a, Crypto>, Option<EADItem>),
        (Self, EDHOCError, Option<BufferErrorMessage>),
    > {
        match r_process_message_1(&self.state, &mut self.crypto, message_1) {
            Ok((state, ead_1)) => Ok((
                EdhocResponderProcessedM1 {
                    state,
                    r: self.r,
                    cred_r: self.cred_r,
                    crypto: self.crypto,
                },
                ead_1,
            )),
            Err(EDHOCError::UnsupportedCipherSuite) => {
                let error_message = encode_suites_error_message(
                    &self.state.supported_suites[..self.state.supported_suites_len],
                )
                .ok();
                Err((self, EDHOCError::UnsupportedCipherSuite, error_message))
            }
            Err(error) => Err((self, error, None)),
        }
    }
}

impl<'a, Crypto: CryptoTrait> EdhocResponderProcessedM1<'a, Crypto> {
    pub fn prepare_message_2(
        mut self,
        cred_transfer: CredentialTransfer,
        c_r: Option<ConnId>,
        ead_2: &Option<EADItem>,
    ) -> Result<(EdhocResponderWaitM3<Crypto>, BufferMessage2), EDHOCError> {
        let c_r = match c_r {
            Some(c_r) => c_r,
            None => generate_connection_identifier_cbor(&mut self.crypto),
        };
        let r = self.r.try_into().map_err(|_| EDHOCError::UnknownError)?;

        match r_prepare_message_2(
            &self.state,
            &mut self.crypto,
            self.cred_r,
            &r,
            c_r,
            cred_transfer,
            ead_2,
        ) {
            Ok((state, message_2)) => Ok((
                EdhocResponderWaitM3 {
                    state,
                    crypto: self.crypto,
                },
                message_2,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderWaitM3<Crypto> {
    pub fn parse_message_3(
        mut self,
        message_3: &BufferMessage3,
    ) -> Result<
        (
            EdhocResponderProcessingM3<Crypto>,
            CredentialRPK,
            Option<EADItem>,
        ),
        EDHOCError,
    > {
        match r_parse_message_3(&self.state, &mut self.crypto, message_3) {
            Ok((state, id_cred_i, ead_3)) => Ok((
                EdhocResponderProcessingM3 {
                    state,
                    crypto: self.crypto,
                },
                id_cred_i,
                ead_3,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderProcessingM3<Crypto> {
    pub fn verify_message_3(
        mut self,
        cred_i: CredentialRPK,
    ) -> Result<(EdhocResponderDone<Crypto>, BytesHashLen), EDHOCError> {
        match r_verify_message_3(&self.state, &mut self.crypto, cred_i) {
            Ok((state, prk_out)) => Ok((
                EdhocResponderDone {
                    state,
                    crypto: self.crypto,
                },
                prk_out,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderDone<Crypto> {
    /// Optional key confirmation (message 4) towards the initiator.
    pub fn prepare_message_4(
        &mut self,
        ead_4: &Option<EADItem>,
    ) -> Result<BufferMessage4, EDHOCError> {
        r_prepare_message_4(&self.state, &mut self.crypto, ead_4)
    }

    pub fn edhoc_exporter(
        &mut self,
        label: u8,
        context: &[u8],
        length: usize,
    ) -> [u8; MAX_BUFFER_LEN] {
        let mut context_buf: BytesMaxContextBuffer = [0x00u8; MAX_KDF_CONTEXT_LEN];
        context_buf[..context.len()].copy_from_slice(context);

        edhoc_exporter(
            &self.state,
            &mut self.crypto,
            label,
            &context_buf,
            context.len(),
            length,
        )
    }

    pub fn edhoc_key_update(&mut self, context: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
        let mut context_buf = [0x00u8; MAX_KDF_CONTEXT_LEN];
        context_buf[..context.len()].copy_from_slice(context);

        edhoc_key_update(
            &mut self.state,
            &mut self.crypto,
            &context_buf,
            context.len(),
        )
    }
}

impl<Crypto: CryptoTrait> EdhocInitiator<Crypto> {
    pub fn new(
        mut crypto: Crypto,
        method: EdhocMethod,
        suites_i: &[u8],
    ) -> Result<Self, EDHOCError> {
        if suites_i.is_empty() || suites_i.len() > SUITES_LEN {
            return Err(EDHOCError::UnsupportedCipherSuite);
        }
        let mut suites: BytesSuites = Default::default();
        suites[..suites_i.len()].copy_from_slice(suites_i);

        // the last element of SUITES_I is the selected suite; its curve
        // determines the ephemeral key pair
        let suite = CipherSuite::from_id(suites_i[suites_i.len() - 1])?;
        let (x, g_x) = crypto.generate_key_pair(suite.curve);

        Ok(EdhocInitiator {
            state: InitiatorStart {
                method,
                suites_i: suites,
                suites_i_len: suites_i.len(),
                x,
                g_x,
            },
            crypto,
        })
    }

    pub fn prepare_message_1(
        mut self,
        c_i: Option<ConnId>,
        ead_1: &Option<EADItem>,
    ) -> Result<(EdhocInitiatorWaitM2<Crypto>, BufferMessage1), EDHOCError> {
        let c_i = match c_i {
            Some(c_i) => c_i,
            None => generate_connection_identifier_cbor(&mut self.crypto),
        };

        match i_prepare_message_1(&self.state, &mut self.crypto, c_i, ead_1) {
            Ok((state, message_1)) => Ok((
                EdhocInitiatorWaitM2 {
                    state,
                    crypto: self.crypto,
                },
                message_1,
            )),
            Err(error) => Err(error),
        }
    }

    pub fn compute_ephemeral_secret(&mut self, g_a: &BytesEcdhElem) -> BytesEcdhElem {
        // the selected suite was validated in new()
        let curve = CipherSuite::from_id(self.selected_cipher_suite())
            .map(|suite| suite.curve)
            .unwrap_or(EcdhCurve::P256);
        self.crypto.ecdh(curve, &self.state.x, g_a)
    }

    pub fn selected_cipher_suite(&self) -> u8 {
        self.state.suites_i[self.state.suites_i_len - 1]
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorWaitM2<Crypto> {
    pub fn parse_message_2(
        mut self,
        message_2: &BufferMessage2,
    ) -> Result<
        (
            EdhocInitiatorProcessingM2<Crypto>,
            ConnId,
            CredentialRPK,
            Option<EADItem>,
        ),
        EDHOCError,
    > {
        match i_parse_message_2(&self.state, &mut self.crypto, message_2) {
            Ok((state, c_r, id_cred_r, ead_2)) => Ok((
                EdhocInitiatorProcessingM2 {
                    state,
                    crypto: self.crypto,
                },
                c_r,
                id_cred_r,
                ead_2,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorProcessingM2<Crypto> {
    pub fn verify_message_2(
        mut self,
        i: &[u8],
        cred_i: CredentialRPK,
        valid_cred_r: CredentialRPK,
    ) -> Result<EdhocInitiatorProcessedM2<Crypto>, EDHOCError> {
        let i = i.try_into().map_err(|_| EDHOCError::UnknownError)?;
        match i_verify_message_2(&self.state, &mut self.crypto, valid_cred_r, i) {
            Ok(state) => Ok(EdhocInitiatorProcessedM2 {
                state,
                cred_i,
                crypto: self.crypto,
            }),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorProcessedM2<Crypto> {
    pub fn prepare_message_3(
        mut self,
        cred_transfer: CredentialTransfer,
        ead_3: &Option<EADItem>,
    ) -> Result<
        (
            EdhocInitiatorDone<Crypto>,
            BufferMessage3,
            [u8; SHA256_DIGEST_LEN],
        ),
        EDHOCError,
    > {
        match i_prepare_message_3(
            &self.state,
            &mut self.crypto,
            self.cred_i,
            cred_transfer,
            ead_3,
        ) {
            Ok((state, message_3, prk_out)) => Ok((
                EdhocInitiatorDone {
                    state,
                    crypto: self.crypto,
                },
                message_3,
                prk_out,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorDone<Crypto> {
    /// Processes the responder's optional key confirmation (message 4).
    pub fn process_message_4(
        &mut self,
        message_4: &BufferMessage4,
    ) -> Result<Option<EADItem>, EDHOCError> {
        i_process_message_4(&self.state, &mut self.crypto, message_4)
    }

    pub fn edhoc_exporter(
        &mut self,
        label: u8,
        context: &[u8],
        length: usize,
    ) -> [u8; MAX_BUFFER_LEN] {
        let mut context_buf: BytesMaxContextBuffer = [0x00u8; MAX_KDF_CONTEXT_LEN];
        context_buf[..context.len()].copy_from_slice(context);

        edhoc_exporter(
            &self.state,
            &mut self.crypto,
            label,
            &context_buf,
            context.len(),
            length,
        )
    }

    pub fn edhoc_key_update(&mut self, context: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
        let mut context_buf = [0x00u8; MAX_KDF_CONTEXT_LEN];
        context_buf[..context.len()].copy_from_slice(context);

        edhoc_key_update(
            &mut self.state,
            &mut self.crypto,
            &context_buf,
            context.len(),
        )
    }
}

pub fn generate_connection_identifier_cbor<Crypto: CryptoTrait>(crypto: &mut Crypto) -> ConnId {
    // infallible: the identifier is generated within -24..=23
    ConnId::from_int(generate_connection_identifier(crypto)).unwrap_or(ConnId::Int(0))
}

/// generates an identifier that can be serialized as a single CBOR integer, i.e. -24 <= x <= 23
pub fn generate_connection_identifier<Crypto: CryptoTrait>(crypto: &mut Crypto) -> i8 {
    let mut conn_id = crypto.get_random_byte() as i8;
    while !(-24..=23).contains(&conn_id) {
        conn_id = crypto.get_random_byte() as i8;
    }
    conn_id
}

// Implements auth credential checking according to draft-tiloca-lake-implem-cons
pub fn credential_check_or_fetch(
    cred_expected: Option<CredentialRPK>,
    id_cred_received: CredentialRPK,
) -> Result<CredentialRPK, EDHOCError> {
    // Processing of auth credentials according to draft-tiloca-lake-implem-cons
    // Comments tagged with a number refer to steps in Section 4.3.1. of draft-tiloca-lake-implem-cons
    if let Some(cred_expected) = cred_expected {
        // 1. Does ID_CRED_X point to a stored authentication credential? YES
        // IMPL: compare cred_expected with the received credential
        //   IMPL: assume cred_expected is well formed
        let credentials_match = if id_cred_received.reference_only() {
            id_cred_received.kid == cred_expected.kid
        } else {
            id_cred_received.value == cred_expected.value
        };

        // 2. Is this authentication credential still valid?
        // IMPL,TODO: check cred_expected is still valid

        // Continue by considering CRED_X as the authentication credential of the other peer.
        // IMPL: ready to proceed, including process ead_2

        if credentials_match {
            Ok(cred_expected)
        } else {
            Err(EDHOCError::UnknownPeer)
        }
    } else {
        // 1. Does ID_CRED_X point to a stored authentication credential? NO
        // IMPL: cred_expected provided by the application is None
        //       the received id_cred must then be a full credential
        // 3. Is the trust model Pre-knowledge-only? NO (hardcoded to NO for now)
        // 4. Is the trust model Pre-knowledge + TOFU? YES (hardcoded to YES for now)
        // 6. Validate CRED_X. Generally a CCS has to be validated only syntactically and semantically, unlike a certificate or a CWT.
        //    Is the validation successful?
        // IMPL,NOTE: the credential has already been parsed with CredentialRPK::new in the *_parse_message_* function
        // 5. Is the authentication credential authorized for use in the context of this EDHOC session?
        // IMPL,TODO: we just skip this step for now
        // 7. Store CRED_X as valid and trusted.
        //   Pair it with consistent credential identifiers, for each supported type of credential identifier.
        if id_cred_received.reference_only() {
            Err(EDHOCError::UnknownPeer)
        } else {
            Ok(id_cred_received)
        }
    }

    // 8. Is this authentication credential good to use in the context of this EDHOC session?
    // IMPL,TODO: we just skip this step for now
}

/// CoAP transport binding (RFC 9528, Appendix A.2): messages sent to
/// /.well-known/edhoc are prefixed with the connection identifier of the
/// recipient's session, or `true` for message_1.
pub fn prepend_cid_to_payload(
    cid: Option<&ConnId>,
    message: &EdhocMessageBuffer,
) -> Result<EdhocMessageBuffer, EDHOCError> {
    let mut prefix = [0u8; 2 + MAX_CONN_ID_LEN];
    let mut encoder = CBOREncoder::new(&mut prefix);
    match cid {
        Some(cid) => cid.encode(&mut encoder)?,
        None => encoder.raw(&[0xf5])?, // CBOR true
    }
    let prefix_len = encoder.position();

    let mut out = EdhocMessageBuffer::new();
    out.extend_from_slice(&prefix[..prefix_len])
        .map_err(|_| EDHOCError::EadTooLongError)?;
    out.extend_from_slice(message.as_slice())
        .map_err(|_| EDHOCError::EadTooLongError)?;
    Ok(out)
}

#[cfg(test)]
mod test_vectors_common {
    use hexlit::hex;

    pub const CRED_I: &[u8] = &hex!("A2027734322D35302D33312D46462D45462D33372D33322D333908A101A5010202412B2001215820AC75E9ECE3E50BFC8ED60399889522405C47BF16DF96660A41298CB4307F7EB62258206E5DE611388A4B8A8211334AC7D37ECB52A387D257E6DB3C2A93DF21FF3AFFC8");
    pub const I: &[u8] = &hex!("fb13adeb6518cee5f88417660841142e830a81fe334380a953406a1305e8706b");
    pub const R: &[u8] = &hex!("72cc4761dbd4c78f758931aa589d348d1ef874a7e303ede2f140dcf3e6aa4aac");
    pub const CRED_R: &[u8] = &hex!("A2026008A101A5010202410A2001215820BBC34960526EA4D32E940CAD2A234148DDC21791A12AFBCBAC93622046DD44F02258204519E257236B2A0CE2023F0931F1F386CA7AFDA64FCDE0108C224C51EABF6072");

    pub const MESSAGE_1_TV_UNSUPPORTED_SUITE: &str =
        "03065820741a13d7ba048fbb615e94386aa3b61bea5b3d8f65f32620b749bee8d278efa90e";
    pub const MESSAGE_1_TV: &str =
        "0382060258208af6f430ebe18d34184017a9a11bf511c8dff8f834730b96c1b7c8dbca2fc3b637";
}
