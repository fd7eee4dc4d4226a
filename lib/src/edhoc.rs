//! EDHOC message composition, parsing and the key schedule (RFC 9528,
//! Sections 4 and 5).
//!
//! The functions in this module operate on the state structs from
//! [shoals_shared] and are driven by the typestate wrappers in the crate
//! root. Names follow the protocol roles: `i_*` run on the initiator, `r_*`
//! on the responder.

use crate::CryptoTrait;
use shoals_shared::*;

// EDHOC-KDF info labels (RFC 9528, Table 1)
const KEYSTREAM_2_LABEL: u8 = 0;
const SALT_3E2M_LABEL: u8 = 1;
const MAC_2_LABEL: u8 = 2;
const K_3_LABEL: u8 = 3;
const IV_3_LABEL: u8 = 4;
const SALT_4E3M_LABEL: u8 = 5;
const MAC_3_LABEL: u8 = 6;
const PRK_OUT_LABEL: u8 = 7;
const K_4_LABEL: u8 = 8;
const IV_4_LABEL: u8 = 9;
const PRK_EXPORTER_LABEL: u8 = 10;
const KEY_UPDATE_LABEL: u8 = 11;

/// Exporter labels for the OSCORE master secret and salt (RFC 9528,
/// Appendix A.1).
pub const OSCORE_MASTER_SECRET_LABEL: u8 = 0;
pub const OSCORE_MASTER_SALT_LABEL: u8 = 1;

pub const ERR_CODE_UNSPECIFIED: i8 = 1;
pub const ERR_CODE_WRONG_SELECTED_SUITE: i8 = 2;

// transcript hash input: bstr-wrapped previous hash, a plaintext, a credential
const MAX_TH_INPUT_LEN: usize = 2 + SHA256_DIGEST_LEN + MAX_MESSAGE_SIZE_LEN + MAX_CRED_LEN;
// ["Signature1", ID_CRED_X, <<TH, CRED, ?EAD>>, MAC]
const MAX_SIG_STRUCTURE_LEN: usize =
    16 + (3 + 2 + MAX_CRED_LEN) + (3 + 2 + SHA256_DIGEST_LEN + MAX_CRED_LEN + 2 + MAX_EAD_SIZE_LEN)
        + 2
        + SHA256_DIGEST_LEN;
const MAX_A_3_LEN: usize = ENC_STRUCTURE_LEN;

fn edhoc_kdf<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    prk: &BytesHashLen,
    label: u8,
    context: &[u8],
    length: usize,
) -> BytesMaxBuffer {
    let mut context_buf: BytesMaxContextBuffer = [0x00; MAX_KDF_CONTEXT_LEN];
    context_buf[..context.len()].copy_from_slice(context);
    let (info, info_len) = encode_info(label, &context_buf, context.len(), length);

    let mut output: BytesMaxBuffer = [0x00; MAX_BUFFER_LEN];
    crypto.hkdf_expand(HkdfAlg::Sha256, prk, &info[..info_len], &mut output[..length]);
    output
}

fn hkdf_extract_sha256<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    salt: &[u8],
    ikm: &[u8],
) -> BytesHashLen {
    let prk = crypto.hkdf_extract(HkdfAlg::Sha256, salt, ikm);
    let mut out: BytesHashLen = [0x00; SHA256_DIGEST_LEN];
    out.copy_from_slice(&prk[..SHA256_DIGEST_LEN]);
    out
}

/// TH_2 = H(G_Y, H(message_1)), both operands bstr-wrapped.
fn compute_th_2<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    g_y: &BytesEcdhElem,
    h_message_1: &BytesHashLen,
) -> Result<BytesHashLen, EDHOCError> {
    let mut input = [0u8; 2 + ECDH_ELEM_LEN + 2 + SHA256_DIGEST_LEN];
    let mut encoder = CBOREncoder::new(&mut input);
    encoder.bytes(g_y)?;
    encoder.bytes(h_message_1)?;
    let len = encoder.position();
    Ok(crypto.sha256_digest(&input[..len]))
}

/// TH_3 = H(TH_2, PLAINTEXT_2, CRED_R) and TH_4 = H(TH_3, PLAINTEXT_3,
/// CRED_I); only the leading hash is bstr-wrapped.
fn compute_th<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    th: &BytesHashLen,
    plaintext: &[u8],
    cred: &[u8],
) -> Result<BytesHashLen, EDHOCError> {
    let mut input = [0u8; MAX_TH_INPUT_LEN];
    let mut encoder = CBOREncoder::new(&mut input);
    encoder.bytes(th)?;
    encoder.raw(plaintext)?;
    encoder.raw(cred)?;
    let len = encoder.position();
    Ok(crypto.sha256_digest(&input[..len]))
}

/// `ID_CRED_X` in its map form: `{4: kid}` by reference, `{14: CCS}` by
/// value. This is what MAC contexts and the Sig_structure protected header
/// carry.
fn encode_id_cred(
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    encoder: &mut CBOREncoder,
) -> Result<(), EDHOCError> {
    match transfer {
        CredentialTransfer::ByReference => encoder.raw(&cred.get_id_cred())?,
        CredentialTransfer::ByValue => {
            encoder.map(1)?;
            encoder.uint(14)?;
            encoder.raw(cred.value.as_slice())?;
        }
    }
    Ok(())
}

/// `ID_CRED_X` in its compact plaintext form: a one-byte int for a kid, a
/// bstr for a credential by value.
fn encode_id_cred_compact(
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    encoder: &mut CBOREncoder,
) -> Result<(), EDHOCError> {
    match transfer {
        CredentialTransfer::ByReference => encoder.int_raw(cred.kid)?,
        CredentialTransfer::ByValue => encoder.bytes(cred.value.as_slice())?,
    }
    Ok(())
}

fn encode_ead_item(ead: &EADItem, encoder: &mut CBOREncoder) -> Result<(), EDHOCError> {
    if ead.is_critical {
        encoder.int(-(ead.label as i32))?;
    } else {
        encoder.uint(ead.label as usize)?;
    }
    if let Some(value) = &ead.value {
        encoder.raw(value.as_slice())?;
    }
    Ok(())
}

fn reject_unknown_critical(ead: &Option<EADItem>) -> Result<(), EDHOCError> {
    match ead {
        Some(item) if item.is_critical => Err(EDHOCError::UnknownCriticalEad),
        _ => Ok(()),
    }
}

/// MAC_2 / MAC_3 over the context `<<ID_CRED_X, TH_X, CRED_X, ? EAD_X>>`.
fn compute_mac<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    prk: &BytesHashLen,
    label: u8,
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    th: &BytesHashLen,
    ead: &Option<EADItem>,
    mac_length: usize,
) -> Result<BytesMaxBuffer, EDHOCError> {
    let mut context = [0u8; MAX_KDF_CONTEXT_LEN];
    let mut encoder = CBOREncoder::new(&mut context);
    encode_id_cred(cred, transfer, &mut encoder)?;
    encoder.bytes(th)?;
    encoder.raw(cred.value.as_slice())?;
    if let Some(ead) = ead {
        encode_ead_item(ead, &mut encoder)?;
    }
    let context_len = encoder.position();
    Ok(edhoc_kdf(crypto, prk, label, &context[..context_len], mac_length))
}

/// The Sig_structure a signing party covers: protected = ID_CRED_X,
/// external_aad = `<<TH_X, CRED_X, ? EAD_X>>`, payload = the MAC.
fn build_sig_structure(
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    th: &BytesHashLen,
    ead: &Option<EADItem>,
    mac: &[u8],
    out: &mut [u8],
) -> Result<usize, EDHOCError> {
    let mut protected = [0u8; 2 + MAX_CRED_LEN];
    let mut encoder = CBOREncoder::new(&mut protected);
    encode_id_cred(cred, transfer, &mut encoder)?;
    let protected_len = encoder.position();

    let mut external_aad = [0u8; 2 + SHA256_DIGEST_LEN + MAX_CRED_LEN + 2 + MAX_EAD_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut external_aad);
    encoder.bytes(th)?;
    encoder.raw(cred.value.as_slice())?;
    if let Some(ead) = ead {
        encode_ead_item(ead, &mut encoder)?;
    }
    let external_aad_len = encoder.position();

    let len = encode_sig_structure(
        &protected[..protected_len],
        &external_aad[..external_aad_len],
        mac,
        out,
    )?;
    Ok(len)
}

fn signature_or_mac<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    signs: bool,
    suite: &CipherSuite,
    auth_priv: &BytesEcdhElem,
    mac: &[u8],
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    th: &BytesHashLen,
    ead: &Option<EADItem>,
) -> Result<BufferSigOrMac, EDHOCError> {
    if signs {
        let mut structure = [0u8; MAX_SIG_STRUCTURE_LEN];
        let structure_len = build_sig_structure(cred, transfer, th, ead, mac, &mut structure)?;
        let signature = crypto.sign(suite.sign_alg, auth_priv, &structure[..structure_len]);
        BufferSigOrMac::new_from_slice(&signature).map_err(|_| EDHOCError::UnknownError)
    } else {
        BufferSigOrMac::new_from_slice(mac).map_err(|_| EDHOCError::UnknownError)
    }
}

fn verify_signature_or_mac<Crypto: CryptoTrait>(
    crypto: &mut Crypto,
    signs: bool,
    suite: &CipherSuite,
    received: &BufferSigOrMac,
    expected_mac: &[u8],
    cred: &CredentialRPK,
    transfer: CredentialTransfer,
    th: &BytesHashLen,
    ead: &Option<EADItem>,
) -> Result<(), EDHOCError> {
    if signs {
        let mut structure = [0u8; MAX_SIG_STRUCTURE_LEN];
        let structure_len =
            build_sig_structure(cred, transfer, th, ead, expected_mac, &mut structure)?;
        let mut signature: BytesSignature = [0x00; SIGNATURE_LEN];
        if received.len != SIGNATURE_LEN {
            return Err(EDHOCError::AuthenticationFailed);
        }
        signature.copy_from_slice(received.as_slice());
        crypto
            .verify(
                suite.sign_alg,
                &cred.public_key,
                cred.public_key_y.as_ref(),
                &structure[..structure_len],
                &signature,
            )
            .map_err(|_| EDHOCError::AuthenticationFailed)
    } else if received.as_slice() == expected_mac {
        Ok(())
    } else {
        Err(EDHOCError::AuthenticationFailed)
    }
}

/// The additional data for CIPHERTEXT_3 / CIPHERTEXT_4:
/// `["Encrypt0", h'', TH_X]`.
fn compute_enc_structure(th: &BytesHashLen, out: &mut [u8]) -> Result<usize, EDHOCError> {
    let len = encode_enc_structure(&[], th, out)?;
    Ok(len)
}

pub fn i_prepare_message_1<Crypto: CryptoTrait>(
    state: &InitiatorStart,
    crypto: &mut Crypto,
    c_i: ConnId,
    ead_1: &Option<EADItem>,
) -> Result<(WaitM2, BufferMessage1), EDHOCError> {
    let suite = CipherSuite::from_id(state.suites_i[state.suites_i_len - 1])?;

    let mut buf = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut buf);
    encoder.uint(state.method as usize)?;
    if state.suites_i_len == 1 {
        encoder.uint(state.suites_i[0] as usize)?;
    } else {
        encoder.array(state.suites_i_len)?;
        for &s in &state.suites_i[..state.suites_i_len] {
            encoder.uint(s as usize)?;
        }
    }
    encoder.bytes(&state.g_x)?;
    c_i.encode(&mut encoder)?;
    if let Some(ead_1) = ead_1 {
        encode_ead_item(ead_1, &mut encoder)?;
    }
    let len = encoder.position();

    let message_1 =
        BufferMessage1::new_from_slice(&buf[..len]).map_err(|_| EDHOCError::UnknownError)?;
    let h_message_1 = crypto.sha256_digest(message_1.as_slice());

    Ok((
        WaitM2 {
            method: state.method,
            suite,
            x: state.x,
            h_message_1,
        },
        message_1,
    ))
}

pub fn r_process_message_1<Crypto: CryptoTrait>(
    state: &ResponderStart,
    crypto: &mut Crypto,
    message_1: &BufferMessage1,
) -> Result<(ProcessingM1, Option<EADItem>), EDHOCError> {
    let (method, suites_i, suites_i_len, g_x, c_i, ead_1) = parse_message_1(message_1)?;

    let selected = selected_suite(
        &suites_i[..suites_i_len],
        &state.supported_suites[..state.supported_suites_len],
    )?;
    let suite = CipherSuite::from_id(selected)?;

    reject_unknown_critical(&ead_1)?;

    let h_message_1 = crypto.sha256_digest(message_1.as_slice());
    let (y, g_y) = crypto.generate_key_pair(suite.curve);

    Ok((
        ProcessingM1 {
            method,
            suite,
            y,
            g_y,
            c_i,
            g_x,
            h_message_1,
        },
        ead_1,
    ))
}

/// EDHOC error message with `ERR_CODE` 2, carrying the suites the responder
/// is willing to accept.
pub fn encode_suites_error_message(supported: &[u8]) -> Result<BufferErrorMessage, EDHOCError> {
    let mut buf = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut buf);
    encoder.int(ERR_CODE_WRONG_SELECTED_SUITE as i32)?;
    if supported.len() == 1 {
        encoder.uint(supported[0] as usize)?;
    } else {
        encoder.array(supported.len())?;
        for &s in supported {
            encoder.uint(s as usize)?;
        }
    }
    let len = encoder.position();
    BufferErrorMessage::new_from_slice(&buf[..len]).map_err(|_| EDHOCError::UnknownError)
}

#[allow(clippy::too_many_arguments)]
pub fn r_prepare_message_2<Crypto: CryptoTrait>(
    state: &ProcessingM1,
    crypto: &mut Crypto,
    cred_r: CredentialRPK,
    r: &BytesEcdhElem,
    c_r: ConnId,
    cred_transfer: CredentialTransfer,
    ead_2: &Option<EADItem>,
) -> Result<(WaitM3, BufferMessage2), EDHOCError> {
    let th_2 = compute_th_2(crypto, &state.g_y, &state.h_message_1)?;

    let g_xy = crypto.ecdh(state.suite.curve, &state.y, &state.g_x);
    let prk_2e = hkdf_extract_sha256(crypto, &th_2, &g_xy);

    let prk_3e2m = if state.method.responder_signs() {
        prk_2e
    } else {
        let salt_3e2m = edhoc_kdf(crypto, &prk_2e, SALT_3E2M_LABEL, &th_2, SHA256_DIGEST_LEN);
        let g_rx = crypto.ecdh(state.suite.curve, r, &state.g_x);
        hkdf_extract_sha256(crypto, &salt_3e2m[..SHA256_DIGEST_LEN], &g_rx)
    };

    let mac_2_len = if state.method.responder_signs() {
        SHA256_DIGEST_LEN
    } else {
        state.suite.mac_length
    };
    let mac_2 = compute_mac(
        crypto,
        &prk_3e2m,
        MAC_2_LABEL,
        &cred_r,
        cred_transfer,
        &th_2,
        ead_2,
        mac_2_len,
    )?;

    let sig_or_mac_2 = signature_or_mac(
        crypto,
        state.method.responder_signs(),
        &state.suite,
        r,
        &mac_2[..mac_2_len],
        &cred_r,
        cred_transfer,
        &th_2,
        ead_2,
    )?;

    // PLAINTEXT_2 = (ID_CRED_R, Signature_or_MAC_2, ? EAD_2)
    let mut pt = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut pt);
    encode_id_cred_compact(&cred_r, cred_transfer, &mut encoder)?;
    encoder.bytes(sig_or_mac_2.as_slice())?;
    if let Some(ead_2) = ead_2 {
        encode_ead_item(ead_2, &mut encoder)?;
    }
    let plaintext_2_len = encoder.position();
    let plaintext_2 = BufferPlaintext2::new_from_slice(&pt[..plaintext_2_len])
        .map_err(|_| EDHOCError::UnknownError)?;

    // CIPHERTEXT_2 = PLAINTEXT_2 XOR KEYSTREAM_2
    let keystream_2 = edhoc_kdf(crypto, &prk_2e, KEYSTREAM_2_LABEL, &th_2, plaintext_2.len);
    let mut ciphertext_2 = plaintext_2;
    for i in 0..ciphertext_2.len {
        ciphertext_2.content[i] ^= keystream_2[i];
    }

    let th_3 = compute_th(crypto, &th_2, plaintext_2.as_slice(), cred_r.value.as_slice())?;

    // message_2 = (G_Y || CIPHERTEXT_2 : bstr, C_R)
    let mut g_y_ciphertext = [0u8; ECDH_ELEM_LEN + MAX_MESSAGE_SIZE_LEN];
    g_y_ciphertext[..ECDH_ELEM_LEN].copy_from_slice(&state.g_y);
    g_y_ciphertext[ECDH_ELEM_LEN..ECDH_ELEM_LEN + ciphertext_2.len]
        .copy_from_slice(ciphertext_2.as_slice());

    let mut buf = [0u8; 3 + ECDH_ELEM_LEN + MAX_MESSAGE_SIZE_LEN + 2 + MAX_CONN_ID_LEN];
    let mut encoder = CBOREncoder::new(&mut buf);
    encoder.bytes(&g_y_ciphertext[..ECDH_ELEM_LEN + ciphertext_2.len])?;
    c_r.encode(&mut encoder)?;
    let message_2_len = encoder.position();
    let message_2 = BufferMessage2::new_from_slice(&buf[..message_2_len])
        .map_err(|_| EDHOCError::UnknownError)?;

    Ok((
        WaitM3 {
            method: state.method,
            suite: state.suite,
            y: state.y,
            prk_3e2m,
            th_3,
        },
        message_2,
    ))
}

pub fn i_parse_message_2<Crypto: CryptoTrait>(
    state: &WaitM2,
    crypto: &mut Crypto,
    message_2: &BufferMessage2,
) -> Result<(ProcessingM2, ConnId, CredentialRPK, Option<EADItem>), EDHOCError> {
    let (g_y, ciphertext_2, c_r) = parse_message_2(message_2)?;

    let th_2 = compute_th_2(crypto, &g_y, &state.h_message_1)?;
    let g_xy = crypto.ecdh(state.suite.curve, &state.x, &g_y);
    let prk_2e = hkdf_extract_sha256(crypto, &th_2, &g_xy);

    let keystream_2 = edhoc_kdf(crypto, &prk_2e, KEYSTREAM_2_LABEL, &th_2, ciphertext_2.len);
    let mut plaintext_2 = ciphertext_2;
    for i in 0..plaintext_2.len {
        plaintext_2.content[i] ^= keystream_2[i];
    }

    let sig_or_mac_2_len = if state.method.responder_signs() {
        SIGNATURE_LEN
    } else {
        state.suite.mac_length
    };
    let (id_cred_r, sig_or_mac_2, ead_2) = decode_plaintext_2(&plaintext_2, sig_or_mac_2_len)?;
    reject_unknown_critical(&ead_2)?;

    let (cred_r, cred_r_transfer) = match id_cred_r {
        IdCred::CompactKid(kid) => (
            CredentialRPK::new_from_kid(kid),
            CredentialTransfer::ByReference,
        ),
        IdCred::FullCredential(value) => (
            CredentialRPK::new(value.try_into().map_err(|_| EDHOCError::ParsingError)?)?,
            CredentialTransfer::ByValue,
        ),
    };

    Ok((
        ProcessingM2 {
            method: state.method,
            suite: state.suite,
            sig_or_mac_2,
            prk_2e,
            th_2,
            x: state.x,
            g_y,
            plaintext_2,
            c_r,
            cred_r_transfer,
            ead_2: ead_2.clone(),
        },
        c_r,
        cred_r,
        ead_2,
    ))
}

pub fn i_verify_message_2<Crypto: CryptoTrait>(
    state: &ProcessingM2,
    crypto: &mut Crypto,
    valid_cred_r: CredentialRPK,
    i: BytesEcdhElem,
) -> Result<ProcessedM2, EDHOCError> {
    let prk_3e2m = if state.method.responder_signs() {
        state.prk_2e
    } else {
        let salt_3e2m = edhoc_kdf(
            crypto,
            &state.prk_2e,
            SALT_3E2M_LABEL,
            &state.th_2,
            SHA256_DIGEST_LEN,
        );
        let g_rx = crypto.ecdh(state.suite.curve, &state.x, &valid_cred_r.public_key);
        hkdf_extract_sha256(crypto, &salt_3e2m[..SHA256_DIGEST_LEN], &g_rx)
    };

    let mac_2_len = if state.method.responder_signs() {
        SHA256_DIGEST_LEN
    } else {
        state.suite.mac_length
    };
    let mac_2 = compute_mac(
        crypto,
        &prk_3e2m,
        MAC_2_LABEL,
        &valid_cred_r,
        state.cred_r_transfer,
        &state.th_2,
        &state.ead_2,
        mac_2_len,
    )?;

    verify_signature_or_mac(
        crypto,
        state.method.responder_signs(),
        &state.suite,
        &state.sig_or_mac_2,
        &mac_2[..mac_2_len],
        &valid_cred_r,
        state.cred_r_transfer,
        &state.th_2,
        &state.ead_2,
    )?;

    let th_3 = compute_th(
        crypto,
        &state.th_2,
        state.plaintext_2.as_slice(),
        valid_cred_r.value.as_slice(),
    )?;

    let prk_4e3m = if state.method.initiator_signs() {
        prk_3e2m
    } else {
        let salt_4e3m = edhoc_kdf(crypto, &prk_3e2m, SALT_4E3M_LABEL, &th_3, SHA256_DIGEST_LEN);
        let g_iy = crypto.ecdh(state.suite.curve, &i, &state.g_y);
        hkdf_extract_sha256(crypto, &salt_4e3m[..SHA256_DIGEST_LEN], &g_iy)
    };

    Ok(ProcessedM2 {
        method: state.method,
        suite: state.suite,
        prk_3e2m,
        prk_4e3m,
        th_3,
        i,
    })
}

pub fn i_prepare_message_3<Crypto: CryptoTrait>(
    state: &ProcessedM2,
    crypto: &mut Crypto,
    cred_i: CredentialRPK,
    cred_transfer: CredentialTransfer,
    ead_3: &Option<EADItem>,
) -> Result<(Completed, BufferMessage3, BytesHashLen), EDHOCError> {
    let mac_3_len = if state.method.initiator_signs() {
        SHA256_DIGEST_LEN
    } else {
        state.suite.mac_length
    };
    let mac_3 = compute_mac(
        crypto,
        &state.prk_4e3m,
        MAC_3_LABEL,
        &cred_i,
        cred_transfer,
        &state.th_3,
        ead_3,
        mac_3_len,
    )?;

    let sig_or_mac_3 = signature_or_mac(
        crypto,
        state.method.initiator_signs(),
        &state.suite,
        &state.i,
        &mac_3[..mac_3_len],
        &cred_i,
        cred_transfer,
        &state.th_3,
        ead_3,
    )?;

    // PLAINTEXT_3 = (ID_CRED_I, Signature_or_MAC_3, ? EAD_3)
    let mut pt = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut pt);
    encode_id_cred_compact(&cred_i, cred_transfer, &mut encoder)?;
    encoder.bytes(sig_or_mac_3.as_slice())?;
    if let Some(ead_3) = ead_3 {
        encode_ead_item(ead_3, &mut encoder)?;
    }
    let plaintext_3_len = encoder.position();

    let k_3 = edhoc_kdf(
        crypto,
        &state.prk_3e2m,
        K_3_LABEL,
        &state.th_3,
        state.suite.key_len(),
    );
    let iv_3 = edhoc_kdf(
        crypto,
        &state.prk_3e2m,
        IV_3_LABEL,
        &state.th_3,
        state.suite.iv_len(),
    );
    let mut a_3 = [0u8; MAX_A_3_LEN];
    let a_3_len = compute_enc_structure(&state.th_3, &mut a_3)?;

    let mut ciphertext_3 = [0u8; MAX_MESSAGE_SIZE_LEN + 16];
    let ciphertext_3_len = crypto
        .aead_encrypt(
            state.suite.aead,
            &k_3[..state.suite.key_len()],
            &iv_3[..state.suite.iv_len()],
            &a_3[..a_3_len],
            &pt[..plaintext_3_len],
            &mut ciphertext_3,
        )
        .map_err(|_| EDHOCError::UnknownError)?;

    let mut buf = [0u8; 3 + MAX_MESSAGE_SIZE_LEN + 16];
    let mut encoder = CBOREncoder::new(&mut buf);
    encoder.bytes(&ciphertext_3[..ciphertext_3_len])?;
    let message_3_len = encoder.position();
    let message_3 = BufferMessage3::new_from_slice(&buf[..message_3_len])
        .map_err(|_| EDHOCError::UnknownError)?;

    let th_4 = compute_th(
        crypto,
        &state.th_3,
        &pt[..plaintext_3_len],
        cred_i.value.as_slice(),
    )?;

    let prk_out_buf = edhoc_kdf(
        crypto,
        &state.prk_4e3m,
        PRK_OUT_LABEL,
        &th_4,
        SHA256_DIGEST_LEN,
    );
    let mut prk_out: BytesHashLen = [0x00; SHA256_DIGEST_LEN];
    prk_out.copy_from_slice(&prk_out_buf[..SHA256_DIGEST_LEN]);

    let prk_exporter_buf = edhoc_kdf(crypto, &prk_out, PRK_EXPORTER_LABEL, &[], SHA256_DIGEST_LEN);
    let mut prk_exporter: BytesHashLen = [0x00; SHA256_DIGEST_LEN];
    prk_exporter.copy_from_slice(&prk_exporter_buf[..SHA256_DIGEST_LEN]);

    Ok((
        Completed {
            suite: state.suite,
            prk_4e3m: state.prk_4e3m,
            th_4,
            prk_out,
            prk_exporter,
        },
        message_3,
        prk_out,
    ))
}

pub fn r_parse_message_3<Crypto: CryptoTrait>(
    state: &WaitM3,
    crypto: &mut Crypto,
    message_3: &BufferMessage3,
) -> Result<(ProcessingM3, CredentialRPK, Option<EADItem>), EDHOCError> {
    let ciphertext_3 = parse_message_3(message_3)?;

    let k_3 = edhoc_kdf(
        crypto,
        &state.prk_3e2m,
        K_3_LABEL,
        &state.th_3,
        state.suite.key_len(),
    );
    let iv_3 = edhoc_kdf(
        crypto,
        &state.prk_3e2m,
        IV_3_LABEL,
        &state.th_3,
        state.suite.iv_len(),
    );
    let mut a_3 = [0u8; MAX_A_3_LEN];
    let a_3_len = compute_enc_structure(&state.th_3, &mut a_3)?;

    let mut pt = [0u8; MAX_MESSAGE_SIZE_LEN];
    let plaintext_3_len = crypto
        .aead_decrypt(
            state.suite.aead,
            &k_3[..state.suite.key_len()],
            &iv_3[..state.suite.iv_len()],
            &a_3[..a_3_len],
            ciphertext_3.as_slice(),
            &mut pt,
        )
        .map_err(|_| EDHOCError::AuthenticationFailed)?;
    let plaintext_3 = BufferPlaintext3::new_from_slice(&pt[..plaintext_3_len])
        .map_err(|_| EDHOCError::ParsingError)?;

    let sig_or_mac_3_len = if state.method.initiator_signs() {
        SIGNATURE_LEN
    } else {
        state.suite.mac_length
    };
    let (id_cred_i, sig_or_mac_3, ead_3) = decode_plaintext_3(&plaintext_3, sig_or_mac_3_len)?;
    reject_unknown_critical(&ead_3)?;

    let (cred_i, cred_i_transfer) = match id_cred_i {
        IdCred::CompactKid(kid) => (
            CredentialRPK::new_from_kid(kid),
            CredentialTransfer::ByReference,
        ),
        IdCred::FullCredential(value) => (
            CredentialRPK::new(value.try_into().map_err(|_| EDHOCError::ParsingError)?)?,
            CredentialTransfer::ByValue,
        ),
    };

    Ok((
        ProcessingM3 {
            method: state.method,
            suite: state.suite,
            sig_or_mac_3,
            y: state.y,
            prk_3e2m: state.prk_3e2m,
            th_3: state.th_3,
            plaintext_3,
            cred_i_transfer,
            ead_3: ead_3.clone(),
        },
        cred_i,
        ead_3,
    ))
}

pub fn r_verify_message_3<Crypto: CryptoTrait>(
    state: &ProcessingM3,
    crypto: &mut Crypto,
    valid_cred_i: CredentialRPK,
) -> Result<(Completed, BytesHashLen), EDHOCError> {
    let prk_4e3m = if state.method.initiator_signs() {
        state.prk_3e2m
    } else {
        let salt_4e3m = edhoc_kdf(
            crypto,
            &state.prk_3e2m,
            SALT_4E3M_LABEL,
            &state.th_3,
            SHA256_DIGEST_LEN,
        );
        let g_iy = crypto.ecdh(state.suite.curve, &state.y, &valid_cred_i.public_key);
        hkdf_extract_sha256(crypto, &salt_4e3m[..SHA256_DIGEST_LEN], &g_iy)
    };

    let mac_3_len = if state.method.initiator_signs() {
        SHA256_DIGEST_LEN
    } else {
        state.suite.mac_length
    };
    let mac_3 = compute_mac(
        crypto,
        &prk_4e3m,
        MAC_3_LABEL,
        &valid_cred_i,
        state.cred_i_transfer,
        &state.th_3,
        &state.ead_3,
        mac_3_len,
    )?;

    verify_signature_or_mac(
        crypto,
        state.method.initiator_signs(),
        &state.suite,
        &state.sig_or_mac_3,
        &mac_3[..mac_3_len],
        &valid_cred_i,
        state.cred_i_transfer,
        &state.th_3,
        &state.ead_3,
    )?;

    let th_4 = compute_th(
        crypto,
        &state.th_3,
        state.plaintext_3.as_slice(),
        valid_cred_i.value.as_slice(),
    )?;

    let prk_out_buf = edhoc_kdf(crypto, &prk_4e3m, PRK_OUT_LABEL, &th_4, SHA256_DIGEST_LEN);
    let mut prk_out: BytesHashLen = [0x00; SHA256_DIGEST_LEN];
    prk_out.copy_from_slice(&prk_out_buf[..SHA256_DIGEST_LEN]);

    let prk_exporter_buf = edhoc_kdf(crypto, &prk_out, PRK_EXPORTER_LABEL, &[], SHA256_DIGEST_LEN);
    let mut prk_exporter: BytesHashLen = [0x00; SHA256_DIGEST_LEN];
    prk_exporter.copy_from_slice(&prk_exporter_buf[..SHA256_DIGEST_LEN]);

    Ok((
        Completed {
            suite: state.suite,
            prk_4e3m,
            th_4,
            prk_out,
            prk_exporter,
        },
        prk_out,
    ))
}

/// The optional fourth message: key confirmation from the responder,
/// carrying at most an EAD item.
pub fn r_prepare_message_4<Crypto: CryptoTrait>(
    state: &Completed,
    crypto: &mut Crypto,
    ead_4: &Option<EADItem>,
) -> Result<BufferMessage4, EDHOCError> {
    let mut pt = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CBOREncoder::new(&mut pt);
    if let Some(ead_4) = ead_4 {
        encode_ead_item(ead_4, &mut encoder)?;
    }
    let plaintext_4_len = encoder.position();

    let k_4 = edhoc_kdf(
        crypto,
        &state.prk_4e3m,
        K_4_LABEL,
        &state.th_4,
        state.suite.key_len(),
    );
    let iv_4 = edhoc_kdf(
        crypto,
        &state.prk_4e3m,
        IV_4_LABEL,
        &state.th_4,
        state.suite.iv_len(),
    );
    let mut a_4 = [0u8; MAX_A_3_LEN];
    let a_4_len = compute_enc_structure(&state.th_4, &mut a_4)?;

    let mut ciphertext_4 = [0u8; MAX_MESSAGE_SIZE_LEN + 16];
    let ciphertext_4_len = crypto
        .aead_encrypt(
            state.suite.aead,
            &k_4[..state.suite.key_len()],
            &iv_4[..state.suite.iv_len()],
            &a_4[..a_4_len],
            &pt[..plaintext_4_len],
            &mut ciphertext_4,
        )
        .map_err(|_| EDHOCError::UnknownError)?;

    let mut buf = [0u8; 3 + MAX_MESSAGE_SIZE_LEN + 16];
    let mut encoder = CBOREncoder::new(&mut buf);
    encoder.bytes(&ciphertext_4[..ciphertext_4_len])?;
    let message_4_len = encoder.position();
    BufferMessage4::new_from_slice(&buf[..message_4_len]).map_err(|_| EDHOCError::UnknownError)
}

pub fn i_process_message_4<Crypto: CryptoTrait>(
    state: &Completed,
    crypto: &mut Crypto,
    message_4: &BufferMessage4,
) -> Result<Option<EADItem>, EDHOCError> {
    let ciphertext_4 = parse_message_4(message_4)?;

    let k_4 = edhoc_kdf(
        crypto,
        &state.prk_4e3m,
        K_4_LABEL,
        &state.th_4,
        state.suite.key_len(),
    );
    let iv_4 = edhoc_kdf(
        crypto,
        &state.prk_4e3m,
        IV_4_LABEL,
        &state.th_4,
        state.suite.iv_len(),
    );
    let mut a_4 = [0u8; MAX_A_3_LEN];
    let a_4_len = compute_enc_structure(&state.th_4, &mut a_4)?;

    let mut pt = [0u8; MAX_MESSAGE_SIZE_LEN];
    let plaintext_4_len = crypto
        .aead_decrypt(
            state.suite.aead,
            &k_4[..state.suite.key_len()],
            &iv_4[..state.suite.iv_len()],
            &a_4[..a_4_len],
            ciphertext_4.as_slice(),
            &mut pt,
        )
        .map_err(|_| EDHOCError::AuthenticationFailed)?;

    let plaintext_4 = BufferPlaintext4::new_from_slice(&pt[..plaintext_4_len])
        .map_err(|_| EDHOCError::ParsingError)?;
    let ead_4 = decode_plaintext_4(&plaintext_4)?;
    reject_unknown_critical(&ead_4)?;
    Ok(ead_4)
}

pub fn edhoc_exporter<Crypto: CryptoTrait>(
    state: &Completed,
    crypto: &mut Crypto,
    label: u8,
    context: &BytesMaxContextBuffer,
    context_len: usize,
    length: usize,
) -> BytesMaxBuffer {
    edhoc_kdf(
        crypto,
        &state.prk_exporter,
        label,
        &context[..context_len],
        length,
    )
}

/// EDHOC-KeyUpdate: feed a nonce into PRK_out and refresh PRK_exporter.
pub fn edhoc_key_update<Crypto: CryptoTrait>(
    state: &mut Completed,
    crypto: &mut Crypto,
    context: &BytesMaxContextBuffer,
    context_len: usize,
) -> BytesHashLen {
    let prk_new_buf = edhoc_kdf(
        crypto,
        &state.prk_out,
        KEY_UPDATE_LABEL,
        &context[..context_len],
        SHA256_DIGEST_LEN,
    );
    state.prk_out.copy_from_slice(&prk_new_buf[..SHA256_DIGEST_LEN]);

    let prk_exporter_buf = edhoc_kdf(
        crypto,
        &state.prk_out,
        PRK_EXPORTER_LABEL,
        &[],
        SHA256_DIGEST_LEN,
    );
    state
        .prk_exporter
        .copy_from_slice(&prk_exporter_buf[..SHA256_DIGEST_LEN]);

    state.prk_out
}
