//! The inbound transform: OSCORE in, CoAP out (RFC 8613, Section 8.2/8.4).

use shoals_coap::{parse_options_and_payload, OptionList, Packet};
use shoals_shared::Crypto;

use crate::context::{SecurityContext, MAX_NONCE_LEN};
use crate::option::{
    decode_oscore_option, is_class_e, piv_to_u64, ECHO_OPTION, OBSERVE_OPTION, OSCORE_OPTION,
};
use crate::{create_aad, create_nonce, OscoreError, MAX_AAD_LEN, MAX_PLAINTEXT_LEN};

/// Unprotects one OSCORE message back into the CoAP message it carries,
/// writing the result into `buf_coap` and returning its length.
///
/// A message without an OSCORE option is reported as
/// [OscoreError::NoOscoreOption]; the caller routes it to its plain CoAP
/// layer. The replay window is only advanced after the AEAD verified, so a
/// forged message can never poison it.
pub fn oscore2coap<C: Crypto>(
    crypto: &mut C,
    buf_oscore: &[u8],
    ctx: &mut SecurityContext,
    buf_coap: &mut [u8],
) -> Result<usize, OscoreError> {
    let packet = Packet::from_bytes(buf_oscore)?;
    oscore_debug!("oscore2coap: unprotecting {} bytes", buf_oscore.len());

    let Some(oscore_opt) = packet.options.find(OSCORE_OPTION) else {
        return Err(OscoreError::NoOscoreOption);
    };
    let option = decode_oscore_option(oscore_opt.value)?;

    let is_request = packet.is_request();

    // 1. locate the context addressed by (kid, kid context)
    if is_request {
        let kid = option.kid.as_ref().ok_or(OscoreError::MalformedPacket)?;
        if kid.as_slice() != ctx.rc.recipient_id.as_slice() {
            return Err(OscoreError::ContextNotFound);
        }
        let id_context_matches = match (&option.kid_context, &ctx.cc.id_context) {
            (None, None) => true,
            (Some(received), Some(own)) => received.as_slice() == own.as_slice(),
            _ => false,
        };
        if !id_context_matches {
            return Err(OscoreError::ContextNotFound);
        }
    }

    // 2. replay check up front; the window commits only after decryption
    let piv_present = !option.piv.is_empty();
    let piv_num = piv_to_u64(option.piv.as_slice());
    if is_request {
        if !piv_present {
            return Err(OscoreError::MalformedPacket);
        }
        ctx.rc.replay_window.check(piv_num)?;
    }

    // 3. nonce from the received partial IV; a response without its own
    //    partial IV reuses the nonce of the request it answers
    let nonce_len = ctx.cc.aead_alg.nonce_len();
    let mut nonce_buf = [0u8; MAX_NONCE_LEN];
    let nonce: &[u8] = if piv_present {
        // the peer generated this partial IV, so its ID goes in
        create_nonce(
            ctx.rc.recipient_id.as_slice(),
            option.piv.as_slice(),
            ctx.cc.common_iv.as_slice(),
            &mut nonce_buf[..nonce_len],
        )?;
        &nonce_buf[..nonce_len]
    } else {
        // a PIV-less response correlates with the request whose nonce was
        // cached when it was protected
        if ctx.rrc.nonce.len != nonce_len {
            return Err(OscoreError::ContextNotFound);
        }
        ctx.rrc.nonce.as_slice()
    };

    // 4. AAD from the request's kid and partial IV
    let (aad_kid, aad_piv) = if is_request {
        (option.kid.unwrap_or_default(), option.piv)
    } else {
        (ctx.rrc.request_kid, ctx.rrc.request_piv)
    };
    let mut aad = [0u8; MAX_AAD_LEN];
    let aad_len = create_aad(
        ctx.cc.aead_alg,
        aad_kid.as_slice(),
        aad_piv.as_slice(),
        &mut aad,
    )?;

    // 5. decrypt; a tag failure surfaces as the one opaque error
    let mut plaintext = [0u8; MAX_PLAINTEXT_LEN];
    let plaintext_len = crypto
        .aead_decrypt(
            ctx.cc.aead_alg,
            ctx.rc.recipient_key.as_slice(),
            nonce,
            &aad[..aad_len],
            packet.payload,
            &mut plaintext,
        )
        .map_err(|_| OscoreError::AuthFailed)?;

    // 6. committed: slide the window and cache the request correlation state
    //    the paired response will need
    if is_request {
        ctx.rc.replay_window.update(piv_num);
        ctx.rrc.request_kid = option.kid.unwrap_or_default();
        ctx.rrc.request_piv = option.piv;
        ctx.rrc.nonce.fill_with_slice(&nonce_buf[..nonce_len])?;
    }

    // 7. parse the plaintext: inner code, E-options, inner payload
    let inner_code = *plaintext[..plaintext_len]
        .first()
        .ok_or(OscoreError::MalformedPacket)?;
    let (e_options, inner_payload) = parse_options_and_payload(&plaintext[1..plaintext_len])?;

    // 8. freshness re-binding: the first response after a reboot must echo
    //    the challenge we sent
    if !is_request && ctx.rrc.reboot {
        let echo = e_options
            .find(ECHO_OPTION)
            .ok_or(OscoreError::EchoMismatch)?;
        if echo.value != ctx.rrc.echo_opt_val.as_slice() {
            return Err(OscoreError::EchoMismatch);
        }
        ctx.rrc.reboot = false;
    }

    // 9. rebuild: header and token from the outer packet, code from the
    //    plaintext, U-options (minus OSCORE) merged with E-options, observe
    //    deduplicated with the outer value winning when the inner is elided
    let mut out = Packet::new();
    out.header = packet.header;
    out.header.code = inner_code.into();
    out.token = packet.token;

    let mut options = OptionList::new();
    let inner_observe = e_options.find(OBSERVE_OPTION);
    let outer_observe = packet.options.find(OBSERVE_OPTION);
    match (inner_observe, outer_observe) {
        (Some(inner), _) if !inner.value.is_empty() => {
            options.insert(OBSERVE_OPTION, inner.value)?;
        }
        (Some(_), Some(outer)) | (None, Some(outer)) => {
            options.insert(OBSERVE_OPTION, outer.value)?;
        }
        (Some(inner), None) => {
            options.insert(OBSERVE_OPTION, inner.value)?;
        }
        (None, None) => {}
    }
    for record in e_options.iter() {
        if record.number != OBSERVE_OPTION {
            options.insert(record.number, record.value)?;
        }
    }
    for record in packet.options.iter() {
        if record.number != OSCORE_OPTION
            && record.number != OBSERVE_OPTION
            && !is_class_e(record.number)
        {
            options.insert(record.number, record.value)?;
        }
    }
    out.options = options;
    out.payload = inner_payload;

    let len = out.to_bytes(buf_coap)?;
    Ok(len)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coap2oscore;
    use crate::context::ContextConfig;
    use hexlit::hex;
    use shoals_coap::{MessageClass, RequestType, ResponseType};
    use shoals_shared::{AeadAlg, HkdfAlg};
    use shoals_crypto::default_crypto;

    fn config(sender_id: &[u8], recipient_id: &[u8]) -> ContextConfig {
        ContextConfig {
            aead_alg: AeadAlg::AesCcm16_64_128,
            hkdf_alg: HkdfAlg::Sha256,
            replay_window_bits: 32,
            master_secret: hex!("0102030405060708090a0b0c0d0e0f10")[..].try_into().unwrap(),
            master_salt: hex!("9e7ca92223786340")[..].try_into().unwrap(),
            id_context: None,
            sender_id: sender_id.try_into().unwrap(),
            recipient_id: recipient_id.try_into().unwrap(),
            max_unfragmented_size: 1024,
        }
    }

    fn matched_pair() -> (SecurityContext, SecurityContext) {
        let client =
            SecurityContext::new(&mut default_crypto(), config(&[], &[0x01])).unwrap();
        let server =
            SecurityContext::new(&mut default_crypto(), config(&[0x01], &[])).unwrap();
        (client, server)
    }

    fn sample_request() -> [u8; 22] {
        hex!("44015d1f00003974396c6f63616c686f737483747631")
    }

    #[test]
    fn test_request_roundtrip() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();

        let mut recovered = [0u8; 128];
        let recovered_len = oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut server,
            &mut recovered,
        )
        .unwrap();

        assert_eq!(&recovered[..recovered_len], &sample_request());
    }

    #[test]
    fn test_response_roundtrip() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        // request first, so both sides hold the correlation state
        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();
        let mut scratch = [0u8; 128];
        oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut server,
            &mut scratch,
        )
        .unwrap();

        // 2.05 response with token and payload
        let response = hex!("64455d1f00003974ff48656c6c6f");
        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &response, &mut server, &mut protected).unwrap();

        // a plain response carries an empty OSCORE option and code Changed
        let outer = Packet::from_bytes(&protected[..protected_len]).unwrap();
        assert_eq!(
            outer.header.code,
            MessageClass::Response(ResponseType::Changed)
        );
        assert!(outer.options.find(OSCORE_OPTION).unwrap().value.is_empty());

        let mut recovered = [0u8; 128];
        let recovered_len = oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut client,
            &mut recovered,
        )
        .unwrap();
        assert_eq!(&recovered[..recovered_len], &response);
    }

    #[test]
    fn test_replay_rejected() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();

        let mut out = [0u8; 128];
        oscore2coap(&mut crypto, &protected[..protected_len], &mut server, &mut out).unwrap();
        assert_eq!(
            oscore2coap(&mut crypto, &protected[..protected_len], &mut server, &mut out)
                .unwrap_err(),
            OscoreError::Replayed
        );
    }

    #[test]
    fn test_tampered_ciphertext_rejected_window_unchanged() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();

        let mut tampered = protected;
        tampered[protected_len - 1] ^= 0x01;
        let mut out = [0u8; 128];
        assert_eq!(
            oscore2coap(&mut crypto, &tampered[..protected_len], &mut server, &mut out)
                .unwrap_err(),
            OscoreError::AuthFailed
        );
        // the window did not advance: the untampered original still decrypts
        oscore2coap(&mut crypto, &protected[..protected_len], &mut server, &mut out).unwrap();
    }

    #[test]
    fn test_wrong_kid_is_context_not_found() {
        let mut crypto = default_crypto();
        let (mut client, _) = matched_pair();
        // a server whose recipient id does not match the client's sender id
        let mut other_server =
            SecurityContext::new(&mut crypto, config(&[0x05], &[0x44])).unwrap();

        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();
        let mut out = [0u8; 128];
        assert_eq!(
            oscore2coap(
                &mut crypto,
                &protected[..protected_len],
                &mut other_server,
                &mut out
            )
            .unwrap_err(),
            OscoreError::ContextNotFound
        );
    }

    #[test]
    fn test_no_oscore_option_passthrough() {
        let mut crypto = default_crypto();
        let (mut client, _) = matched_pair();
        let mut out = [0u8; 128];
        assert_eq!(
            oscore2coap(&mut crypto, &sample_request(), &mut client, &mut out).unwrap_err(),
            OscoreError::NoOscoreOption
        );
    }

    #[test]
    fn test_observe_notification_flow() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        // Observe=0 registration
        let mut request = Packet::new();
        request.header.code = MessageClass::Request(RequestType::Get);
        request.options.push(6, &[]).unwrap();
        request.options.push(11, b"tv1").unwrap();
        let mut request_buf = [0u8; 64];
        let request_len = request.to_bytes(&mut request_buf).unwrap();

        let mut protected = [0u8; 128];
        let protected_len = coap2oscore(
            &mut crypto,
            &request_buf[..request_len],
            &mut client,
            &mut protected,
        )
        .unwrap();
        let outer = Packet::from_bytes(&protected[..protected_len]).unwrap();
        assert_eq!(outer.header.code, MessageClass::Request(RequestType::Fetch));

        let mut recovered = [0u8; 128];
        let recovered_len = oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut server,
            &mut recovered,
        )
        .unwrap();
        let inner = Packet::from_bytes(&recovered[..recovered_len]).unwrap();
        assert_eq!(inner.header.code, MessageClass::Request(RequestType::Get));
        assert!(inner.options.contains(6));

        // notification: outer Observe=42, inner elided, own partial IV
        let mut notification = Packet::new();
        notification.header.code = MessageClass::Response(ResponseType::Content);
        notification.options.push(6, &[0x2a]).unwrap();
        notification.payload = b"22.5 C";
        let mut notification_buf = [0u8; 64];
        let notification_len = notification.to_bytes(&mut notification_buf).unwrap();

        let mut protected = [0u8; 128];
        let protected_len = coap2oscore(
            &mut crypto,
            &notification_buf[..notification_len],
            &mut server,
            &mut protected,
        )
        .unwrap();
        let outer = Packet::from_bytes(&protected[..protected_len]).unwrap();
        assert_eq!(
            outer.header.code,
            MessageClass::Response(ResponseType::Content)
        );
        assert_eq!(outer.options.find(6).unwrap().value, &[0x2a]);
        // notifications carry their own partial IV
        assert!(!outer.options.find(OSCORE_OPTION).unwrap().value.is_empty());

        let mut recovered = [0u8; 128];
        let recovered_len = oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut client,
            &mut recovered,
        )
        .unwrap();
        let inner = Packet::from_bytes(&recovered[..recovered_len]).unwrap();
        assert_eq!(inner.options.find(6).unwrap().value, &[0x2a]);
        assert_eq!(inner.payload, b"22.5 C");
    }

    #[test]
    fn test_reboot_echo_flow() {
        let mut crypto = default_crypto();
        let (mut client, mut server) = matched_pair();

        client.rrc.reboot = true;
        let mut protected = [0u8; 128];
        let protected_len =
            coap2oscore(&mut crypto, &sample_request(), &mut client, &mut protected).unwrap();

        // the server sees the ECHO challenge among the inner options
        let mut recovered = [0u8; 128];
        let recovered_len = oscore2coap(
            &mut crypto,
            &protected[..protected_len],
            &mut server,
            &mut recovered,
        )
        .unwrap();
        let inner = Packet::from_bytes(&recovered[..recovered_len]).unwrap();
        let challenge = inner.options.find(ECHO_OPTION).unwrap().value;
        assert_eq!(challenge.len(), crate::ECHO_VALUE_LEN);

        // response that does not echo the value: rejected
        let bare_response = hex!("64455d1f00003974ff48656c6c6f");
        let mut protected_resp = [0u8; 128];
        let resp_len =
            coap2oscore(&mut crypto, &bare_response, &mut server, &mut protected_resp).unwrap();
        let mut out = [0u8; 128];
        assert_eq!(
            oscore2coap(&mut crypto, &protected_resp[..resp_len], &mut client, &mut out)
                .unwrap_err(),
            OscoreError::EchoMismatch
        );
        assert!(client.rrc.reboot);

        // response echoing the challenge: accepted, reboot state cleared
        let token = hex!("00003974");
        let mut echoed = Packet::new();
        echoed.header = Packet::from_bytes(&bare_response).unwrap().header;
        echoed.token = &token;
        echoed.options.push(ECHO_OPTION, challenge).unwrap();
        echoed.payload = b"Hello";
        let mut echoed_buf = [0u8; 64];
        let echoed_len = echoed.to_bytes(&mut echoed_buf).unwrap();

        let mut protected_resp = [0u8; 128];
        let resp_len = coap2oscore(
            &mut crypto,
            &echoed_buf[..echoed_len],
            &mut server,
            &mut protected_resp,
        )
        .unwrap();
        oscore2coap(&mut crypto, &protected_resp[..resp_len], &mut client, &mut out).unwrap();
        assert!(!client.rrc.reboot);
    }
}
