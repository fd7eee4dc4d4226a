//! The outbound transform: CoAP in, OSCORE out (RFC 8613, Section 8.1/8.3).

use shoals_coap::{
    serialize_options, MessageClass, MessageType, Packet, RequestType, ResponseType,
    COAP_PAYLOAD_MARKER,
};
use shoals_shared::{ByteBuffer, Crypto};

use crate::context::{SecurityContext, MAX_NONCE_LEN};
use crate::option::{
    encode_oscore_option, inner_outer_option_split, ssn_to_piv, ECHO_OPTION, OBSERVE_OPTION,
    OSCORE_OPTION,
};
use crate::{
    create_aad, create_nonce, OscoreError, ECHO_VALUE_LEN, MAX_AAD_LEN, MAX_CIPHERTEXT_LEN,
    MAX_PLAINTEXT_LEN, OSCORE_OPT_VALUE_LEN,
};

/// Protects one CoAP message into an OSCORE message, writing the result into
/// `buf_oscore` and returning its length.
///
/// Messaging-layer empty ACKs (code 0.00, type ACK) pass through unmodified,
/// as RFC 8613 Section 4.2 requires.
///
/// The sender sequence number is consumed before encryption; a context
/// snapshot persisted after this call (and before the message reaches the
/// transport) is therefore always ahead of every partial IV on the wire.
pub fn coap2oscore<C: Crypto>(
    crypto: &mut C,
    buf_coap: &[u8],
    ctx: &mut SecurityContext,
    buf_oscore: &mut [u8],
) -> Result<usize, OscoreError> {
    let packet = Packet::from_bytes(buf_coap)?;
    oscore_debug!("coap2oscore: protecting {} bytes", buf_coap.len());

    if packet.header.code == MessageClass::Empty
        && packet.header.get_type() == MessageType::Acknowledgement
    {
        oscore_info!("messaging layer CoAP packet detected, encryption dismissed");
        if buf_oscore.len() < buf_coap.len() {
            return Err(OscoreError::BufferTooSmall);
        }
        buf_oscore[..buf_coap.len()].copy_from_slice(buf_coap);
        return Ok(buf_coap.len());
    }

    // 1. divide the options into E-options and U-options
    let mut split = inner_outer_option_split(&packet)?;

    let is_request = packet.is_request();
    let observe = split.u.contains(OBSERVE_OPTION);

    // first request after a reboot carries a fresh ECHO challenge, which the
    // paired response must echo back before the context trusts it
    let mut echo_value = [0u8; ECHO_VALUE_LEN];
    if ctx.rrc.reboot && is_request {
        crypto.fill_random(&mut echo_value);
        ctx.rrc.echo_opt_val.fill_with_slice(&echo_value)?;
        split.e.insert(ECHO_OPTION, &echo_value)?;
    }

    // 2. plaintext = inner code || E-options || 0xFF || payload
    let mut plaintext = [0u8; MAX_PLAINTEXT_LEN];
    plaintext[0] = packet.code_u8();
    let mut plaintext_len = 1 + serialize_options(&split.e, &mut plaintext[1..])?;
    if !packet.payload.is_empty() {
        let end = plaintext_len + 1 + packet.payload.len();
        if end > MAX_PLAINTEXT_LEN {
            return Err(OscoreError::BufferTooSmall);
        }
        plaintext[plaintext_len] = COAP_PAYLOAD_MARKER;
        plaintext[plaintext_len + 1..end].copy_from_slice(packet.payload);
        plaintext_len = end;
    }

    // 3. partial IV, nonce and OSCORE option value; a plain response reuses
    //    the nonce cached when its request was unprotected
    let nonce_len = ctx.cc.aead_alg.nonce_len();
    let mut nonce_buf = [0u8; MAX_NONCE_LEN];
    let mut oscore_opt_value = ByteBuffer::<OSCORE_OPT_VALUE_LEN>::new();
    let reboot_response = ctx.rrc.reboot && !is_request;

    let nonce = if is_request || observe || reboot_response {
        let piv = ssn_to_piv(ctx.next_ssn()?);
        create_nonce(
            ctx.sc.sender_id.as_slice(),
            piv.as_slice(),
            ctx.cc.common_iv.as_slice(),
            &mut nonce_buf[..nonce_len],
        )?;

        if is_request {
            ctx.rrc.request_kid = ctx.sc.sender_id;
            ctx.rrc.request_piv = piv;
            ctx.rrc.nonce.fill_with_slice(&nonce_buf[..nonce_len])?;
            // the kid flag is always set in requests, kid may be empty
            encode_oscore_option(
                piv.as_slice(),
                Some(ctx.sc.sender_id.as_slice()),
                ctx.cc.id_context.as_ref().map(|c| c.as_slice()),
                &mut oscore_opt_value,
            )?;
        } else {
            encode_oscore_option(piv.as_slice(), None, None, &mut oscore_opt_value)?;
            if reboot_response {
                ctx.rrc.reboot = false;
            }
        }
        &nonce_buf[..nonce_len]
    } else {
        // a plain response is only possible once a request populated the
        // correlation state
        if ctx.rrc.nonce.len != nonce_len {
            return Err(OscoreError::ContextNotFound);
        }
        ctx.rrc.nonce.as_slice()
    };

    // 4. AAD is always bound to the request's kid and partial IV
    let mut aad = [0u8; MAX_AAD_LEN];
    let aad_len = create_aad(
        ctx.cc.aead_alg,
        ctx.rrc.request_kid.as_slice(),
        ctx.rrc.request_piv.as_slice(),
        &mut aad,
    )?;

    // 5. encrypt
    let mut ciphertext = [0u8; MAX_CIPHERTEXT_LEN];
    let ciphertext_len = crypto.aead_encrypt(
        ctx.cc.aead_alg,
        ctx.sc.sender_key.as_slice(),
        nonce,
        &aad[..aad_len],
        &plaintext[..plaintext_len],
        &mut ciphertext,
    )?;

    // 6. outer packet: copied header with forced code, U-options plus the
    //    OSCORE option at its number-ordered position, ciphertext payload
    let mut outer = Packet::new();
    outer.header = packet.header;
    outer.header.code = if is_request {
        if observe {
            MessageClass::Request(RequestType::Fetch)
        } else {
            MessageClass::Request(RequestType::Post)
        }
    } else if observe {
        MessageClass::Response(ResponseType::Content)
    } else {
        MessageClass::Response(ResponseType::Changed)
    };
    outer.token = packet.token;
    outer.options = split.u;
    outer.options.insert(OSCORE_OPTION, oscore_opt_value.as_slice())?;
    outer.payload = &ciphertext[..ciphertext_len];

    let out_len = outer.to_bytes(buf_oscore)?;
    if out_len > ctx.max_unfragmented_size {
        return Err(OscoreError::BufferTooSmall);
    }
    Ok(out_len)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ContextConfig;
    use hexlit::hex;
    use shoals_coap::Header;
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

    fn sample_request() -> [u8; 22] {
        // GET with Uri-Host "localhost" and Uri-Path "tv1"
        hex!("44015d1f00003974396c6f63616c686f737483747631")
    }

    #[test]
    fn test_empty_ack_bypass() {
        let mut crypto = default_crypto();
        let mut ctx = SecurityContext::new(&mut crypto, config(&[], &[0x01])).unwrap();
        // type ACK, code 0.00
        let ack = hex!("60001234");
        let mut out = [0u8; 16];
        let len = coap2oscore(&mut crypto, &ack, &mut ctx, &mut out).unwrap();
        assert_eq!(&out[..len], &ack);
        // nothing consumed
        assert_eq!(ctx.sc.sender_seq_num, 0);
    }

    #[test]
    fn test_request_outer_shape() {
        let mut crypto = default_crypto();
        let mut ctx = SecurityContext::new(&mut crypto, config(&[], &[0x01])).unwrap();
        let mut out = [0u8; 128];
        let len = coap2oscore(&mut crypto, &sample_request(), &mut ctx, &mut out).unwrap();

        let outer = Packet::from_bytes(&out[..len]).unwrap();
        // code forced to POST
        assert_eq!(outer.header.code, MessageClass::Request(RequestType::Post));
        // Uri-Host stays outer, Uri-Path moved inside
        assert!(outer.options.contains(3));
        assert!(!outer.options.contains(11));
        // OSCORE option value for ssn 0, empty kid: flag 0x09, piv 0x00
        assert_eq!(outer.options.find(OSCORE_OPTION).unwrap().value, &hex!("0900"));
        // payload = plaintext (code + Uri-Path option) + 8-byte tag
        assert_eq!(outer.payload.len(), 1 + 4 + 8);
        assert_eq!(ctx.sc.sender_seq_num, 1);
    }

    #[test]
    fn test_observe_request_becomes_fetch() {
        let mut crypto = default_crypto();
        let mut ctx = SecurityContext::new(&mut crypto, config(&[], &[0x01])).unwrap();

        let mut packet = Packet::new();
        packet.header = Header::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.options.push(6, &[]).unwrap(); // Observe=0 registration
        packet.options.push(11, b"tv1").unwrap();
        let mut buf = [0u8; 64];
        let len = packet.to_bytes(&mut buf).unwrap();

        let mut out = [0u8; 128];
        let out_len = coap2oscore(&mut crypto, &buf[..len], &mut ctx, &mut out).unwrap();
        let outer = Packet::from_bytes(&out[..out_len]).unwrap();
        assert_eq!(outer.header.code, MessageClass::Request(RequestType::Fetch));
        // outer observe preserved
        assert!(outer.options.contains(6));
    }

    #[test]
    fn test_ssn_exhaustion_reported() {
        let mut crypto = default_crypto();
        let mut ctx = SecurityContext::new(&mut crypto, config(&[], &[0x01])).unwrap();
        ctx.sc.sender_seq_num = crate::MAX_SSN;
        let mut out = [0u8; 128];
        // the last sequence number is still usable once
        coap2oscore(&mut crypto, &sample_request(), &mut ctx, &mut out).unwrap();
        assert_eq!(
            coap2oscore(&mut crypto, &sample_request(), &mut ctx, &mut out).unwrap_err(),
            OscoreError::SsnExhausted
        );
    }

    #[test]
    fn test_oversize_plaintext_rejected() {
        let mut crypto = default_crypto();
        let mut config = config(&[], &[0x01]);
        config.max_unfragmented_size = crate::MAX_COAP_MSG_LEN;
        let mut ctx = SecurityContext::new(&mut crypto, config).unwrap();

        // a payload that pushes the plaintext one byte over the cap
        let payload = [0x61u8; crate::MAX_PLAINTEXT_LEN - 1];
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.payload = &payload;
        let mut buf = [0u8; crate::MAX_COAP_MSG_LEN];
        let len = packet.to_bytes(&mut buf).unwrap();

        let mut out = [0u8; crate::MAX_COAP_MSG_LEN];
        assert_eq!(
            coap2oscore(&mut crypto, &buf[..len], &mut ctx, &mut out).unwrap_err(),
            OscoreError::BufferTooSmall
        );

        // one byte less fits
        let payload = [0x61u8; crate::MAX_PLAINTEXT_LEN - 2];
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.payload = &payload;
        let len = packet.to_bytes(&mut buf).unwrap();
        coap2oscore(&mut crypto, &buf[..len], &mut ctx, &mut out).unwrap();
    }

    #[test]
    fn test_reboot_request_carries_echo() {
        let mut crypto = default_crypto();
        let mut ctx = SecurityContext::new(&mut crypto, config(&[], &[0x01])).unwrap();
        ctx.rrc.reboot = true;
        let mut out = [0u8; 128];
        coap2oscore(&mut crypto, &sample_request(), &mut ctx, &mut out).unwrap();
        // challenge cached for response matching, reboot still pending
        assert_eq!(ctx.rrc.echo_opt_val.len, ECHO_VALUE_LEN);
        assert!(ctx.rrc.reboot);
    }
}
