//! The OSCORE security context (RFC 8613, Section 3) and its derivation.

use shoals_shared::{AeadAlg, ByteBuffer, CBOREncoder, Crypto, HkdfAlg};

use crate::{OscoreError, ECHO_VALUE_LEN, MAX_PIV_LEN, MAX_SSN};

pub const MAX_KID_LEN: usize = 7;
pub const MAX_KID_CONTEXT_LEN: usize = 8;
pub const MAX_MASTER_SECRET_LEN: usize = 32;
pub const MAX_MASTER_SALT_LEN: usize = 32;
pub const MAX_NONCE_LEN: usize = 13;
pub const MAX_KEY_LEN: usize = 32;

// info = [id, id_context, alg_aead, type, L]
const MAX_DERIVE_INFO_LEN: usize = 1 + 2 + MAX_KID_LEN + 2 + MAX_KID_CONTEXT_LEN + 2 + 4 + 2;

/// Everything needed to instantiate a security context, either from
/// pre-provisioned material or from the EDHOC exporter outputs.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub aead_alg: AeadAlg,
    pub hkdf_alg: HkdfAlg,
    /// Replay window size in bits: 0 (replay protection disabled), 32, 64
    /// or 128.
    pub replay_window_bits: u8,
    pub master_secret: ByteBuffer<MAX_MASTER_SECRET_LEN>,
    pub master_salt: ByteBuffer<MAX_MASTER_SALT_LEN>,
    pub id_context: Option<ByteBuffer<MAX_KID_CONTEXT_LEN>>,
    pub sender_id: ByteBuffer<MAX_KID_LEN>,
    pub recipient_id: ByteBuffer<MAX_KID_LEN>,
    /// Upper bound for produced OSCORE messages.
    pub max_unfragmented_size: usize,
}

/// Common context: what both endpoints share.
#[derive(Debug)]
pub struct CommonContext {
    pub aead_alg: AeadAlg,
    pub hkdf_alg: HkdfAlg,
    pub id_context: Option<ByteBuffer<MAX_KID_CONTEXT_LEN>>,
    pub common_iv: ByteBuffer<MAX_NONCE_LEN>,
}

/// Sender context: the outbound half.
#[derive(Debug)]
pub struct SenderContext {
    pub sender_id: ByteBuffer<MAX_KID_LEN>,
    pub sender_key: ByteBuffer<MAX_KEY_LEN>,
    pub sender_seq_num: u64,
}

/// Recipient context: the inbound half.
#[derive(Debug)]
pub struct RecipientContext {
    pub recipient_id: ByteBuffer<MAX_KID_LEN>,
    pub recipient_key: ByteBuffer<MAX_KEY_LEN>,
    pub replay_window: ReplayWindow,
}

/// Request/response correlation state: the request's kid and partial IV for
/// AAD construction, the nonce shared between a request and its PIV-less
/// response, and the reboot/ECHO freshness state.
#[derive(Debug)]
pub struct ReqRespContext {
    pub request_kid: ByteBuffer<MAX_KID_LEN>,
    pub request_piv: ByteBuffer<MAX_PIV_LEN>,
    pub nonce: ByteBuffer<MAX_NONCE_LEN>,
    pub echo_opt_val: ByteBuffer<ECHO_VALUE_LEN>,
    pub reboot: bool,
}

/// The full security context triplet plus request/response state.
///
/// A context is a serially-used resource: every operation takes `&mut self`,
/// and the borrow checker enforces the one-operation-at-a-time discipline the
/// protocol requires.
#[derive(Debug)]
pub struct SecurityContext {
    pub cc: CommonContext,
    pub sc: SenderContext,
    pub rc: RecipientContext,
    pub rrc: ReqRespContext,
    pub max_unfragmented_size: usize,
}

impl SecurityContext {
    /// Derives a fresh context. Checks the configuration invariants: distinct
    /// sender/recipient IDs, ID lengths that fit the nonce construction, and
    /// a supported replay window size.
    pub fn new<C: Crypto>(crypto: &mut C, config: ContextConfig) -> Result<Self, OscoreError> {
        let nonce_len = config.aead_alg.nonce_len();
        let max_id_len = nonce_len - 6;
        if config.sender_id.len > max_id_len || config.recipient_id.len > max_id_len {
            return Err(OscoreError::InvalidContext);
        }
        if config.sender_id.as_slice() == config.recipient_id.as_slice() {
            return Err(OscoreError::InvalidContext);
        }
        if !matches!(config.replay_window_bits, 0 | 32 | 64 | 128) {
            return Err(OscoreError::InvalidContext);
        }

        let prk = crypto.hkdf_extract(
            config.hkdf_alg,
            config.master_salt.as_slice(),
            config.master_secret.as_slice(),
        );
        let prk = &prk[..config.hkdf_alg.hash_len()];

        let key_len = config.aead_alg.key_len();
        let mut sender_key = ByteBuffer::<MAX_KEY_LEN>::new();
        sender_key.len = key_len;
        derive(
            crypto,
            &config,
            prk,
            config.sender_id.as_slice(),
            "Key",
            &mut sender_key.content[..key_len],
        )?;

        let mut recipient_key = ByteBuffer::<MAX_KEY_LEN>::new();
        recipient_key.len = key_len;
        derive(
            crypto,
            &config,
            prk,
            config.recipient_id.as_slice(),
            "Key",
            &mut recipient_key.content[..key_len],
        )?;

        let mut common_iv = ByteBuffer::<MAX_NONCE_LEN>::new();
        common_iv.len = nonce_len;
        derive(
            crypto,
            &config,
            prk,
            &[],
            "IV",
            &mut common_iv.content[..nonce_len],
        )?;

        oscore_debug!("derived security context");

        Ok(SecurityContext {
            cc: CommonContext {
                aead_alg: config.aead_alg,
                hkdf_alg: config.hkdf_alg,
                id_context: config.id_context,
                common_iv,
            },
            sc: SenderContext {
                sender_id: config.sender_id,
                sender_key,
                sender_seq_num: 0,
            },
            rc: RecipientContext {
                recipient_id: config.recipient_id,
                recipient_key,
                replay_window: ReplayWindow::new(config.replay_window_bits),
            },
            rrc: ReqRespContext {
                request_kid: ByteBuffer::new(),
                request_piv: ByteBuffer::new(),
                nonce: ByteBuffer::new(),
                echo_opt_val: ByteBuffer::new(),
                reboot: false,
            },
            max_unfragmented_size: config.max_unfragmented_size,
        })
    }

    /// Consumes the next sender sequence number. The returned value is the
    /// partial IV of the message about to be sent; afterwards the counter
    /// points at the next unused value.
    pub fn next_ssn(&mut self) -> Result<u64, OscoreError> {
        if self.sc.sender_seq_num > MAX_SSN {
            return Err(OscoreError::SsnExhausted);
        }
        let ssn = self.sc.sender_seq_num;
        self.sc.sender_seq_num += 1;
        Ok(ssn)
    }

    /// Snapshot of the state that must survive a restart. The sender
    /// sequence number is recorded *after* the last consumed value, so
    /// persisting a snapshot before handing the message to the transport
    /// keeps the on-disk counter ahead of any partial IV on the wire.
    pub fn freeze(&self) -> ContextSnapshot {
        ContextSnapshot {
            sender_seq_num: self.sc.sender_seq_num,
            replay_high_watermark: self.rc.replay_window.highest,
        }
    }

    /// Rebuilds a context after a restart from its configuration and the last
    /// persisted snapshot. The context resumes sending from the persisted
    /// counter and raises the ECHO freshness round: the next outbound request
    /// carries a challenge, and the next inbound response must echo it.
    pub fn thaw<C: Crypto>(
        crypto: &mut C,
        config: ContextConfig,
        snapshot: &ContextSnapshot,
    ) -> Result<Self, OscoreError> {
        let mut ctx = Self::new(crypto, config)?;
        ctx.sc.sender_seq_num = snapshot.sender_seq_num;
        ctx.rc.replay_window.restore(snapshot.replay_high_watermark);
        ctx.rrc.reboot = true;
        Ok(ctx)
    }
}

/// HKDF-Expand with `info = [id, id_context, alg_aead, type, L]`
/// (RFC 8613, Section 3.2.1).
fn derive<C: Crypto>(
    crypto: &mut C,
    config: &ContextConfig,
    prk: &[u8],
    id: &[u8],
    type_str: &str,
    okm: &mut [u8],
) -> Result<(), OscoreError> {
    let mut info = [0u8; MAX_DERIVE_INFO_LEN];
    let mut encoder = CBOREncoder::new(&mut info);
    encoder.array(5)?;
    encoder.bytes(id)?;
    match &config.id_context {
        Some(ctx) => encoder.bytes(ctx.as_slice())?,
        None => encoder.null()?,
    }
    encoder.int(config.aead_alg.cose_id())?;
    encoder.text(type_str)?;
    encoder.uint(okm.len())?;
    let info_len = encoder.position();

    crypto.hkdf_expand(config.hkdf_alg, prk, &info[..info_len], okm);
    Ok(())
}

/// Sliding anti-replay window over received partial IVs.
///
/// A partial IV is accepted iff it is above the highest value seen so far, or
/// inside the window with its bit still clear. Acceptance is recorded
/// separately ([ReplayWindow::update]) so a failed decryption never advances
/// the window.
#[derive(Debug)]
pub struct ReplayWindow {
    bits: u8,
    highest: u64,
    bitmap: u128,
    seen_any: bool,
}

impl ReplayWindow {
    pub fn new(bits: u8) -> Self {
        ReplayWindow {
            bits,
            highest: 0,
            bitmap: 0,
            seen_any: false,
        }
    }

    /// Checks whether `piv` would be fresh. Does not modify the window.
    pub fn check(&self, piv: u64) -> Result<(), OscoreError> {
        if self.bits == 0 {
            // replay protection disabled
            return Ok(());
        }
        if !self.seen_any || piv > self.highest {
            return Ok(());
        }
        let offset = self.highest - piv;
        if offset >= self.bits as u64 {
            return Err(OscoreError::Replayed);
        }
        if self.bitmap & (1u128 << offset) != 0 {
            return Err(OscoreError::Replayed);
        }
        Ok(())
    }

    /// Records `piv` as seen, sliding the window forward if needed. Call only
    /// after the corresponding message passed AEAD verification.
    pub fn update(&mut self, piv: u64) {
        if self.bits == 0 {
            return;
        }
        if !self.seen_any {
            self.seen_any = true;
            self.highest = piv;
            self.bitmap = 1;
        } else if piv > self.highest {
            let shift = piv - self.highest;
            self.bitmap = if shift >= 128 {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = piv;
        } else {
            self.bitmap |= 1u128 << (self.highest - piv);
        }
    }

    /// Restores the high watermark from persisted state; everything at or
    /// below it is treated as already seen.
    pub fn restore(&mut self, high_watermark: u64) {
        if self.bits == 0 {
            return;
        }
        self.seen_any = true;
        self.highest = high_watermark;
        self.bitmap = u128::MAX;
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }
}

/// Persistable write-ahead state of one context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextSnapshot {
    pub sender_seq_num: u64,
    pub replay_high_watermark: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;
    use shoals_crypto::default_crypto;

    pub const MASTER_SECRET_TV: &[u8] = &hex!("0102030405060708090a0b0c0d0e0f10");
    pub const MASTER_SALT_TV: &[u8] = &hex!("9e7ca92223786340");

    fn client_config() -> ContextConfig {
        ContextConfig {
            aead_alg: AeadAlg::AesCcm16_64_128,
            hkdf_alg: HkdfAlg::Sha256,
            replay_window_bits: 32,
            master_secret: MASTER_SECRET_TV.try_into().unwrap(),
            master_salt: MASTER_SALT_TV.try_into().unwrap(),
            id_context: None,
            sender_id: ByteBuffer::new(),
            recipient_id: ByteBuffer::new_from_slice(&[0x01]).unwrap(),
            max_unfragmented_size: 1024,
        }
    }

    /// RFC 8613 Appendix C.1.1 derivations.
    #[test]
    fn test_derive_client_context() {
        let ctx = SecurityContext::new(&mut default_crypto(), client_config()).unwrap();
        assert_eq!(
            ctx.sc.sender_key.as_slice(),
            &hex!("f0910ed7295e6ad4b54fc793154302ff")
        );
        assert_eq!(
            ctx.rc.recipient_key.as_slice(),
            &hex!("ffb14e093c94c9cac9471648b4f98710")
        );
        assert_eq!(
            ctx.cc.common_iv.as_slice(),
            &hex!("4622d4dd6d944168eefb549868")
        );
    }

    #[test]
    fn test_same_ids_rejected() {
        let mut config = client_config();
        config.recipient_id = ByteBuffer::new();
        assert_eq!(
            SecurityContext::new(&mut default_crypto(), config).unwrap_err(),
            OscoreError::InvalidContext
        );
    }

    #[test]
    fn test_kid_too_long_rejected() {
        let mut config = client_config();
        config.sender_id = ByteBuffer::new_from_slice(&[0u8; 8][..7]).unwrap();
        // 7 bytes fits CCM's 13-byte nonce, so tighten via GCM's 12 bytes
        config.aead_alg = AeadAlg::A128Gcm;
        assert_eq!(
            SecurityContext::new(&mut default_crypto(), config).unwrap_err(),
            OscoreError::InvalidContext
        );
    }

    #[test]
    fn test_bad_window_size_rejected() {
        let mut config = client_config();
        config.replay_window_bits = 16;
        assert_eq!(
            SecurityContext::new(&mut default_crypto(), config).unwrap_err(),
            OscoreError::InvalidContext
        );
    }

    #[test]
    fn test_ssn_consumption() {
        let mut ctx = SecurityContext::new(&mut default_crypto(), client_config()).unwrap();
        assert_eq!(ctx.next_ssn().unwrap(), 0);
        assert_eq!(ctx.next_ssn().unwrap(), 1);
        assert_eq!(ctx.sc.sender_seq_num, 2);
    }

    #[test]
    fn test_ssn_exhaustion() {
        let mut ctx = SecurityContext::new(&mut default_crypto(), client_config()).unwrap();
        ctx.sc.sender_seq_num = MAX_SSN;
        // the last representable value is still usable once
        assert_eq!(ctx.next_ssn().unwrap(), MAX_SSN);
        assert_eq!(ctx.next_ssn().unwrap_err(), OscoreError::SsnExhausted);
    }

    #[test]
    fn test_replay_window() {
        let mut w = ReplayWindow::new(32);
        assert!(w.check(5).is_ok());
        w.update(5);
        assert_eq!(w.check(5).unwrap_err(), OscoreError::Replayed);
        assert!(w.check(4).is_ok());
        w.update(4);
        assert_eq!(w.check(4).unwrap_err(), OscoreError::Replayed);
        // jump far ahead, sliding everything out
        assert!(w.check(100).is_ok());
        w.update(100);
        assert_eq!(w.check(5).unwrap_err(), OscoreError::Replayed); // below window
        assert!(w.check(99).is_ok());
        assert!(w.check(69).is_ok());
        assert_eq!(w.check(68).unwrap_err(), OscoreError::Replayed); // offset 32
    }

    #[test]
    fn test_replay_window_disabled() {
        let mut w = ReplayWindow::new(0);
        w.update(7);
        assert!(w.check(7).is_ok());
    }

    #[test]
    fn test_freeze_thaw() {
        let mut ctx = SecurityContext::new(&mut default_crypto(), client_config()).unwrap();
        ctx.next_ssn().unwrap();
        ctx.next_ssn().unwrap();
        ctx.rc.replay_window.update(41);
        let snapshot = ctx.freeze();
        assert_eq!(snapshot.sender_seq_num, 2);
        assert_eq!(snapshot.replay_high_watermark, 41);

        let thawed =
            SecurityContext::thaw(&mut default_crypto(), client_config(), &snapshot).unwrap();
        assert!(thawed.rrc.reboot);
        assert_eq!(thawed.sc.sender_seq_num, 2);
        // everything at or below the watermark reads as replayed
        assert_eq!(
            thawed.rc.replay_window.check(41).unwrap_err(),
            OscoreError::Replayed
        );
        assert!(thawed.rc.replay_window.check(42).is_ok());
    }
}
