//! Maker session engine (C5, spec §4.5): symmetric counterpart to
//! [`crate::taker`]. Accepts `!fill`, verifies PoDLE, exposes UTXOs and
//! destinations, and signs each input only after [`crate::verifier`]
//! accepts the proposed transaction.
//!
//! Also carries the rate limiter (spec §4.5 "Rate limiting"): a
//! per-connection token bucket plus a multi-tier orderbook-specific
//! backoff escalator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bdk::bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bdk::bitcoin::{OutPoint, Script, Transaction};
use log::{info, warn};

use crate::channel::{self, SessionKeypair};
use crate::collaborators::{UtxoOracle, WalletHandle};
use crate::config::CoreConfig;
use crate::curve;
use crate::envelope::{AppMessage, EnvelopeType};
use crate::error::{MakerError, OracleError};
use crate::persist::MakerBlacklist;
use crate::registry::Phase;
use crate::transport::{self, Writer};
use crate::verifier::{self, MakerContract};

/// Per-session state for one taker counterparty (spec §4.5 state chart).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakerSessionPhase {
    Idle,
    Filled,
    Authed,
    Signed,
    Done,
    Aborted,
    TimedOut,
}

pub struct MakerSession {
    pub taker_nick: String,
    pub phase: MakerSessionPhase,
    pub my_keys: SessionKeypair,
    pub peer_pub: Option<crypto_box::PublicKey>,
    pub commitment_hash: Option<String>,
    pub created_at: Instant,
}

impl MakerSession {
    pub fn new(taker_nick: impl Into<String>) -> Self {
        MakerSession {
            taker_nick: taker_nick.into(),
            phase: MakerSessionPhase::Idle,
            my_keys: SessionKeypair::generate(),
            peer_pub: None,
            commitment_hash: None,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) > timeout
    }
}

/// Handle a `!fill` request: reject blacklisted commitments, otherwise
/// record it as pending and reply with `!pubkey`.
pub async fn handle_fill(
    writer: &mut Writer,
    my_nick: &str,
    msg: &AppMessage,
    blacklist: &MakerBlacklist,
) -> Result<MakerSession, MakerError> {
    if msg.args.len() != 4 {
        return Err(crate::error::ProtocolError::WrongArgCount {
            command: "fill".into(),
            expected: 4,
            got: msg.args.len(),
        }
        .into());
    }
    let commitment_hash = msg.args[3].clone();
    if blacklist.contains(&commitment_hash) {
        return Err(MakerError::CommitmentBlacklisted);
    }
    let taker_pub = channel::parse_peer_public_key(&msg.args[2])?;

    let mut session = MakerSession::new(msg.from_nick.clone());
    session.peer_pub = Some(taker_pub);
    session.commitment_hash = Some(commitment_hash);
    session.phase = MakerSessionPhase::Filled;

    let reply = AppMessage {
        from_nick: my_nick.to_string(),
        to_nick: msg.from_nick.clone(),
        command: "pubkey".to_string(),
        args: vec![session.my_keys.public_key_b64()],
    };
    transport::send_envelope(writer, EnvelopeType::Privmsg, reply.render())
        .await
        .map_err(MakerError::from)?;
    Ok(session)
}

/// Parsed `!auth` payload: PoDLE reveal plus the taker's declared inputs
/// and CJ destination script.
pub struct AuthPayload {
    pub podle: crate::curve::PodleProof,
    pub taker_utxos: Vec<OutPoint>,
    pub taker_cj_script: Script,
}

/// Outcome of validating the taker-declared UTXO backing an `!auth`
/// (spec §4.5 "On `!auth`"): age and value-percentage floors.
pub fn validate_taker_utxo(
    declared_value: u64,
    cj_amount: u64,
    confirmations: u32,
    taker_utxo_age: u32,
    taker_utxo_amtpercent: u8,
) -> Result<(), OracleError> {
    if confirmations < taker_utxo_age {
        return Err(OracleError::InsufficientConfirmations {
            outpoint: String::new(),
            have: confirmations,
            need: taker_utxo_age,
        });
    }
    let min_value = (cj_amount as u128 * taker_utxo_amtpercent as u128 / 100) as u64;
    if declared_value < min_value {
        return Err(OracleError::ValueMismatch {
            outpoint: String::new(),
            declared: declared_value,
            actual: min_value,
        });
    }
    Ok(())
}

/// On `!auth`: verify the PoDLE reveal against the commitment recorded at
/// FILL time, broadcast `!hp2`, blacklist the commitment, validate the
/// taker's UTXO, and reply with `!ioauth`.
#[allow(clippy::too_many_arguments)]
pub async fn handle_auth(
    secp: &Secp256k1<All>,
    writer: &mut Writer,
    my_nick: &str,
    session: &mut MakerSession,
    msg: &AppMessage,
    blacklist: &mut MakerBlacklist,
    oracle: &dyn UtxoOracle,
    config: &CoreConfig,
    cj_amount: u64,
    my_utxos: &[(OutPoint, u64)],
    my_cj_script: &Script,
    my_change_script: &Script,
) -> Result<(), MakerError> {
    let peer_pub = session
        .peer_pub
        .clone()
        .ok_or_else(|| crate::error::SessionFailure::new(Phase::Auth, Some(session.taker_nick.clone()), "peer key unknown"))?;
    let plaintext = channel::decrypt(&session.my_keys, &peer_pub, &msg.args[0])?;
    let payload = parse_auth(&plaintext)?;

    let expected_commitment = session
        .commitment_hash
        .as_ref()
        .ok_or_else(|| crate::error::SessionFailure::new(Phase::Auth, Some(session.taker_nick.clone()), "no commitment recorded"))?;
    let commitment = curve::commitment(&payload.podle.p2);
    curve::verify(secp, &payload.podle, &commitment)?;
    if commitment.to_string() != *expected_commitment {
        return Err(crate::error::CryptoError::CommitmentMismatch.into());
    }

    blacklist
        .append(expected_commitment)
        .map_err(|e| MakerError::RateLimited(e.to_string()))?;
    let hp2 = AppMessage {
        from_nick: my_nick.to_string(),
        to_nick: "all".to_string(),
        command: "hp2".to_string(),
        args: vec![expected_commitment.clone()],
    };
    transport::send_envelope(writer, EnvelopeType::Pubmsg, hp2.render())
        .await
        .map_err(MakerError::from)?;

    for outpoint in &payload.taker_utxos {
        let info = oracle
            .get_utxo(*outpoint)?
            .ok_or_else(|| OracleError::UnknownUtxo(outpoint.to_string()))?;
        validate_taker_utxo(
            info.value,
            cj_amount,
            info.confirmations,
            config.taker_utxo_age,
            config.taker_utxo_amtpercent,
        )?;
    }

    let utxo_field = my_utxos
        .iter()
        .map(|(op, v)| format!("{}:{}:{}", op.txid, op.vout, v))
        .collect::<Vec<_>>()
        .join(",");
    let ioauth_plaintext = format!(
        "{utxo_field} {} {}",
        hex::encode(my_cj_script.as_bytes()),
        hex::encode(my_change_script.as_bytes()),
    );
    let blob = channel::encrypt(&session.my_keys, &peer_pub, &ioauth_plaintext)?;
    let reply = AppMessage {
        from_nick: my_nick.to_string(),
        to_nick: session.taker_nick.clone(),
        command: "ioauth".to_string(),
        args: vec![blob],
    };
    transport::send_envelope(writer, EnvelopeType::Privmsg, reply.render())
        .await
        .map_err(MakerError::from)?;

    session.phase = MakerSessionPhase::Authed;
    Ok(())
}

fn parse_auth(plaintext: &str) -> Result<AuthPayload, MakerError> {
    let mut fields = plaintext.split(' ');
    let p = fields.next();
    let p2 = fields.next();
    let s = fields.next();
    let e = fields.next();
    let index = fields.next();
    let utxo_field = fields.next().unwrap_or("");
    let cj_hex = fields.next().unwrap_or("");

    let (p, p2, s, e, index) = match (p, p2, s, e, index) {
        (Some(p), Some(p2), Some(s), Some(e), Some(index)) => (p, p2, s, e, index),
        _ => {
            return Err(crate::error::SessionFailure::new(Phase::Auth, None, "malformed auth reveal").into());
        }
    };
    let podle = crate::curve::PodleProof {
        p: parse_pubkey(p)?,
        p2: parse_pubkey(p2)?,
        s: parse_secret(s)?,
        e: parse_secret(e)?,
        index: parse_retry_index(index)?,
    };
    let taker_utxos = utxo_field
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_outpoint)
        .collect::<Result<Vec<_>, _>>()?;
    let taker_cj_script = Script::from(
        hex::decode(cj_hex).map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "malformed cj script hex"))?,
    );
    Ok(AuthPayload {
        podle,
        taker_utxos,
        taker_cj_script,
    })
}

fn parse_pubkey(s: &str) -> Result<bdk::bitcoin::secp256k1::PublicKey, MakerError> {
    let bytes = hex::decode(s).map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad pubkey hex"))?;
    bdk::bitcoin::secp256k1::PublicKey::from_slice(&bytes)
        .map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad pubkey bytes").into())
}

fn parse_secret(s: &str) -> Result<SecretKey, MakerError> {
    let bytes = hex::decode(s).map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad scalar hex"))?;
    SecretKey::from_slice(&bytes).map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad scalar bytes").into())
}

fn parse_retry_index(s: &str) -> Result<u8, MakerError> {
    s.parse()
        .map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad retry index").into())
}

fn parse_outpoint(entry: &str) -> Result<OutPoint, MakerError> {
    let mut parts = entry.splitn(2, ':');
    let txid = parts.next().unwrap_or_default();
    let vout: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
    txid.parse()
        .map(|txid| OutPoint { txid, vout })
        .map_err(|_| crate::error::SessionFailure::new(Phase::Auth, None, "bad outpoint txid").into())
}

/// On `!tx`: verify against this maker's contract, refuse any P2WSH
/// input (fidelity-bond UTXOs must never be spent in CoinJoins), sign,
/// and reply with one `!sig` per input.
#[allow(clippy::too_many_arguments)]
pub async fn handle_tx(
    writer: &mut Writer,
    my_nick: &str,
    session: &mut MakerSession,
    tx: &Transaction,
    contract: &MakerContract<'_>,
    input_scripts: &[Script],
    wallet: &dyn WalletHandle,
) -> Result<(), MakerError> {
    verifier::verify(tx, contract)?;

    for script in input_scripts {
        if script.is_v0_p2wsh() {
            return Err(MakerError::RefuseSignP2wsh);
        }
    }

    let witnesses = wallet.sign_transaction(tx)?;
    let sigs = contract
        .my_utxos
        .iter()
        .map(|op| {
            witnesses
                .get(op)
                .map(|w| hex::encode(bdk::bitcoin::consensus::encode::serialize(w)))
                .ok_or_else(|| {
                    crate::error::SessionFailure::new(
                        Phase::Sign,
                        Some(session.taker_nick.clone()),
                        format!("wallet produced no signature for {op}"),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?
        .join(",");
    let peer_pub = session
        .peer_pub
        .clone()
        .ok_or_else(|| crate::error::SessionFailure::new(Phase::Sign, Some(session.taker_nick.clone()), "peer key unknown"))?;
    let blob = channel::encrypt(&session.my_keys, &peer_pub, &sigs)?;
    let reply = AppMessage {
        from_nick: my_nick.to_string(),
        to_nick: session.taker_nick.clone(),
        command: "sig".to_string(),
        args: vec![blob],
    };
    transport::send_envelope(writer, EnvelopeType::Privmsg, reply.render())
        .await
        .map_err(MakerError::from)?;
    session.phase = MakerSessionPhase::Signed;
    info!("signed coinjoin for {}", session.taker_nick);
    Ok(())
}

/// Simple token bucket (spec §4.5 "Rate limiting"): `capacity` tokens,
/// refilled at `rate` tokens/sec, one connection per bucket.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        TokenBucket {
            capacity: burst as f64,
            tokens: burst as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token for an incoming message; `false` means reject.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Escalating per-nick backoff for orderbook-request abuse (spec §4.5):
/// 10s normal, 60s after >10 violations, 300s after >50, 3600s ban after
/// >100. Counters reset once the ban interval elapses.
pub struct OrderbookLimiter {
    violations: HashMap<String, (u32, Instant)>,
}

impl OrderbookLimiter {
    pub fn new() -> Self {
        OrderbookLimiter {
            violations: HashMap::new(),
        }
    }

    /// Record a violation for `nick` and return the backoff duration to
    /// apply before it may request an orderbook again.
    pub fn record_violation(&mut self, nick: &str, now: Instant) -> Duration {
        let entry = self.violations.entry(nick.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) > Duration::from_secs(3600) {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.1 = now;
        backoff_for(entry.0)
    }
}

impl Default for OrderbookLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_for(violation_count: u32) -> Duration {
    match violation_count {
        0..=10 => Duration::from_secs(10),
        11..=50 => Duration::from_secs(60),
        51..=100 => Duration::from_secs(300),
        _ => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_depletes_and_refills() {
        let mut bucket = TokenBucket::new(10, 2);
        let t0 = Instant::now();
        assert!(bucket.try_consume(t0));
        assert!(bucket.try_consume(t0));
        assert!(!bucket.try_consume(t0), "burst of 2 exhausted");

        let t1 = t0 + Duration::from_millis(200);
        assert!(bucket.try_consume(t1), "refilled at 10/s after 200ms");
    }

    #[test]
    fn orderbook_backoff_escalates_with_violation_count() {
        let mut limiter = OrderbookLimiter::new();
        let t0 = Instant::now();
        for _ in 0..10 {
            limiter.record_violation("J5abc", t0);
        }
        assert_eq!(limiter.record_violation("J5abc", t0), Duration::from_secs(60));
        for _ in 0..39 {
            limiter.record_violation("J5abc", t0);
        }
        assert_eq!(limiter.record_violation("J5abc", t0), Duration::from_secs(300));
    }

    #[test]
    fn orderbook_backoff_resets_after_ban_interval() {
        let mut limiter = OrderbookLimiter::new();
        let t0 = Instant::now();
        for _ in 0..60 {
            limiter.record_violation("J5abc", t0);
        }
        let t1 = t0 + Duration::from_secs(3601);
        assert_eq!(limiter.record_violation("J5abc", t1), Duration::from_secs(10));
    }

    #[test]
    fn taker_utxo_below_amtpercent_floor_rejected() {
        let err = validate_taker_utxo(10_000, 500_000, 10, 5, 20);
        assert!(matches!(err, Err(OracleError::ValueMismatch { .. })));
    }

    #[test]
    fn taker_utxo_too_few_confirmations_rejected() {
        let err = validate_taker_utxo(200_000, 500_000, 2, 5, 20);
        assert!(matches!(err, Err(OracleError::InsufficientConfirmations { .. })));
    }

    #[test]
    fn taker_utxo_meeting_floors_accepted() {
        assert!(validate_taker_utxo(200_000, 500_000, 5, 5, 20).is_ok());
    }

    #[test]
    fn session_expires_after_timeout() {
        let session = MakerSession::new("J5abc");
        assert!(!session.is_expired(Duration::from_secs(300), Instant::now()));
        assert!(session.is_expired(Duration::from_secs(0), Instant::now() + Duration::from_millis(1)));
    }
}
