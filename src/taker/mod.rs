//! Taker session engine (C4, spec §4.4): drives the five-phase CoinJoin
//! run -- DISCOVER, FILL, AUTH, TX_BUILD, SIGN, BROADCAST -- against a set
//! of makers selected from the registry.
//!
//! Network I/O is kept to thin wrappers around [`crate::transport`]; the
//! decisions that matter (who to replace, when change is dust, who
//! broadcasts) live in plain functions below so they can be exercised
//! without a socket.

pub mod tx_build;

use std::time::{Duration, Instant};

use bdk::bitcoin::{OutPoint, Script, Transaction};
use log::{info, warn};
use rand::seq::SliceRandom;

use crate::channel::{self, SessionKeypair};
use crate::collaborators::{UtxoInfo, UtxoOracle, WalletHandle};
use crate::config::{BroadcastPolicy, CoreConfig};
use crate::curve::{self, PodleProof};
use crate::envelope::{is_encrypted_command, AppMessage, Transport};
use crate::error::{OracleError, TakerError};
use crate::persist::{CommitmentRecord, History, HistoryEntry, TakerCommitmentStore};
use crate::registry::{self, Offer, OfferKind, Phase, Registry, SelectionRequest};
use crate::transport::{self, Reader, Writer};

use bdk::bitcoin::secp256k1::{Secp256k1, SecretKey, All};
use tx_build::{MakerContribution, TakerContribution};

/// A maker that has responded to `!fill` and is participating in this run.
pub struct MakerSlot {
    pub nick: String,
    pub reader: Reader,
    pub writer: Writer,
    pub my_keys: SessionKeypair,
    pub peer_pub: Option<crypto_box::PublicKey>,
    pub podle: PodleProof,
    pub retry_index: u8,
    pub inputs: Vec<(OutPoint, u64)>,
    pub cj_script: Option<Script>,
    pub change_script: Option<Script>,
    pub change_value: u64,
}

/// Everything the run needs to talk about itself to the operator and to
/// `coinjoin_history.csv` (spec §6 persisted state).
pub struct RunContext<'a> {
    pub run_id: String,
    pub config: &'a CoreConfig,
    pub oracle: &'a dyn UtxoOracle,
    pub wallet: &'a dyn WalletHandle,
    pub registry: &'a Registry,
    pub commitments: &'a mut TakerCommitmentStore,
    pub history: &'a History,
    pub transport: Transport,
}

/// Step 1 of C3 selection invoked by the taker's DISCOVER phase: filter,
/// dedup, then select `count` makers by the configured algorithm.
pub fn discover(
    ctx: &RunContext,
    amount: u64,
    kind: OfferKind,
    max_fee_sats: u64,
    ignored_nicks: &[String],
    count: usize,
    max_offer_age: Duration,
    rng: &mut impl rand::Rng,
) -> Vec<Offer> {
    let now = Instant::now();
    let live = ctx.registry.live_offers(max_offer_age, now);
    let req = SelectionRequest {
        amount,
        kind,
        max_fee_sats,
        ignored_nicks,
        count,
    };
    let pool = registry::filter_and_dedup(&live, &req);
    let picked = registry::select_makers(
        &pool,
        ctx.config.selection_algorithm,
        amount,
        count,
        ctx.config.weighted_alpha,
        ctx.config.fidelity_bond_weighted_fraction,
        rng,
    );
    picked.into_iter().cloned().collect()
}

/// Whether the FILL phase should draw additional makers from the pool
/// rather than proceeding with fewer counterparties than requested.
///
/// Spec §4.4 step 2: non-responding makers are ignored and up to
/// `max_maker_replacement_attempts` additional draws are made.
pub fn should_replace(responded: usize, needed: usize, attempts_used: u8, max_attempts: u8) -> bool {
    responded < needed && attempts_used < max_attempts
}

/// FILL step for one maker: allocate session key material and a PoDLE
/// commitment, send `!fill`, and wait for `!pubkey`.
pub async fn fill_maker(
    secp: &Secp256k1<All>,
    reader: &mut Reader,
    writer: &mut Writer,
    taker_nick: &str,
    offer: &Offer,
    amount: u64,
    signing_key: &SecretKey,
    retry_index: u8,
    commitments: &mut TakerCommitmentStore,
    utxo_for_commitment: &OutPoint,
) -> Result<(SessionKeypair, crypto_box::PublicKey, PodleProof), TakerError> {
    let my_keys = SessionKeypair::generate();
    let podle = curve::prove(secp, signing_key, retry_index);
    let commitment = curve::commitment(&podle.p2);

    if commitments.has_used(&commitment.to_string()) {
        return Err(TakerError::Session(crate::error::SessionFailure::new(
            Phase::Fill,
            Some(offer.maker_nick.clone()),
            "commitment already used against this maker",
        )));
    }

    let line = AppMessage {
        from_nick: taker_nick.to_string(),
        to_nick: offer.maker_nick.clone(),
        command: "fill".to_string(),
        args: vec![
            offer.order_id.to_string(),
            amount.to_string(),
            my_keys.public_key_b64(),
            commitment.to_string(),
        ],
    };
    transport::send_envelope(writer, crate::envelope::EnvelopeType::Privmsg, line.render())
        .await
        .map_err(TakerError::from)?;

    let env = transport::recv_envelope(reader).await.map_err(TakerError::from)?;
    let reply = AppMessage::parse(&env.line).map_err(TakerError::from)?;
    if reply.command != "pubkey" || reply.args.is_empty() {
        return Err(TakerError::Session(crate::error::SessionFailure::new(
            Phase::Fill,
            Some(offer.maker_nick.clone()),
            format!("expected pubkey, got {}", reply.command),
        )));
    }
    let peer_pub = channel::parse_peer_public_key(&reply.args[0])?;

    commitments.record(CommitmentRecord {
        commitment_hash: commitment.to_string(),
        nums_index: retry_index,
        utxo_outpoint: format!("{}:{}", utxo_for_commitment.txid, utxo_for_commitment.vout),
        first_used_at: 0,
    })
    .map_err(|e| TakerError::WalletUnavailable(e.to_string()))?;

    Ok((my_keys, peer_pub, podle))
}

/// AUTH step: send the encrypted PoDLE reveal and UTXO set, validate the
/// maker's `!ioauth` reply against the oracle.
pub async fn auth_maker(
    reader: &mut Reader,
    writer: &mut Writer,
    taker_nick: &str,
    maker_nick: &str,
    my_keys: &SessionKeypair,
    peer_pub: &crypto_box::PublicKey,
    podle: &PodleProof,
    taker_utxos: &[(OutPoint, u64)],
    cj_script: &Script,
    oracle: &dyn UtxoOracle,
) -> Result<(Vec<(OutPoint, u64)>, Script, Script), TakerError> {
    let reveal = format!(
        "{} {} {} {} {}",
        hex::encode(podle.p.serialize()),
        hex::encode(podle.p2.serialize()),
        hex::encode(podle.s.secret_bytes()),
        hex::encode(podle.e.secret_bytes()),
        podle.index,
    );
    let utxo_field = taker_utxos
        .iter()
        .map(|(op, _)| format!("{}:{}", op.txid, op.vout))
        .collect::<Vec<_>>()
        .join(",");
    let plaintext = format!("{reveal} {utxo_field} {}", hex::encode(cj_script.as_bytes()));
    let blob = channel::encrypt(my_keys, peer_pub, &plaintext)?;

    let line = AppMessage {
        from_nick: taker_nick.to_string(),
        to_nick: maker_nick.to_string(),
        command: "auth".to_string(),
        args: vec![blob],
    };
    debug_assert!(is_encrypted_command(&line.command));
    transport::send_envelope(writer, crate::envelope::EnvelopeType::Privmsg, line.render())
        .await
        .map_err(TakerError::from)?;

    let env = transport::recv_envelope(reader).await.map_err(TakerError::from)?;
    let msg = AppMessage::parse(&env.line).map_err(TakerError::from)?;
    if msg.command != "ioauth" || msg.args.is_empty() {
        return Err(TakerError::Session(crate::error::SessionFailure::new(
            Phase::Auth,
            Some(maker_nick.to_string()),
            format!("expected ioauth, got {}", msg.command),
        )));
    }
    let plaintext = channel::decrypt(my_keys, peer_pub, &msg.args[0])?;
    let (maker_utxos, cj_out_script, change_script) = parse_ioauth(&plaintext)?;

    for (op, declared_value) in &maker_utxos {
        validate_declared_utxo(oracle, *op, *declared_value)?;
    }

    Ok((maker_utxos, cj_out_script, change_script))
}

fn parse_ioauth(plaintext: &str) -> Result<(Vec<(OutPoint, u64)>, Script, Script), TakerError> {
    let mut fields = plaintext.split(' ');
    let utxo_field = fields
        .next()
        .ok_or_else(|| TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "empty ioauth")))?;
    let cj_hex = fields
        .next()
        .ok_or_else(|| TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "ioauth missing cj script")))?;
    let change_hex = fields
        .next()
        .ok_or_else(|| TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "ioauth missing change script")))?;

    let mut utxos = Vec::new();
    for entry in utxo_field.split(',') {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(3, ':');
        let txid = parts.next().unwrap_or_default();
        let vout: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let value: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let outpoint = OutPoint {
            txid: txid.parse().map_err(|_| {
                TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "malformed txid in ioauth"))
            })?,
            vout,
        };
        utxos.push((outpoint, value));
    }

    let cj_script = Script::from(hex::decode(cj_hex).map_err(|_| {
        TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "malformed cj script hex"))
    })?);
    let change_script = Script::from(hex::decode(change_hex).map_err(|_| {
        TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, None, "malformed change script hex"))
    })?);
    Ok((utxos, cj_script, change_script))
}

fn validate_declared_utxo(oracle: &dyn UtxoOracle, op: OutPoint, declared_value: u64) -> Result<UtxoInfo, TakerError> {
    let info = oracle
        .get_utxo(op)?
        .ok_or_else(|| OracleError::UnknownUtxo(op.to_string()))?;
    if info.value != declared_value {
        return Err(OracleError::ValueMismatch {
            outpoint: op.to_string(),
            declared: declared_value,
            actual: info.value,
        }
        .into());
    }
    Ok(info)
}

/// SIGN step: send the unsigned transaction to one maker and collect its
/// per-input finalized witnesses, one per input the maker declared in
/// `!ioauth`, in that order. Caller applies them to the transaction.
pub async fn sign_with_maker(
    reader: &mut Reader,
    writer: &mut Writer,
    taker_nick: &str,
    maker_nick: &str,
    my_keys: &SessionKeypair,
    peer_pub: &crypto_box::PublicKey,
    unsigned_tx: &Transaction,
) -> Result<Vec<Vec<u8>>, TakerError> {
    let serialized = hex::encode(bdk::bitcoin::consensus::encode::serialize(unsigned_tx));
    let blob = channel::encrypt(my_keys, peer_pub, &serialized)?;
    let line = AppMessage {
        from_nick: taker_nick.to_string(),
        to_nick: maker_nick.to_string(),
        command: "tx".to_string(),
        args: vec![blob],
    };
    transport::send_envelope(writer, crate::envelope::EnvelopeType::Privmsg, line.render())
        .await
        .map_err(TakerError::from)?;

    let env = transport::recv_envelope(reader).await.map_err(TakerError::from)?;
    let msg = AppMessage::parse(&env.line).map_err(TakerError::from)?;
    if msg.command == "error" {
        return Err(TakerError::Session(crate::error::SessionFailure::new(
            Phase::Sign,
            Some(maker_nick.to_string()),
            "maker refused to sign",
        )));
    }
    if msg.command != "sig" {
        return Err(TakerError::Session(crate::error::SessionFailure::new(
            Phase::Sign,
            Some(maker_nick.to_string()),
            format!("expected sig, got {}", msg.command),
        )));
    }
    let plaintext = channel::decrypt(my_keys, peer_pub, &msg.args[0])?;
    plaintext
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| hex::decode(s).map_err(|_| {
            TakerError::Session(crate::error::SessionFailure::new(Phase::Sign, Some(maker_nick.to_string()), "malformed signature hex"))
        }))
        .collect()
}

/// Drive AUTH through BROADCAST for a run whose makers have already
/// completed FILL (`slots`, one per responding maker). Returns the
/// broadcast txid on success.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    ctx: &mut RunContext<'_>,
    taker_nick: &str,
    slots: &mut [MakerSlot],
    taker_utxos: &[(OutPoint, u64)],
    taker_cj_script: &Script,
    taker_change_script: Option<Script>,
    cj_amount: u64,
) -> Result<Transaction, TakerError> {
    for slot in slots.iter_mut() {
        let peer_pub = slot
            .peer_pub
            .clone()
            .ok_or_else(|| TakerError::Session(crate::error::SessionFailure::new(Phase::Auth, Some(slot.nick.clone()), "no peer key from fill")))?;
        let (maker_inputs, cj_script, change_script) = auth_maker(
            &mut slot.reader,
            &mut slot.writer,
            taker_nick,
            &slot.nick,
            &slot.my_keys,
            &peer_pub,
            &slot.podle,
            taker_utxos,
            taker_cj_script,
            ctx.oracle,
        )
        .await?;
        slot.inputs = maker_inputs;
        slot.cj_script = Some(cj_script);
        slot.change_script = Some(change_script);
    }

    let taker_value_in: u64 = taker_utxos.iter().map(|(_, v)| v).sum();
    let estimated_miner_fee = (slots.len() as u64 + 1) * 200;
    let taker_change_value = taker_value_in
        .saturating_sub(cj_amount)
        .saturating_sub(estimated_miner_fee);

    let makers: Vec<(MakerContribution, Script)> = slots
        .iter()
        .map(|s| {
            (
                MakerContribution {
                    nick: s.nick.clone(),
                    inputs: s.inputs.clone(),
                    change_script: s.change_script.clone().unwrap_or_else(Script::new),
                    change_value: s.change_value,
                },
                s.cj_script.clone().unwrap_or_else(Script::new),
            )
        })
        .collect();
    let taker_contribution = TakerContribution {
        inputs: taker_utxos.to_vec(),
        change_script: taker_change_script,
        change_value: taker_change_value,
    };
    let mut unsigned_tx = tx_build::assemble_transaction(
        &taker_contribution,
        taker_cj_script,
        &makers,
        cj_amount,
        ctx.config.dust_threshold,
    )?;

    for slot in slots.iter_mut() {
        let peer_pub = slot.peer_pub.clone().expect("bound during auth");
        let sigs = sign_with_maker(
            &mut slot.reader,
            &mut slot.writer,
            taker_nick,
            &slot.nick,
            &slot.my_keys,
            &peer_pub,
            &unsigned_tx,
        )
        .await?;
        if sigs.len() != slot.inputs.len() {
            return Err(TakerError::Session(crate::error::SessionFailure::new(
                Phase::Sign,
                Some(slot.nick.clone()),
                format!("expected {} signatures, got {}", slot.inputs.len(), sigs.len()),
            )));
        }
        for ((outpoint, _), witness_bytes) in slot.inputs.iter().zip(sigs.iter()) {
            let witness: bdk::bitcoin::Witness = bdk::bitcoin::consensus::encode::deserialize(witness_bytes).map_err(|_| {
                TakerError::Session(crate::error::SessionFailure::new(Phase::Sign, Some(slot.nick.clone()), "malformed witness"))
            })?;
            let idx = unsigned_tx
                .input
                .iter()
                .position(|txin| txin.previous_output == *outpoint)
                .ok_or_else(|| {
                    TakerError::Session(crate::error::SessionFailure::new(Phase::Sign, Some(slot.nick.clone()), "signed an unknown input"))
                })?;
            unsigned_tx.input[idx].witness = witness;
        }
    }

    let own_witnesses = ctx.wallet.sign_transaction(&unsigned_tx)?;
    for (outpoint, _) in taker_utxos {
        let idx = unsigned_tx
            .input
            .iter()
            .position(|txin| txin.previous_output == *outpoint)
            .expect("taker input present in assembled transaction");
        if let Some(witness) = own_witnesses.get(outpoint) {
            unsigned_tx.input[idx].witness = witness.clone();
        }
    }

    let broadcast_result = ctx.oracle.broadcast(&unsigned_tx);
    let success = broadcast_result.is_ok();
    record_history(ctx.history, &ctx.run_id, &unsigned_tx, cj_amount, slots.len(), success);
    broadcast_result?;
    Ok(unsigned_tx)
}

/// BROADCAST step (spec §4.4 step 6). Picks who asks the network to relay
/// the finished transaction; peer-based policies fall back to self on
/// failure unless the policy is `NotSelf`.
pub fn pick_broadcaster<'a>(
    policy: BroadcastPolicy,
    maker_nicks: &'a [String],
    rng: &mut impl rand::Rng,
) -> Vec<Option<&'a str>> {
    match policy {
        BroadcastPolicy::SelfBroadcast => vec![None],
        BroadcastPolicy::RandomPeer => {
            let mut pool: Vec<&str> = maker_nicks.iter().map(|s| s.as_str()).collect();
            pool.shuffle(rng);
            vec![pool.first().copied()]
        }
        BroadcastPolicy::MultiplePeers => {
            let mut pool: Vec<&str> = maker_nicks.iter().map(|s| s.as_str()).collect();
            pool.shuffle(rng);
            pool.truncate(3);
            pool.into_iter().map(Some).collect()
        }
        BroadcastPolicy::NotSelf => {
            let mut pool: Vec<&str> = maker_nicks.iter().map(|s| s.as_str()).collect();
            pool.shuffle(rng);
            pool.into_iter().map(Some).collect()
        }
    }
}

/// Whether a failed peer-relay attempt should fall back to broadcasting
/// via the local wallet/oracle instead.
pub fn should_fallback_to_self(policy: BroadcastPolicy, all_peers_failed: bool) -> bool {
    all_peers_failed && policy != BroadcastPolicy::NotSelf
}

/// Record the outcome of a finished run in `coinjoin_history.csv`.
pub fn record_history(history: &History, run_id: &str, tx: &Transaction, amount: u64, counterparty_count: usize, success: bool) {
    let entry = HistoryEntry {
        timestamp: 0,
        run_id: run_id.to_string(),
        txid: tx.txid().to_string(),
        amount,
        counterparty_count,
        success,
    };
    if let Err(e) = history.append(&entry) {
        warn!("failed to append coinjoin history entry for run {run_id}: {e}");
    }
    if success {
        info!("run {run_id} broadcast {}", entry.txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_stops_once_enough_responded() {
        assert!(!should_replace(3, 3, 0, 3));
        assert!(should_replace(2, 3, 0, 3));
        assert!(!should_replace(2, 3, 3, 3), "out of attempts, stop trying");
    }

    #[test]
    fn self_broadcast_never_uses_a_peer() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let picked = pick_broadcaster(BroadcastPolicy::SelfBroadcast, &["a".into(), "b".into()], &mut rng);
        assert_eq!(picked, vec![None]);
    }

    #[test]
    fn multiple_peers_fans_out_to_at_most_three() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let nicks = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let picked = pick_broadcaster(BroadcastPolicy::MultiplePeers, &nicks, &mut rng);
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|p| p.is_some()));
    }

    #[test]
    fn not_self_never_falls_back() {
        assert!(!should_fallback_to_self(BroadcastPolicy::NotSelf, true));
        assert!(should_fallback_to_self(BroadcastPolicy::RandomPeer, true));
        assert!(!should_fallback_to_self(BroadcastPolicy::RandomPeer, false));
    }

    #[test]
    fn parse_ioauth_round_trips_utxos_and_scripts() {
        let txid = "a".repeat(64);
        let plaintext = format!("{txid}:0:100000 5121 5122");
        let (utxos, cj, change) = parse_ioauth(&plaintext).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].1, 100_000);
        assert_eq!(cj.as_bytes(), &[0x51, 0x21]);
        assert_eq!(change.as_bytes(), &[0x51, 0x22]);
    }

    #[test]
    fn parse_ioauth_rejects_malformed_txid() {
        let plaintext = "not-hex:0:100000 5121 5122";
        assert!(parse_ioauth(plaintext).is_err());
    }
}
