//! Peer registry and orderbook (C3, spec §4.3) plus the `Phase` cursor
//! shared by sessions and by the error taxonomy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::SelectionAlgorithm;

/// Run-level / session-level phase cursor (spec §4.4/§4.5). Shared across
/// the taker and maker state machines and embedded in user-visible
/// failures (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Discover,
    Fill,
    Auth,
    TxBuild,
    Sign,
    Broadcast,
    Done,
    Aborted,
    TimedOut,
}

impl Phase {
    /// A session's phase must advance monotonically; any earlier phase
    /// received after a later one has been reached is a protocol
    /// violation (spec §3 invariants).
    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Discover => 1,
            Phase::Fill => 2,
            Phase::Auth => 3,
            Phase::TxBuild => 4,
            Phase::Sign => 5,
            Phase::Broadcast => 6,
            Phase::Done | Phase::Aborted | Phase::TimedOut => 7,
        }
    }
}

/// `"J" || version_digit || base58(sha256(pubkey)[0..14])` (spec §3/§6).
pub fn derive_nick(pubkey: &bdk::bitcoin::secp256k1::PublicKey, version_digit: u8) -> String {
    use bdk::bitcoin::hashes::{sha256, Hash};
    let digest = sha256::Hash::hash(&pubkey.serialize());
    format!("J{}{}", version_digit, bs58::encode(&digest.as_byte_array()[..14]).into_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Handshaked,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub nick: String,
    pub signing_pubkey: bdk::bitcoin::secp256k1::PublicKey,
    /// Onion `host:port`, or `"direct"`.
    pub location: String,
    pub features: Vec<String>,
    pub state: HandshakeState,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    Relative,
    Absolute,
}

/// `cjfee_value`: a rational in `[0,1)` for relative offers, or an
/// integer satoshi amount for absolute ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CjFee {
    Relative(f64),
    Absolute(u64),
}

impl CjFee {
    /// Effective fee in satoshis for a given CoinJoin amount, used to
    /// rank offers under `cheapest`/`weighted`.
    pub fn effective_sats(&self, amount: u64) -> u64 {
        match self {
            CjFee::Relative(frac) => ((amount as f64) * frac).round() as u64,
            CjFee::Absolute(sats) => *sats,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BondProof {
    pub nick_sig: [u8; 72],
    pub cert_sig: [u8; 72],
    pub cert_pubkey: [u8; 33],
    pub cert_expiry: u16,
    pub utxo_pubkey: [u8; 33],
    pub txid: [u8; 32],
    pub vout: u32,
    pub timelock: u32,
}

pub const BOND_PROOF_LEN: usize = 72 + 72 + 33 + 2 + 33 + 32 + 4 + 4;

impl BondProof {
    /// Fixed 252-byte wire serialization, spec §3.
    pub fn to_bytes(&self) -> [u8; BOND_PROOF_LEN] {
        let mut buf = [0u8; BOND_PROOF_LEN];
        let mut off = 0;
        macro_rules! put {
            ($field:expr) => {{
                let len = $field.len();
                buf[off..off + len].copy_from_slice(&$field);
                off += len;
            }};
        }
        put!(self.nick_sig);
        put!(self.cert_sig);
        put!(self.cert_pubkey);
        put!(self.cert_expiry.to_le_bytes());
        put!(self.utxo_pubkey);
        put!(self.txid);
        put!(self.vout.to_le_bytes());
        put!(self.timelock.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; BOND_PROOF_LEN]) -> Self {
        let mut off = 0;
        macro_rules! take {
            ($len:expr) => {{
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&buf[off..off + $len]);
                off += $len;
                arr
            }};
        }
        BondProof {
            nick_sig: take!(72),
            cert_sig: take!(72),
            cert_pubkey: take!(33),
            cert_expiry: u16::from_le_bytes(take!(2)),
            utxo_pubkey: take!(33),
            txid: take!(32),
            vout: u32::from_le_bytes(take!(4)),
            timelock: u32::from_le_bytes(take!(4)),
        }
    }

    /// `cert_expiry` is an absolute difficulty-retarget period number; the
    /// bond is valid only while `current_block_height < cert_expiry * 2016`.
    pub fn is_time_valid(&self, current_block_height: u32) -> bool {
        (current_block_height as u64) < (self.cert_expiry as u64) * 2016
    }

    /// Left-pad a raw DER signature to exactly 72 bytes with `0xff`; the
    /// DER header byte `0x30` makes stripping unambiguous on decode.
    pub fn pad_der(der: &[u8]) -> Result<[u8; 72], &'static str> {
        if der.len() > 72 || der.first() != Some(&0x30) {
            return Err("DER signature too long or malformed header");
        }
        let mut out = [0xffu8; 72];
        let offset = 72 - der.len();
        out[offset..].copy_from_slice(der);
        Ok(out)
    }

    pub fn strip_der(padded: &[u8; 72]) -> &[u8] {
        let start = padded.iter().position(|&b| b == 0x30).unwrap_or(0);
        &padded[start..]
    }
}

#[derive(Debug, Clone)]
pub struct Offer {
    pub maker_nick: String,
    pub order_id: u64,
    pub kind: OfferKind,
    pub min_size: u64,
    pub max_size: u64,
    pub txfee_contribution: u64,
    pub cjfee: CjFee,
    pub bond_score: f64,
    pub received_at: Instant,
}

/// Peer table keyed by nick, offer table keyed by `(nick, order_id)`
/// (spec §4.3).
#[derive(Default)]
pub struct Registry {
    peers: HashMap<String, Peer>,
    offers: HashMap<(String, u64), Offer>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn upsert_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.nick.clone(), peer);
    }

    pub fn peer(&self, nick: &str) -> Option<&Peer> {
        self.peers.get(nick)
    }

    pub fn disconnect(&mut self, nick: &str) {
        if let Some(peer) = self.peers.get_mut(nick) {
            peer.state = HandshakeState::Disconnected;
        }
    }

    /// `(maker_nick, order_id)` replaces an existing offer only if the
    /// incoming one is strictly newer (spec §3 invariants).
    pub fn submit_offer(&mut self, offer: Offer) {
        let key = (offer.maker_nick.clone(), offer.order_id);
        match self.offers.get(&key) {
            Some(existing) if existing.received_at >= offer.received_at => {}
            _ => {
                self.offers.insert(key, offer);
            }
        }
    }

    /// Purge offers older than `max_offer_age`, and those whose maker has
    /// disconnected (kept briefly for observability is a caller concern;
    /// selection always filters disconnected makers regardless).
    pub fn live_offers(&self, max_offer_age: Duration, now: Instant) -> Vec<&Offer> {
        self.offers
            .values()
            .filter(|o| now.duration_since(o.received_at) <= max_offer_age)
            .filter(|o| {
                self.peers
                    .get(&o.maker_nick)
                    .map(|p| p.state != HandshakeState::Disconnected)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }
}

/// Parameters for the filter step of maker selection (spec §4.3 step 1).
pub struct SelectionRequest<'a> {
    pub amount: u64,
    pub kind: OfferKind,
    pub max_fee_sats: u64,
    pub ignored_nicks: &'a [String],
    pub count: usize,
}

/// Step 1 (filter) + step 2 (dedup to cheapest-per-maker). Selection
/// probability is per maker identity, not per offer -- this is what
/// enforces that.
pub fn filter_and_dedup<'a>(offers: &[&'a Offer], req: &SelectionRequest) -> Vec<&'a Offer> {
    let mut cheapest_per_maker: HashMap<&str, &Offer> = HashMap::new();

    for &offer in offers {
        if offer.min_size > req.amount || offer.max_size < req.amount {
            continue;
        }
        if offer.kind != req.kind {
            continue;
        }
        if offer.cjfee.effective_sats(req.amount) > req.max_fee_sats {
            continue;
        }
        if req.ignored_nicks.iter().any(|n| n == &offer.maker_nick) {
            continue;
        }

        cheapest_per_maker
            .entry(offer.maker_nick.as_str())
            .and_modify(|current| {
                if offer.cjfee.effective_sats(req.amount) < current.cjfee.effective_sats(req.amount)
                {
                    *current = offer;
                }
            })
            .or_insert(offer);
    }

    cheapest_per_maker.into_values().collect()
}

/// Step 3: select `n` makers from the deduplicated pool using the
/// configured algorithm (spec §4.3).
pub fn select_makers<'a>(
    pool: &[&'a Offer],
    algorithm: SelectionAlgorithm,
    amount: u64,
    n: usize,
    alpha: f64,
    bond_fraction: (u32, u32),
    rng: &mut impl rand::Rng,
) -> Vec<&'a Offer> {
    if pool.is_empty() || n == 0 {
        return Vec::new();
    }
    match algorithm {
        SelectionAlgorithm::Cheapest => {
            let mut sorted = pool.to_vec();
            sorted.sort_by(|a, b| {
                a.cjfee
                    .effective_sats(amount)
                    .cmp(&b.cjfee.effective_sats(amount))
                    .then(a.order_id.cmp(&b.order_id))
            });
            sorted.into_iter().take(n).collect()
        }
        SelectionAlgorithm::Weighted => {
            weighted_draw_without_replacement(pool, n, rng, |o| {
                (-alpha * o.cjfee.effective_sats(amount) as f64).exp()
            })
        }
        SelectionAlgorithm::Random => {
            let mut shuffled = pool.to_vec();
            shuffled.shuffle(rng);
            shuffled.into_iter().take(n).collect()
        }
        SelectionAlgorithm::FidelityBondWeighted => {
            let (num, den) = bond_fraction;
            let bond_slots = (num as usize * n) / den as usize;
            let uniform_slots = n - bond_slots;

            let bond_selected =
                weighted_draw_without_replacement(pool, bond_slots, rng, |o| o.bond_score.max(0.0));
            let selected_nicks: std::collections::HashSet<&str> =
                bond_selected.iter().map(|o| o.maker_nick.as_str()).collect();

            let mut remaining: Vec<&Offer> = pool
                .iter()
                .copied()
                .filter(|o| !selected_nicks.contains(o.maker_nick.as_str()))
                .collect();
            remaining.shuffle(rng);
            remaining.truncate(uniform_slots);

            let mut result = bond_selected;
            result.extend(remaining);
            result
        }
    }
}

/// Weighted sampling without replacement. Offers with zero total weight
/// fall back to uniform sampling over the remaining pool, so a
/// `fidelity_bond_weighted` pool with no bonded makers still fills.
fn weighted_draw_without_replacement<'a>(
    pool: &[&'a Offer],
    count: usize,
    rng: &mut impl rand::Rng,
    weight_fn: impl Fn(&Offer) -> f64,
) -> Vec<&'a Offer> {
    let mut remaining: Vec<&Offer> = pool.to_vec();
    let mut picked = Vec::new();

    for _ in 0..count.min(pool.len()) {
        let weights: Vec<f64> = remaining.iter().map(|o| weight_fn(o)).collect();
        let total: f64 = weights.iter().sum();
        let idx = if total > 0.0 {
            let dist = WeightedIndex::new(&weights).expect("at least one positive weight");
            dist.sample(rng)
        } else {
            rng.gen_range(0..remaining.len())
        };
        picked.push(remaining.remove(idx));
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn offer(nick: &str, oid: u64, fee: u64, bond: f64, age: Instant) -> Offer {
        Offer {
            maker_nick: nick.to_string(),
            order_id: oid,
            kind: OfferKind::Relative,
            min_size: 0,
            max_size: u64::MAX,
            txfee_contribution: 0,
            cjfee: CjFee::Absolute(fee),
            bond_score: bond,
            received_at: age,
        }
    }

    #[test]
    fn derived_nick_has_expected_shape() {
        let secp = bdk::bitcoin::secp256k1::Secp256k1::new();
        let sk = bdk::bitcoin::secp256k1::SecretKey::from_slice(&[6u8; 32]).unwrap();
        let pk = bdk::bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let nick = derive_nick(&pk, 5);
        assert!(nick.starts_with('J'));
        assert_eq!(&nick[1..2], "5");
        assert_eq!(derive_nick(&pk, 5), nick, "deterministic for a fixed key");
    }

    #[test]
    fn bond_proof_round_trips_252_bytes() {
        let proof = BondProof {
            nick_sig: [1u8; 72],
            cert_sig: [2u8; 72],
            cert_pubkey: [3u8; 33],
            cert_expiry: 4200,
            utxo_pubkey: [5u8; 33],
            txid: [6u8; 32],
            vout: 7,
            timelock: 1000,
        };
        let bytes = proof.to_bytes();
        assert_eq!(bytes.len(), 252);
        let parsed = BondProof::from_bytes(&bytes);
        assert_eq!(parsed.cert_expiry, 4200);
        assert_eq!(parsed.vout, 7);
        assert_eq!(parsed.timelock, 1000);
    }

    #[test]
    fn der_padding_is_unambiguous() {
        let der = [0x30, 0x02, 0x01, 0x02];
        let padded = BondProof::pad_der(&der).unwrap();
        assert_eq!(padded.len(), 72);
        assert_eq!(BondProof::strip_der(&padded), &der);
    }

    #[test]
    fn bond_expiry_boundary() {
        let proof = BondProof {
            nick_sig: [0; 72],
            cert_sig: [0; 72],
            cert_pubkey: [0; 33],
            cert_expiry: 1,
            utxo_pubkey: [0; 33],
            txid: [0; 32],
            vout: 0,
            timelock: 0,
        };
        assert!(proof.is_time_valid(2015));
        assert!(!proof.is_time_valid(2016));
    }

    #[test]
    fn late_duplicate_offer_only_replaces_when_strictly_newer() {
        let mut reg = Registry::new();
        let t0 = Instant::now();
        reg.submit_offer(offer("J5a", 1, 1000, 0.0, t0));
        reg.submit_offer(offer("J5a", 1, 2000, 0.0, t0));
        let live = reg.live_offers(Duration::from_secs(3600), t0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].cjfee.effective_sats(0), 1000);
    }

    #[test]
    fn selection_returns_at_most_one_offer_per_maker() {
        let t0 = Instant::now();
        let offers = vec![
            offer("J5a", 1, 500, 0.0, t0),
            offer("J5a", 2, 300, 0.0, t0),
            offer("J5b", 3, 400, 0.0, t0),
        ];
        let refs: Vec<&Offer> = offers.iter().collect();
        let req = SelectionRequest {
            amount: 100_000,
            kind: OfferKind::Relative,
            max_fee_sats: 10_000,
            ignored_nicks: &[],
            count: 2,
        };
        let deduped = filter_and_dedup(&refs, &req);
        let nicks: std::collections::HashSet<_> = deduped.iter().map(|o| &o.maker_nick).collect();
        assert_eq!(nicks.len(), deduped.len());
        assert_eq!(deduped.len(), 2);
        assert!(deduped.iter().any(|o| o.order_id == 2));
    }

    #[test]
    fn cheapest_algorithm_breaks_ties_by_order_id() {
        let t0 = Instant::now();
        let offers = vec![offer("J5a", 5, 100, 0.0, t0), offer("J5b", 2, 100, 0.0, t0)];
        let refs: Vec<&Offer> = offers.iter().collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let picked = select_makers(&refs, SelectionAlgorithm::Cheapest, 1000, 1, 1.0, (7, 8), &mut rng);
        assert_eq!(picked[0].order_id, 2);
    }

    #[test]
    fn fidelity_bond_weighted_splits_slots_per_spec_scenario_6() {
        let t0 = Instant::now();
        let mut offers = vec![
            offer("bonded-100", 1, 100, 100.0, t0),
            offer("bonded-40", 2, 100, 40.0, t0),
            offer("bonded-10", 3, 100, 10.0, t0),
        ];
        for i in 0..7 {
            offers.push(offer(&format!("unbonded-{i}"), 10 + i, 100, 0.0, t0));
        }
        let refs: Vec<&Offer> = offers.iter().collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let picked = select_makers(
            &refs,
            SelectionAlgorithm::FidelityBondWeighted,
            1000,
            4,
            1.0,
            (7, 8),
            &mut rng,
        );
        assert_eq!(picked.len(), 4);
        let nicks: std::collections::HashSet<_> = picked.iter().map(|o| &o.maker_nick).collect();
        assert_eq!(nicks.len(), 4, "selection must be per maker identity");
    }
}
