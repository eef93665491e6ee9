//! External collaborators (spec §1, §9): named interfaces for subsystems
//! whose internals are out of scope here -- HD wallet derivation, UTXO
//! selection, the mempool/RPC adapter, and fidelity-bond economics.
//!
//! Implemented as tagged-variant capability sets, per spec §9's guidance
//! to prefer an interface boundary over runtime patching.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use bdk::bitcoin::secp256k1::Secp256k1;
use bdk::bitcoin::util::bip32::{DerivationPath, KeySource};
use bdk::bitcoin::util::psbt::PartiallySignedTransaction;
use bdk::bitcoin::{Network, OutPoint, Script, Transaction, Txid, Witness};
use bdk::database::MemoryDatabase;
use bdk::descriptor::Segwitv0;
use bdk::keys::bip39::{Language, Mnemonic, WordCount};
use bdk::keys::DescriptorKey::Secret;
use bdk::keys::{DerivableKey, DescriptorKey, ExtendedKey, GeneratableKey, GeneratedKey};
use bdk::wallet::AddressIndex;
use bdk::{KeychainKind, SignOptions, Wallet};

use crate::error::OracleError;
use crate::registry::BondProof;

#[derive(Debug, Clone)]
pub struct UtxoInfo {
    pub script_pubkey: Script,
    pub value: u64,
    pub height: Option<u32>,
    pub confirmations: u32,
}

/// `{get_utxo, broadcast, estimate_fee}` -- the UTXO oracle capability
/// set (spec §9). A transactional external service; the core never
/// mutates its state except through this interface.
pub trait UtxoOracle: Send + Sync {
    fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<UtxoInfo>, OracleError>;
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, OracleError>;
    fn estimate_fee(&self, target_blocks: u16) -> Result<f64, OracleError>;
}

/// `score(bond_proof, current_height) -> non_negative_real` (spec §9). A
/// pluggable collaborator; bond *economics* are explicitly out of scope
/// (spec §1 Non-goals) -- only this scoring seam is specified.
pub trait BondScorer: Send + Sync {
    fn score(&self, bond: &BondProof, current_height: u32) -> f64;
}

/// Trivial scorer used by tests and as a safe default: bonds score zero
/// once expired, otherwise a monotonic function of remaining blocks times
/// the locked value -- deliberately simplistic, real weighting is a
/// pluggable research question per spec §1.
pub struct LocktimeWeightedScorer;

impl BondScorer for LocktimeWeightedScorer {
    fn score(&self, bond: &BondProof, current_height: u32) -> f64 {
        if !bond.is_time_valid(current_height) {
            return 0.0;
        }
        let remaining_periods = (bond.cert_expiry as u32).saturating_sub(current_height / 2016);
        remaining_periods as f64
    }
}

/// Minimal HD-wallet-derivation surface the session engines depend on
/// (BIP32/39/84 internals are out of scope per spec §1).
pub trait WalletHandle: Send + Sync {
    fn fresh_cj_address(&self, mixdepth: u32) -> Result<Script, OracleError>;
    fn fresh_change_address(&self, mixdepth: u32) -> Result<Script, OracleError>;
    fn list_spendable_utxos(&self, mixdepth: u32) -> Result<Vec<(OutPoint, UtxoInfo)>, OracleError>;

    /// Sign every input of `tx` this wallet recognizes as its own,
    /// returning the finalized witness per outpoint. Inputs the wallet
    /// doesn't hold a key for are left out of the map.
    fn sign_transaction(&self, tx: &Transaction) -> Result<HashMap<OutPoint, Witness>, OracleError>;
}

/// A directly-held UTXO set with no chain backend, for operators running
/// against a known set of outpoints (e.g. regtest) rather than a full
/// node or SPV client. `broadcast` and `estimate_fee` are stubs a real
/// deployment would route to an RPC/Electrum backend.
#[derive(Default)]
pub struct InMemoryOracle {
    utxos: Mutex<HashMap<OutPoint, UtxoInfo>>,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        InMemoryOracle::default()
    }

    pub fn insert(&self, outpoint: OutPoint, info: UtxoInfo) {
        self.utxos.lock().unwrap().insert(outpoint, info);
    }
}

impl UtxoOracle for InMemoryOracle {
    fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<UtxoInfo>, OracleError> {
        Ok(self.utxos.lock().unwrap().get(&outpoint).cloned())
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, OracleError> {
        Ok(tx.txid())
    }

    fn estimate_fee(&self, _target_blocks: u16) -> Result<f64, OracleError> {
        Ok(5.0)
    }
}

/// A single-descriptor `bdk` wallet keyed per mixdepth by keychain index,
/// standing in for the BIP32/39/84 derivation this core treats as an
/// external collaborator (spec §1).
pub struct EphemeralWallet {
    wallet: Wallet<MemoryDatabase>,
}

impl EphemeralWallet {
    pub fn from_descriptor(descriptor: &str, network: Network) -> Result<Self, OracleError> {
        let wallet = Wallet::new(descriptor, None, network, MemoryDatabase::new())
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
        Ok(EphemeralWallet { wallet })
    }

    /// Generate a fresh mixdepth-0 `wpkh` wallet from a random mnemonic.
    /// Stands in for the real BIP32/39/84 derivation this core treats as
    /// an external collaborator -- a full implementation rotates a
    /// descriptor per mixdepth instead of always deriving account 0.
    pub fn generate(network: Network) -> Result<Self, OracleError> {
        let secp = Secp256k1::new();
        let mnemonic: GeneratedKey<_, Segwitv0> = Mnemonic::generate((WordCount::Words12, Language::English))
            .map_err(|_| OracleError::BroadcastRejected("mnemonic generation failed".into()))?;
        let xkey: ExtendedKey = (mnemonic.into_key(), None)
            .into_extended_key()
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
        let xprv = xkey
            .into_xprv(network)
            .ok_or_else(|| OracleError::BroadcastRejected("not an extended private key".into()))?;

        let path = DerivationPath::from_str("m/84h/1h/0h/0").expect("valid derivation path");
        let derived = xprv
            .derive_priv(&secp, &path)
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
        let origin: KeySource = (xprv.fingerprint(&secp), path);
        let desc_key: DescriptorKey<Segwitv0> = derived
            .into_descriptor_key(Some(origin), DerivationPath::default())
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
        let descriptor = match desc_key {
            Secret(key, _, _) => format!("wpkh({key})"),
            _ => return Err(OracleError::BroadcastRejected("expected a secret descriptor key".into())),
        };
        Self::from_descriptor(&descriptor, network)
    }
}

impl WalletHandle for EphemeralWallet {
    fn fresh_cj_address(&self, _mixdepth: u32) -> Result<Script, OracleError> {
        Ok(self
            .wallet
            .get_address(AddressIndex::New)
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?
            .script_pubkey())
    }

    fn fresh_change_address(&self, _mixdepth: u32) -> Result<Script, OracleError> {
        Ok(self
            .wallet
            .get_internal_address(AddressIndex::New)
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?
            .script_pubkey())
    }

    fn list_spendable_utxos(&self, _mixdepth: u32) -> Result<Vec<(OutPoint, UtxoInfo)>, OracleError> {
        let unspent = self
            .wallet
            .list_unspent()
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
        Ok(unspent
            .into_iter()
            .map(|u| {
                let info = UtxoInfo {
                    script_pubkey: u.txout.script_pubkey.clone(),
                    value: u.txout.value,
                    height: None,
                    confirmations: if u.keychain == KeychainKind::External { 6 } else { 0 },
                };
                (u.outpoint, info)
            })
            .collect())
    }

    fn sign_transaction(&self, tx: &Transaction) -> Result<HashMap<OutPoint, Witness>, OracleError> {
        let own_utxos: HashMap<OutPoint, bdk::LocalUtxo> = self
            .wallet
            .list_unspent()
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?
            .into_iter()
            .map(|utxo| (utxo.outpoint, utxo))
            .collect();

        let mut psbt = PartiallySignedTransaction::from_unsigned_tx(tx.clone())
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;

        for (i, txin) in tx.input.iter().enumerate() {
            if let Some(utxo) = own_utxos.get(&txin.previous_output) {
                psbt.inputs[i] = self
                    .wallet
                    .get_psbt_input(utxo.clone(), None, false)
                    .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;
            }
        }

        self.wallet
            .sign(&mut psbt, SignOptions::default())
            .map_err(|e| OracleError::BroadcastRejected(e.to_string()))?;

        Ok(tx
            .input
            .iter()
            .enumerate()
            .filter_map(|(i, txin)| {
                psbt.inputs[i]
                    .final_script_witness
                    .clone()
                    .map(|witness| (txin.previous_output, witness))
            })
            .collect())
    }
}

#[cfg(test)]
pub mod test_doubles {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockOracle {
        pub utxos: Mutex<HashMap<OutPoint, UtxoInfo>>,
    }

    impl UtxoOracle for MockOracle {
        fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<UtxoInfo>, OracleError> {
            Ok(self.utxos.lock().unwrap().get(&outpoint).cloned())
        }
        fn broadcast(&self, tx: &Transaction) -> Result<Txid, OracleError> {
            Ok(tx.txid())
        }
        fn estimate_fee(&self, _target_blocks: u16) -> Result<f64, OracleError> {
            Ok(5.0)
        }
    }

    #[test]
    fn scorer_zero_past_expiry() {
        let scorer = LocktimeWeightedScorer;
        let bond = BondProof {
            nick_sig: [0; 72],
            cert_sig: [0; 72],
            cert_pubkey: [0; 33],
            cert_expiry: 1,
            utxo_pubkey: [0; 33],
            txid: [0; 32],
            vout: 0,
            timelock: 0,
        };
        assert_eq!(scorer.score(&bond, 2016), 0.0);
        assert!(scorer.score(&bond, 0) > 0.0);
    }
}
