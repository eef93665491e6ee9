//! Unsigned-transaction verifier (C6, spec §4.6).
//!
//! Byte-level check that a transaction is safe for a maker to sign.
//! Never produces signatures itself; callers (the maker session engine)
//! must not sign unless `verify` returns `Ok`.

use bdk::bitcoin::{OutPoint, Script, Transaction};

use crate::error::VerifierError;

/// Maker-local knowledge needed to judge a proposed unsigned transaction
/// (spec §4.6).
pub struct MakerContract<'a> {
    pub my_utxos: &'a [OutPoint],
    pub my_total_in: u64,
    pub cj_amount: u64,
    pub txfee_share: u64,
    pub real_cjfee: u64,
    pub my_cj_script: &'a Script,
    pub my_change_script: &'a Script,
    pub dust_threshold: u64,
}

/// Verify `tx` against `contract`, per the six conditions of spec §4.6.
/// Returns the first violated condition; the maker MUST NOT sign on any
/// `Err`.
pub fn verify(tx: &Transaction, contract: &MakerContract) -> Result<(), VerifierError> {
    // 1. "The transaction parses successfully" -- `tx` is already a
    // parsed `Transaction` by the time it reaches us; a construction
    // helper upstream is responsible for surfacing parse failures as
    // `Unparseable` before calling in here.

    // 2. Every outpoint in my_utxos appears exactly once in the inputs.
    for expected in contract.my_utxos {
        let count = tx
            .input
            .iter()
            .filter(|txin| txin.previous_output == *expected)
            .count();
        match count {
            1 => {}
            0 => return Err(VerifierError::MissingInput(expected.to_string())),
            _ => return Err(VerifierError::DuplicateInput(expected.to_string())),
        }
    }

    // 3. Exactly one output matches my_cj_addr, value >= cj_amount.
    let cj_outputs: Vec<u64> = tx
        .output
        .iter()
        .filter(|o| &o.script_pubkey == contract.my_cj_script)
        .map(|o| o.value)
        .collect();
    if cj_outputs.len() != 1 {
        return Err(VerifierError::CjOutputMultiplicity(cj_outputs.len()));
    }
    if cj_outputs[0] < contract.cj_amount {
        return Err(VerifierError::CjOutputInvalid {
            wanted: contract.cj_amount,
            found: Some(cj_outputs[0]),
        });
    }

    // 4. Expected change E = total_in - cj_amount - txfee_share + real_cjfee.
    // Per spec §9's open question, the contract is maker-favourable: `>= E`,
    // not strictly `== E` or `> E`.
    let change_outputs: Vec<u64> = tx
        .output
        .iter()
        .filter(|o| &o.script_pubkey == contract.my_change_script)
        .map(|o| o.value)
        .collect();

    let expected_change = (contract.my_total_in as i64)
        - (contract.cj_amount as i64)
        - (contract.txfee_share as i64)
        + (contract.real_cjfee as i64);

    if expected_change > contract.dust_threshold as i64 {
        if change_outputs.len() != 1 {
            return Err(VerifierError::ChangeOutputMultiplicity(change_outputs.len()));
        }
        if (change_outputs[0] as i64) < expected_change {
            return Err(VerifierError::ChangeOutputInvalid {
                expected: expected_change as u64,
                found: Some(change_outputs[0]),
            });
        }
    } else if !change_outputs.is_empty() {
        return Err(VerifierError::ChangeOutputMultiplicity(change_outputs.len()));
    }

    // 5. Profit: real_cjfee - txfee_share > 0, strictly.
    if contract.real_cjfee as i64 - contract.txfee_share as i64 <= 0 {
        return Err(VerifierError::NoProfit {
            real_cjfee: contract.real_cjfee,
            txfee_share: contract.txfee_share,
        });
    }

    // 6. CJ address exactly once (already checked above); change address
    // at most once.
    if contract.my_cj_script == contract.my_change_script && cj_outputs.len() + change_outputs.len() > 1
    {
        return Err(VerifierError::CjOutputMultiplicity(cj_outputs.len() + change_outputs.len()));
    }
    if change_outputs.len() > 1 {
        return Err(VerifierError::ChangeOutputMultiplicity(change_outputs.len()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk::bitcoin::{Address, PackedLockTime, Sequence, TxIn, TxOut, Witness};
    use std::str::FromStr;

    fn dummy_outpoint(vout: u32) -> OutPoint {
        OutPoint {
            txid: bdk::bitcoin::Txid::from_str(
                "000000000000000000000000000000000000000000000000000000000000aa",
            )
            .unwrap(),
            vout,
        }
    }

    fn addr_script(addr: &str) -> bdk::bitcoin::Script {
        Address::from_str(addr).unwrap().script_pubkey()
    }

    fn base_tx(my_input: OutPoint, cj_script: Script, cj_value: u64, change_script: Script, change_value: u64) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: my_input,
                script_sig: Default::default(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: cj_value,
                    script_pubkey: cj_script,
                },
                TxOut {
                    value: change_value,
                    script_pubkey: change_script,
                },
            ],
        }
    }

    fn cj_addr() -> String {
        "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string()
    }
    fn change_addr() -> String {
        "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh".to_string()
    }

    #[test]
    fn accepts_exact_change_boundary() {
        let my_utxo = dummy_outpoint(0);
        let cj_script = addr_script(&cj_addr());
        let change_script = addr_script(&change_addr());
        // total_in=600_000, cj=500_000, txfee_share=1000, real_cjfee=2000
        // => expected_change = 600_000-500_000-1000+2000 = 101_000
        let tx = base_tx(my_utxo, cj_script.clone(), 500_000, change_script.clone(), 101_000);
        let contract = MakerContract {
            my_utxos: std::slice::from_ref(&my_utxo),
            my_total_in: 600_000,
            cj_amount: 500_000,
            txfee_share: 1_000,
            real_cjfee: 2_000,
            my_cj_script: &cj_script,
            my_change_script: &change_script,
            dust_threshold: 27_300,
        };
        assert!(verify(&tx, &contract).is_ok());
    }

    #[test]
    fn change_exactly_dust_is_forfeited() {
        let my_utxo = dummy_outpoint(0);
        let cj_script = addr_script(&cj_addr());
        let change_script = addr_script(&change_addr());
        // expected_change = 526_300 - 500_000 - 1000 + 2000 = 27_300 == dust_threshold
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: my_utxo,
                script_sig: Default::default(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: 500_000,
                script_pubkey: cj_script.clone(),
            }],
        };
        let contract = MakerContract {
            my_utxos: std::slice::from_ref(&my_utxo),
            my_total_in: 526_300,
            cj_amount: 500_000,
            txfee_share: 1_000,
            real_cjfee: 2_000,
            my_cj_script: &cj_script,
            my_change_script: &change_script,
            dust_threshold: 27_300,
        };
        assert!(verify(&tx, &contract).is_ok());
    }

    #[test]
    fn cj_output_one_sat_short_is_rejected() {
        let my_utxo = dummy_outpoint(0);
        let cj_script = addr_script(&cj_addr());
        let change_script = addr_script(&change_addr());
        let tx = base_tx(my_utxo, cj_script.clone(), 499_999, change_script.clone(), 100_000);
        let contract = MakerContract {
            my_utxos: std::slice::from_ref(&my_utxo),
            my_total_in: 600_000,
            cj_amount: 500_000,
            txfee_share: 1_000,
            real_cjfee: 1_000,
            my_cj_script: &cj_script,
            my_change_script: &change_script,
            dust_threshold: 27_300,
        };
        assert!(matches!(
            verify(&tx, &contract),
            Err(VerifierError::CjOutputInvalid { .. })
        ));
    }

    #[test]
    fn missing_maker_utxo_rejected() {
        let my_utxo = dummy_outpoint(0);
        let other = dummy_outpoint(1);
        let cj_script = addr_script(&cj_addr());
        let change_script = addr_script(&change_addr());
        let tx = base_tx(other, cj_script.clone(), 500_000, change_script.clone(), 100_000);
        let contract = MakerContract {
            my_utxos: std::slice::from_ref(&my_utxo),
            my_total_in: 600_000,
            cj_amount: 500_000,
            txfee_share: 1_000,
            real_cjfee: 1_000,
            my_cj_script: &cj_script,
            my_change_script: &change_script,
            dust_threshold: 27_300,
        };
        assert!(matches!(
            verify(&tx, &contract),
            Err(VerifierError::MissingInput(_))
        ));
    }

    #[test]
    fn no_profit_rejected() {
        let my_utxo = dummy_outpoint(0);
        let cj_script = addr_script(&cj_addr());
        let change_script = addr_script(&change_addr());
        let tx = base_tx(my_utxo, cj_script.clone(), 500_000, change_script.clone(), 100_000);
        let contract = MakerContract {
            my_utxos: std::slice::from_ref(&my_utxo),
            my_total_in: 600_000,
            cj_amount: 500_000,
            txfee_share: 1_000,
            real_cjfee: 1_000, // equal, not strictly greater -> no profit
            my_cj_script: &cj_script,
            my_change_script: &change_script,
            dust_threshold: 27_300,
        };
        assert!(matches!(
            verify(&tx, &contract),
            Err(VerifierError::NoProfit { .. })
        ));
    }
}
