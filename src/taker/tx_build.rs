//! TX_BUILD phase logic (C4, spec §4.4 step 4): pure assembly of the
//! unsigned CoinJoin transaction from taker and maker inputs/outputs.
//! Kept free of any I/O so the scenarios of spec §8 can be tested
//! directly against it.

use bdk::bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::error::TakerError;

/// One maker's contribution to the joint transaction, once `AUTH` has
/// completed.
pub struct MakerContribution {
    pub nick: String,
    pub inputs: Vec<(OutPoint, u64)>,
    pub change_script: Script,
    pub change_value: u64,
}

pub struct TakerContribution {
    pub inputs: Vec<(OutPoint, u64)>,
    pub change_script: Option<Script>,
    pub change_value: u64,
}

/// Assemble the unsigned CoinJoin transaction: inputs = taker ∪ all
/// makers' inputs; outputs = N equal-value CJ outputs (one per maker +
/// one taker CJ output, each maker's own script from `makers`) ∪
/// per-maker change ∪ taker change if above dust.
///
/// Change exactly at `dust_threshold` is forfeited (no output created);
/// a CJ output at or below `dust_threshold` aborts the run.
pub fn assemble_transaction(
    taker: &TakerContribution,
    taker_cj_script: &Script,
    makers: &[(MakerContribution, Script)],
    cj_amount: u64,
    dust_threshold: u64,
) -> Result<Transaction, TakerError> {
    if cj_amount <= dust_threshold {
        return Err(TakerError::CjOutputIsDust(cj_amount));
    }

    let mut inputs = Vec::new();
    for (outpoint, _) in &taker.inputs {
        inputs.push(tx_in(*outpoint));
    }
    for (maker, _) in makers {
        for (outpoint, _) in &maker.inputs {
            inputs.push(tx_in(*outpoint));
        }
    }

    let mut outputs = Vec::new();
    for (_, cj_script) in makers {
        outputs.push(TxOut {
            value: cj_amount,
            script_pubkey: cj_script.clone(),
        });
    }
    outputs.push(TxOut {
        value: cj_amount,
        script_pubkey: taker_cj_script.clone(),
    });
    for (maker, _) in makers {
        if maker.change_value > dust_threshold {
            outputs.push(TxOut {
                value: maker.change_value,
                script_pubkey: maker.change_script.clone(),
            });
        }
    }
    if taker.change_value > dust_threshold {
        if let Some(script) = &taker.change_script {
            outputs.push(TxOut {
                value: taker.change_value,
                script_pubkey: script.clone(),
            });
        }
    }

    Ok(Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: inputs,
        output: outputs,
    })
}

fn tx_in(outpoint: OutPoint) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: Script::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk::bitcoin::hashes::Hash;
    use bdk::bitcoin::Txid;

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_slice(&[byte; 32]).unwrap(),
            vout,
        }
    }

    fn dummy_script(tag: u8) -> Script {
        Script::from(vec![0x51, tag])
    }

    #[test]
    fn scenario_1_happy_path_shapes_4_inputs_7_outputs() {
        let taker = TakerContribution {
            inputs: vec![(outpoint(1, 0), 100_000_000)],
            change_script: Some(dummy_script(9)),
            change_value: 99_490_000,
        };
        let makers: Vec<(MakerContribution, Script)> = (0u8..3)
            .map(|i| {
                (
                    MakerContribution {
                        nick: format!("maker-{i}"),
                        inputs: vec![(outpoint(10 + i, 0), 100_000_000)],
                        change_script: dummy_script(20 + i),
                        change_value: 99_495_000,
                    },
                    dummy_script(30 + i),
                )
            })
            .collect();

        let tx = assemble_transaction(&taker, &dummy_script(1), &makers, 500_000, 27_300).unwrap();

        assert_eq!(tx.input.len(), 4);
        assert_eq!(tx.output.len(), 7);
        let cj_outputs = tx.output.iter().filter(|o| o.value == 500_000).count();
        assert_eq!(cj_outputs, 4);
    }

    #[test]
    fn cj_amount_at_dust_threshold_aborts() {
        let taker = TakerContribution {
            inputs: vec![],
            change_script: None,
            change_value: 0,
        };
        let err = assemble_transaction(&taker, &dummy_script(1), &[], 27_300, 27_300)
            .unwrap_err();
        assert!(matches!(err, TakerError::CjOutputIsDust(27_300)));
    }

    #[test]
    fn exact_dust_change_is_forfeited_not_emitted() {
        let taker = TakerContribution {
            inputs: vec![(outpoint(2, 0), 1_000_000)],
            change_script: Some(dummy_script(5)),
            change_value: 27_300,
        };
        let tx =
            assemble_transaction(&taker, &dummy_script(1), &[], 500_000, 27_300)
                .unwrap();
        // Only the taker CJ output -- change was exactly dust, forfeited.
        assert_eq!(tx.output.len(), 1);
    }
}
