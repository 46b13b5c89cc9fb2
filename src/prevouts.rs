//! Resolution of the outputs being spent by a PSBT's inputs.
//!
//! Every input must carry exactly one previous-output source: either the
//! spent output itself (`witness_utxo`) or the full previous transaction
//! (`non_witness_utxo`). Carrying both or neither is an error, and a full
//! previous transaction must actually hash to the txid the input references.

use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::{Amount, ScriptBuf, TxOut};

use crate::error::{Error, ReferenceError};

/// Resolve the output script and value spent by input `index`.
pub fn resolve(psbt: &Psbt, index: usize) -> Result<(&ScriptBuf, Amount), Error> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(ReferenceError::InputIndexOutOfBounds {
            index,
            inputs: psbt.inputs.len(),
        })?;
    let outpoint = psbt.unsigned_tx.input[index].previous_output;

    match (&input.witness_utxo, &input.non_witness_utxo) {
        (Some(witness_utxo), None) => Ok((&witness_utxo.script_pubkey, witness_utxo.value)),
        (None, Some(prev_tx)) => {
            let txid = prev_tx.compute_txid();
            if txid != outpoint.txid {
                return Err(ReferenceError::PrevTxMismatch {
                    index,
                    expected: outpoint.txid,
                    actual: txid,
                }
                .into());
            }
            let output = prev_tx
                .output
                .get(outpoint.vout as usize)
                .ok_or(ReferenceError::OutputIndexOutOfBounds {
                    vout: outpoint.vout,
                })?;
            Ok((&output.script_pubkey, output.value))
        }
        (Some(_), Some(_)) => Err(ReferenceError::BothUtxoFieldsSet { index }.into()),
        (None, None) => Err(ReferenceError::NoUtxoFields { index }.into()),
    }
}

/// Collect the spent outputs of all inputs, in input order.
///
/// Taproot digests commit to every input's amount and script, so signing any
/// taproot input needs the full list.
pub fn collect(psbt: &Psbt) -> Result<Vec<TxOut>, Error> {
    (0..psbt.inputs.len())
        .map(|index| {
            let (script_pubkey, value) = resolve(psbt, index)?;
            Ok(TxOut {
                value,
                script_pubkey: script_pubkey.clone(),
            })
        })
        .collect()
}
