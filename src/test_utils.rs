//! Shared fixtures for unit tests.

use miniscript::bitcoin::absolute::LockTime;
use miniscript::bitcoin::hashes::Hash;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::script::Builder;
use miniscript::bitcoin::transaction::Version;
use miniscript::bitcoin::{
    opcodes, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::signer::KeySigner;

/// Deterministic signer whose secret key is `byte` repeated 32 times
pub fn test_signer(byte: u8) -> KeySigner {
    KeySigner::from_hex(&hex::encode([byte; 32])).unwrap()
}

pub fn p2wpkh_script(signer: &KeySigner) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&signer.compressed_public_key().wpubkey_hash())
}

/// Key-path-only taproot output for the signer's key
pub fn p2tr_key_script(signer: &KeySigner) -> ScriptBuf {
    ScriptBuf::new_p2tr(signer.secp(), signer.x_only_public_key(), None)
}

/// `m`-of-n bare multisig script over the signers' keys, in order
pub fn multisig_script(m: i64, signers: &[KeySigner]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(m);
    for signer in signers {
        builder = builder.push_key(&signer.public_key());
    }
    builder
        .push_int(signers.len() as i64)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// One-output transaction usable as a non-witness previous transaction
pub fn test_prev_tx(script_pubkey: ScriptBuf, value: Amount) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0x11; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey,
        }],
    }
}

/// PSBT spending the given outpoints, with no outputs and empty metadata
pub fn skeleton_psbt(outpoints: Vec<OutPoint>) -> Psbt {
    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: outpoints
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: vec![],
    };
    Psbt::from_unsigned_tx(unsigned_tx).unwrap()
}

/// 1-in/1-out PSBT with a witness utxo attached, paying back to the same
/// script
pub fn single_input_psbt(script_pubkey: ScriptBuf, value: Amount) -> Psbt {
    let mut psbt = skeleton_psbt(vec![OutPoint {
        txid: Txid::from_byte_array([0x22; 32]),
        vout: 0,
    }]);
    psbt.unsigned_tx.output.push(TxOut {
        value,
        script_pubkey: script_pubkey.clone(),
    });
    psbt.outputs.push(Default::default());
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value,
        script_pubkey,
    });
    psbt
}

/// 2-in/2-out PSBT with witness utxos attached, input `i` paired with an
/// output paying back to its own script and amount
pub fn two_input_psbt(
    first_script: ScriptBuf,
    first_value: Amount,
    second_script: ScriptBuf,
    second_value: Amount,
) -> Psbt {
    let mut psbt = skeleton_psbt(vec![
        OutPoint {
            txid: Txid::from_byte_array([0x22; 32]),
            vout: 0,
        },
        OutPoint {
            txid: Txid::from_byte_array([0x33; 32]),
            vout: 1,
        },
    ]);
    for (script_pubkey, value) in [
        (first_script, first_value),
        (second_script, second_value),
    ] {
        psbt.unsigned_tx.output.push(TxOut {
            value,
            script_pubkey: script_pubkey.clone(),
        });
        psbt.outputs.push(Default::default());
    }
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: first_value,
        script_pubkey: psbt.unsigned_tx.output[0].script_pubkey.clone(),
    });
    psbt.inputs[1].witness_utxo = Some(TxOut {
        value: second_value,
        script_pubkey: psbt.unsigned_tx.output[1].script_pubkey.clone(),
    });
    psbt
}
