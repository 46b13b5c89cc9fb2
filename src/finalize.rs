//! Assembly of final script-sigs and witnesses from collected signatures.
//!
//! Finalization is monotonic: once an input carries its final unlocking
//! data, its signature metadata is cleared and the input never leaves the
//! finalized state. An input below its multisig threshold simply stays
//! partially signed; that is not an error.

use std::collections::BTreeMap;

use miniscript::bitcoin::psbt::{Input, Psbt};
use miniscript::bitcoin::script::{Builder, Instruction, PushBytesBuf};
use miniscript::bitcoin::{ecdsa, opcodes, PublicKey, Script, ScriptBuf, TapLeafHash, Witness};

use crate::error::{Error, FinalizeError, ReferenceError};
use crate::prevouts;
use crate::sighash::{self, SpendKind};

/// Lifecycle of a PSBT input. `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Unsigned,
    PartiallySigned,
    Finalized,
}

impl std::fmt::Display for InputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InputState::Unsigned => "unsigned",
            InputState::PartiallySigned => "partiallySigned",
            InputState::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

pub fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

pub fn input_state(input: &Input) -> InputState {
    if is_finalized(input) {
        InputState::Finalized
    } else if !input.partial_sigs.is_empty()
        || input.tap_key_sig.is_some()
        || !input.tap_script_sigs.is_empty()
    {
        InputState::PartiallySigned
    } else {
        InputState::Unsigned
    }
}

/// Parse an `OP_m <pubkey...> OP_n OP_CHECKMULTISIG` script into its
/// threshold and key list (script order).
pub fn parse_multisig_script(script: &Script) -> Result<(usize, Vec<PublicKey>), String> {
    let mut instructions = script.instructions();

    let m = match instructions.next() {
        Some(Ok(Instruction::Op(op)))
            if (opcodes::all::OP_PUSHNUM_1.to_u8()..=opcodes::all::OP_PUSHNUM_16.to_u8())
                .contains(&op.to_u8()) =>
        {
            (op.to_u8() - opcodes::all::OP_PUSHNUM_1.to_u8() + 1) as usize
        }
        _ => return Err("expected threshold opcode".to_string()),
    };

    let mut keys = Vec::new();
    let n = loop {
        match instructions.next() {
            Some(Ok(Instruction::PushBytes(bytes))) => {
                let key = PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|e| format!("invalid public key: {}", e))?;
                keys.push(key);
            }
            Some(Ok(Instruction::Op(op)))
                if (opcodes::all::OP_PUSHNUM_1.to_u8()..=opcodes::all::OP_PUSHNUM_16.to_u8())
                    .contains(&op.to_u8()) =>
            {
                break (op.to_u8() - opcodes::all::OP_PUSHNUM_1.to_u8() + 1) as usize;
            }
            _ => return Err("expected public key or key count".to_string()),
        }
    };

    if n != keys.len() {
        return Err(format!("key count {} does not match {} keys", n, keys.len()));
    }
    if m == 0 || m > n {
        return Err(format!("invalid threshold {} of {}", m, n));
    }
    match (instructions.next(), instructions.next()) {
        (Some(Ok(Instruction::Op(op))), None) if op == opcodes::all::OP_CHECKMULTISIG => {}
        _ => return Err("expected OP_CHECKMULTISIG".to_string()),
    }

    Ok((m, keys))
}

/// Signatures for `keys` present in `partial_sigs`, in script-key order.
fn ordered_signatures(
    keys: &[PublicKey],
    partial_sigs: &BTreeMap<PublicKey, ecdsa::Signature>,
) -> Vec<ecdsa::Signature> {
    keys.iter()
        .filter_map(|key| partial_sigs.get(key).cloned())
        .collect()
}

fn push_buf(bytes: Vec<u8>) -> Result<PushBytesBuf, Error> {
    PushBytesBuf::try_from(bytes).map_err(|e| FinalizeError::ScriptPush(e.to_string()).into())
}

enum FinalData {
    NotYet,
    ScriptSig(ScriptBuf),
    Witness {
        witness: Witness,
        script_sig: Option<ScriptBuf>,
    },
}

/// Try to assemble the final unlocking data for input `index`.
///
/// Returns `Ok(true)` when the input is (now) finalized and `Ok(false)` when
/// more signatures are needed. Hard errors are reserved for malformed or
/// missing script data.
pub fn try_finalize(psbt: &mut Psbt, index: usize) -> Result<bool, Error> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(ReferenceError::InputIndexOutOfBounds {
            index,
            inputs: psbt.inputs.len(),
        })?;
    if is_finalized(input) {
        return Ok(true);
    }

    let kind = sighash::classify(psbt, index)?;
    let (script_pubkey, _) = prevouts::resolve(psbt, index)?;
    let script_pubkey = script_pubkey.clone();
    let input = &psbt.inputs[index];

    let data = match kind {
        SpendKind::Legacy => match &input.redeem_script {
            Some(redeem_script) => {
                let (m, keys) = parse_multisig_script(redeem_script).map_err(|reason| {
                    FinalizeError::MalformedMultisigScript { index, reason }
                })?;
                let mut sigs = ordered_signatures(&keys, &input.partial_sigs);
                if sigs.len() < m {
                    FinalData::NotYet
                } else {
                    sigs.truncate(m);
                    // extra OP_0 consumed by the off-by-one in OP_CHECKMULTISIG
                    let mut builder = Builder::new().push_opcode(opcodes::OP_0);
                    for sig in &sigs {
                        builder = builder.push_slice(push_buf(sig.to_vec())?);
                    }
                    builder = builder.push_slice(push_buf(redeem_script.to_bytes())?);
                    FinalData::ScriptSig(builder.into_script())
                }
            }
            None => {
                if !script_pubkey.is_p2pkh() {
                    return Err(FinalizeError::UnsupportedScript { index }.into());
                }
                match input.partial_sigs.iter().next() {
                    None => FinalData::NotYet,
                    Some((public_key, signature)) => {
                        let script_sig = Builder::new()
                            .push_slice(push_buf(signature.to_vec())?)
                            .push_slice(push_buf(public_key.to_bytes())?)
                            .into_script();
                        FinalData::ScriptSig(script_sig)
                    }
                }
            }
        },
        SpendKind::SegwitV0 => {
            let (spend_script, nested_script_sig) = if script_pubkey.is_p2sh() {
                let redeem_script = input
                    .redeem_script
                    .clone()
                    .ok_or(ReferenceError::MissingRedeemScript { index })?;
                let script_sig = Builder::new()
                    .push_slice(push_buf(redeem_script.to_bytes())?)
                    .into_script();
                (redeem_script, Some(script_sig))
            } else {
                (script_pubkey.clone(), None)
            };

            if spend_script.is_p2wpkh() {
                match input.partial_sigs.iter().next() {
                    None => FinalData::NotYet,
                    Some((public_key, signature)) => {
                        let mut witness = Witness::new();
                        witness.push(signature.to_vec());
                        witness.push(public_key.to_bytes());
                        FinalData::Witness {
                            witness,
                            script_sig: nested_script_sig,
                        }
                    }
                }
            } else if spend_script.is_p2wsh() {
                let witness_script = input
                    .witness_script
                    .as_ref()
                    .ok_or(ReferenceError::MissingWitnessScript { index })?;
                let (m, keys) = parse_multisig_script(witness_script).map_err(|reason| {
                    FinalizeError::MalformedMultisigScript { index, reason }
                })?;
                let mut sigs = ordered_signatures(&keys, &input.partial_sigs);
                if sigs.len() < m {
                    FinalData::NotYet
                } else {
                    sigs.truncate(m);
                    let mut witness = Witness::new();
                    // empty element consumed by the off-by-one in OP_CHECKMULTISIG
                    witness.push([0u8; 0]);
                    for sig in &sigs {
                        witness.push(sig.to_vec());
                    }
                    witness.push(witness_script.to_bytes());
                    FinalData::Witness {
                        witness,
                        script_sig: nested_script_sig,
                    }
                }
            } else {
                return Err(FinalizeError::UnsupportedScript { index }.into());
            }
        }
        SpendKind::TaprootKeyPath => match input.tap_key_sig {
            None => FinalData::NotYet,
            Some(signature) => {
                let mut witness = Witness::new();
                witness.push(signature.to_vec());
                FinalData::Witness {
                    witness,
                    script_sig: None,
                }
            }
        },
        SpendKind::TaprootScriptPath => {
            let (control_block, (leaf_script, leaf_version)) = input
                .tap_scripts
                .iter()
                .next()
                .ok_or(FinalizeError::MissingControlBlock { index })?;
            let leaf_hash = TapLeafHash::from_script(leaf_script, *leaf_version);
            let signature = input
                .tap_script_sigs
                .iter()
                .find(|((_, hash), _)| *hash == leaf_hash)
                .map(|(_, signature)| *signature);
            match signature {
                None => FinalData::NotYet,
                Some(signature) => {
                    let mut witness = Witness::new();
                    witness.push(signature.to_vec());
                    witness.push(leaf_script.to_bytes());
                    witness.push(control_block.serialize());
                    FinalData::Witness {
                        witness,
                        script_sig: None,
                    }
                }
            }
        }
    };

    let input = &mut psbt.inputs[index];
    match data {
        FinalData::NotYet => return Ok(false),
        FinalData::ScriptSig(script_sig) => {
            input.final_script_sig = Some(script_sig);
        }
        FinalData::Witness {
            witness,
            script_sig,
        } => {
            input.final_script_witness = Some(witness);
            input.final_script_sig = script_sig;
        }
    }

    // final data replaces the signature metadata; the utxo fields stay for
    // fee accounting
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;

    tracing::debug!(input = index, kind = %kind, "finalized input");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        multisig_script, p2wpkh_script, single_input_psbt, test_signer,
    };
    use crate::{sighash, signer::KeySigner};
    use miniscript::bitcoin::Amount;

    fn sign_p2wsh_multisig(psbt: &mut Psbt, signer: &KeySigner) {
        let (message, sighash_type) = sighash::ecdsa_sighash(psbt, 0).unwrap();
        let signature = signer.sign_ecdsa(&message, sighash_type);
        psbt.inputs[0]
            .partial_sigs
            .insert(signer.public_key(), signature);
    }

    fn p2wsh_multisig_psbt(witness_script: &ScriptBuf) -> Psbt {
        let mut psbt = single_input_psbt(witness_script.to_p2wsh(), Amount::from_sat(50_000));
        psbt.inputs[0].witness_script = Some(witness_script.clone());
        psbt
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let signer = test_signer(1);
        let mut psbt = single_input_psbt(p2wpkh_script(&signer), Amount::from_sat(10_000));
        assert!(matches!(
            try_finalize(&mut psbt, 5).unwrap_err(),
            Error::Reference(ReferenceError::InputIndexOutOfBounds { index: 5, inputs: 1 })
        ));
    }

    #[test]
    fn parses_two_of_three() {
        let signers = [test_signer(1), test_signer(2), test_signer(3)];
        let script = multisig_script(2, &signers);
        let (m, keys) = parse_multisig_script(&script).unwrap();
        assert_eq!(m, 2);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], signers[0].public_key());
        assert_eq!(keys[2], signers[2].public_key());
    }

    #[test]
    fn rejects_non_multisig_scripts() {
        let signer = test_signer(1);
        assert!(parse_multisig_script(&p2wpkh_script(&signer)).is_err());
    }

    #[test]
    fn below_threshold_is_not_an_error() {
        let signers = [test_signer(1), test_signer(2), test_signer(3)];
        let script = multisig_script(2, &signers);
        let mut psbt = p2wsh_multisig_psbt(&script);

        sign_p2wsh_multisig(&mut psbt, &signers[0]);
        assert!(!try_finalize(&mut psbt, 0).unwrap());
        assert_eq!(input_state(&psbt.inputs[0]), InputState::PartiallySigned);
    }

    #[test]
    fn two_of_three_with_first_and_third_key() {
        let signers = [test_signer(1), test_signer(2), test_signer(3)];
        let script = multisig_script(2, &signers);
        let mut psbt = p2wsh_multisig_psbt(&script);

        // sign in reverse order; the witness must follow script key order
        sign_p2wsh_multisig(&mut psbt, &signers[2]);
        sign_p2wsh_multisig(&mut psbt, &signers[0]);
        assert!(try_finalize(&mut psbt, 0).unwrap());

        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        // empty element, two signatures, witness script
        assert_eq!(witness.len(), 4);
        assert_eq!(witness.nth(0).unwrap().len(), 0);
        assert_eq!(witness.nth(3).unwrap(), script.as_bytes());

        let sig_first = witness.nth(1).unwrap();
        let sig_third = witness.nth(2).unwrap();
        let expected_first = psbt_signature_bytes(&script, &signers[0]);
        let expected_third = psbt_signature_bytes(&script, &signers[2]);
        assert_eq!(sig_first, expected_first.as_slice());
        assert_eq!(sig_third, expected_third.as_slice());
    }

    // recompute the signature a signer would have produced over the fixture
    fn psbt_signature_bytes(script: &ScriptBuf, signer: &KeySigner) -> Vec<u8> {
        let mut psbt = p2wsh_multisig_psbt(script);
        sign_p2wsh_multisig(&mut psbt, signer);
        psbt.inputs[0]
            .partial_sigs
            .get(&signer.public_key())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn threshold_takes_exactly_m_signatures() {
        let signers = [test_signer(1), test_signer(2), test_signer(3)];
        let script = multisig_script(2, &signers);
        let mut psbt = p2wsh_multisig_psbt(&script);

        for signer in &signers {
            sign_p2wsh_multisig(&mut psbt, signer);
        }
        assert!(try_finalize(&mut psbt, 0).unwrap());
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
    }

    #[test]
    fn finalization_clears_signature_metadata() {
        let signers = [test_signer(1), test_signer(2), test_signer(3)];
        let script = multisig_script(2, &signers);
        let mut psbt = p2wsh_multisig_psbt(&script);

        sign_p2wsh_multisig(&mut psbt, &signers[0]);
        sign_p2wsh_multisig(&mut psbt, &signers[1]);
        assert!(try_finalize(&mut psbt, 0).unwrap());

        let input = &psbt.inputs[0];
        assert!(input.partial_sigs.is_empty());
        assert!(input.witness_script.is_none());
        assert!(input.witness_utxo.is_some());
        assert_eq!(input_state(input), InputState::Finalized);

        // idempotent
        assert!(try_finalize(&mut psbt, 0).unwrap());
    }
}
