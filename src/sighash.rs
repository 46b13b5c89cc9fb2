//! Signature-digest selection for the four spend families.
//!
//! The bit-exact hashing (legacy double-SHA over the blanked transaction,
//! BIP143, BIP341/342 tagged hashes) is delegated to
//! `bitcoin::sighash::SighashCache`; this module owns what the engine is
//! responsible for: classifying the spend path, deriving the script code,
//! binding the right prevouts, and the sighash-flag policy.
//!
//! One deliberate divergence from historical consensus behavior:
//! SIGHASH_SINGLE on an input with no output at the same index is a hard
//! error for every algorithm variant, never the `0x01` digest quirk.

use miniscript::bitcoin::hashes::Hash;
use miniscript::bitcoin::psbt::{Input, Psbt};
use miniscript::bitcoin::secp256k1::Message;
use miniscript::bitcoin::sighash::{Prevouts, SighashCache};
use miniscript::bitcoin::{
    EcdsaSighashType, Script, TapLeafHash, TapSighashType, XOnlyPublicKey,
};

use crate::error::{DecodeError, Error, ReferenceError, SignatureError};
use crate::prevouts;

/// The spend family of a PSBT input, derived from its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendKind {
    Legacy,
    SegwitV0,
    TaprootKeyPath,
    TaprootScriptPath,
}

impl std::fmt::Display for SpendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpendKind::Legacy => "legacy",
            SpendKind::SegwitV0 => "segwitV0",
            SpendKind::TaprootKeyPath => "taprootKeyPath",
            SpendKind::TaprootScriptPath => "taprootScriptPath",
        };
        write!(f, "{}", name)
    }
}

/// Classify input `index` by its previous-output source and taproot fields.
pub fn classify(psbt: &Psbt, index: usize) -> Result<SpendKind, Error> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(ReferenceError::InputIndexOutOfBounds {
            index,
            inputs: psbt.inputs.len(),
        })?;

    match (&input.witness_utxo, &input.non_witness_utxo) {
        (Some(_), Some(_)) => Err(ReferenceError::BothUtxoFieldsSet { index }.into()),
        (None, None) => Err(ReferenceError::NoUtxoFields { index }.into()),
        (None, Some(_)) => Ok(SpendKind::Legacy),
        (Some(utxo), None) => {
            if utxo.script_pubkey.is_p2tr() {
                if input.tap_scripts.is_empty() {
                    Ok(SpendKind::TaprootKeyPath)
                } else {
                    Ok(SpendKind::TaprootScriptPath)
                }
            } else {
                Ok(SpendKind::SegwitV0)
            }
        }
    }
}

/// Sighash flag for an ECDSA input, defaulting to ALL
pub fn ecdsa_sighash_type(input: &Input) -> Result<EcdsaSighashType, Error> {
    match input.sighash_type {
        None => Ok(EcdsaSighashType::All),
        Some(ty) => ty
            .ecdsa_hash_ty()
            .map_err(|e| SignatureError::Sighash(e.to_string()).into()),
    }
}

/// Sighash flag for a taproot input, defaulting to DEFAULT
pub fn taproot_sighash_type(input: &Input) -> Result<TapSighashType, Error> {
    match input.sighash_type {
        None => Ok(TapSighashType::Default),
        Some(ty) => ty
            .taproot_hash_ty()
            .map_err(|e| SignatureError::Sighash(e.to_string()).into()),
    }
}

/// Extract the 32-byte output key committed in a p2tr output script
pub(crate) fn taproot_output_key(script_pubkey: &Script) -> Result<XOnlyPublicKey, Error> {
    XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..])
        .map_err(|e| DecodeError::InvalidKey(e).into())
}

fn ensure_single_has_output(is_single: bool, index: usize, psbt: &Psbt) -> Result<(), Error> {
    let outputs = psbt.unsigned_tx.output.len();
    if is_single && index >= outputs {
        return Err(ReferenceError::SingleNoMatchingOutput { index, outputs }.into());
    }
    Ok(())
}

/// Compute the ECDSA digest for a legacy or segwit-v0 input.
///
/// Script-code selection: the redeem script for p2sh, the witness script for
/// p2wsh, and the spent output script otherwise (p2wpkh expands to its
/// implicit p2pkh-style script code inside the cache).
pub fn ecdsa_sighash(psbt: &Psbt, index: usize) -> Result<(Message, EcdsaSighashType), Error> {
    let kind = classify(psbt, index)?;
    let input = &psbt.inputs[index];
    let sighash_type = ecdsa_sighash_type(input)?;
    ensure_single_has_output(
        matches!(
            sighash_type,
            EcdsaSighashType::Single | EcdsaSighashType::SinglePlusAnyoneCanPay
        ),
        index,
        psbt,
    )?;

    let (script_pubkey, amount) = prevouts::resolve(psbt, index)?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    let digest = match kind {
        SpendKind::Legacy => {
            let script_code = input.redeem_script.as_deref().unwrap_or(script_pubkey);
            cache
                .legacy_signature_hash(index, script_code, sighash_type.to_u32())
                .map_err(|e| SignatureError::Sighash(e.to_string()))?
                .to_byte_array()
        }
        SpendKind::SegwitV0 => {
            let spend_script: &Script = if script_pubkey.is_p2sh() {
                input
                    .redeem_script
                    .as_deref()
                    .ok_or(ReferenceError::MissingRedeemScript { index })?
            } else {
                script_pubkey
            };
            if spend_script.is_p2wpkh() {
                cache
                    .p2wpkh_signature_hash(index, spend_script, amount, sighash_type)
                    .map_err(|e| SignatureError::Sighash(e.to_string()))?
                    .to_byte_array()
            } else if spend_script.is_p2wsh() {
                let witness_script = input
                    .witness_script
                    .as_deref()
                    .ok_or(ReferenceError::MissingWitnessScript { index })?;
                cache
                    .p2wsh_signature_hash(index, witness_script, amount, sighash_type)
                    .map_err(|e| SignatureError::Sighash(e.to_string()))?
                    .to_byte_array()
            } else {
                return Err(SignatureError::UnsupportedScript { index }.into());
            }
        }
        SpendKind::TaprootKeyPath | SpendKind::TaprootScriptPath => {
            return Err(SignatureError::UnsupportedScript { index }.into());
        }
    };

    Ok((Message::from_digest(digest), sighash_type))
}

/// Compute the schnorr digest for a taproot input.
///
/// `leaf_hash` selects the BIP342 script-path digest; `None` selects the
/// BIP341 key-path digest. Both commit to every input's amount and script,
/// so all prevouts are resolved and bound.
pub fn taproot_sighash(
    psbt: &Psbt,
    index: usize,
    leaf_hash: Option<TapLeafHash>,
) -> Result<(Message, TapSighashType), Error> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(ReferenceError::InputIndexOutOfBounds {
            index,
            inputs: psbt.inputs.len(),
        })?;
    let sighash_type = taproot_sighash_type(input)?;
    ensure_single_has_output(
        matches!(
            sighash_type,
            TapSighashType::Single | TapSighashType::SinglePlusAnyoneCanPay
        ),
        index,
        psbt,
    )?;

    let prevouts = prevouts::collect(psbt)?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let digest = match leaf_hash {
        None => cache
            .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), sighash_type)
            .map_err(|e| SignatureError::Sighash(e.to_string()))?
            .to_byte_array(),
        Some(leaf_hash) => cache
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                leaf_hash,
                sighash_type,
            )
            .map_err(|e| SignatureError::Sighash(e.to_string()))?
            .to_byte_array(),
    };

    Ok((Message::from_digest(digest), sighash_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        p2tr_key_script, p2wpkh_script, single_input_psbt, test_signer, two_input_psbt,
    };
    use miniscript::bitcoin::psbt::PsbtSighashType;
    use miniscript::bitcoin::Amount;
    use rstest::rstest;

    #[test]
    fn classify_distinguishes_spend_kinds() {
        let signer = test_signer(1);
        let mut psbt = single_input_psbt(p2wpkh_script(&signer), Amount::from_sat(10_000));
        assert_eq!(classify(&psbt, 0).unwrap(), SpendKind::SegwitV0);

        psbt.inputs[0].witness_utxo.as_mut().unwrap().script_pubkey =
            p2tr_key_script(&signer);
        assert_eq!(classify(&psbt, 0).unwrap(), SpendKind::TaprootKeyPath);
    }

    #[test]
    fn digest_is_deterministic() {
        let signer = test_signer(1);
        let psbt = single_input_psbt(p2wpkh_script(&signer), Amount::from_sat(10_000));
        let (a, _) = ecdsa_sighash(&psbt, 0).unwrap();
        let (b, _) = ecdsa_sighash(&psbt, 0).unwrap();
        assert_eq!(a, b);
    }

    #[rstest]
    #[case(EcdsaSighashType::Single)]
    #[case(EcdsaSighashType::SinglePlusAnyoneCanPay)]
    fn single_with_no_matching_output_fails(#[case] sighash_type: EcdsaSighashType) {
        let signer = test_signer(1);
        let script = p2wpkh_script(&signer);
        // two inputs, two outputs, then drop the second output so input 1
        // has no output at its own index
        let mut psbt = two_input_psbt(
            script.clone(),
            Amount::from_sat(10_000),
            script,
            Amount::from_sat(20_000),
        );
        psbt.unsigned_tx.output.truncate(1);
        psbt.inputs[1].sighash_type = Some(PsbtSighashType::from(sighash_type));

        assert!(matches!(
            ecdsa_sighash(&psbt, 1).unwrap_err(),
            Error::Reference(ReferenceError::SingleNoMatchingOutput {
                index: 1,
                outputs: 1
            })
        ));
    }

    #[test]
    fn taproot_single_with_no_matching_output_fails() {
        let signer = test_signer(1);
        let script = p2tr_key_script(&signer);
        let mut psbt = two_input_psbt(
            script.clone(),
            Amount::from_sat(10_000),
            script,
            Amount::from_sat(20_000),
        );
        psbt.unsigned_tx.output.truncate(1);
        psbt.inputs[1].sighash_type = Some(PsbtSighashType::from(TapSighashType::Single));

        assert!(matches!(
            taproot_sighash(&psbt, 1, None).unwrap_err(),
            Error::Reference(ReferenceError::SingleNoMatchingOutput { index: 1, .. })
        ));
    }

    #[test]
    fn single_anyonecanpay_ignores_unrelated_outputs_and_inputs() {
        let signer = test_signer(1);
        let script = p2wpkh_script(&signer);
        let mut psbt = two_input_psbt(
            script.clone(),
            Amount::from_sat(10_000),
            script,
            Amount::from_sat(20_000),
        );
        psbt.inputs[0].sighash_type =
            Some(PsbtSighashType::from(EcdsaSighashType::SinglePlusAnyoneCanPay));

        let (before, _) = ecdsa_sighash(&psbt, 0).unwrap();

        // unrelated output and input changes leave the digest alone
        psbt.unsigned_tx.output[1].value = Amount::from_sat(1);
        psbt.unsigned_tx.input[1].previous_output.vout = 9;
        let (after_unrelated, _) = ecdsa_sighash(&psbt, 0).unwrap();
        assert_eq!(before, after_unrelated);

        // the paired output is committed
        psbt.unsigned_tx.output[0].value = Amount::from_sat(1);
        let (after_paired, _) = ecdsa_sighash(&psbt, 0).unwrap();
        assert_ne!(before, after_paired);
    }

    #[test]
    fn taproot_digest_commits_to_all_input_amounts() {
        let signer = test_signer(1);
        let script = p2tr_key_script(&signer);
        let mut psbt = two_input_psbt(
            script.clone(),
            Amount::from_sat(10_000),
            script,
            Amount::from_sat(20_000),
        );

        let (before, _) = taproot_sighash(&psbt, 0, None).unwrap();
        psbt.inputs[1].witness_utxo.as_mut().unwrap().value = Amount::from_sat(21_000);
        let (after, _) = taproot_sighash(&psbt, 0, None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn taproot_digest_commits_to_all_input_scripts() {
        let signer = test_signer(1);
        let other = test_signer(2);
        let script = p2tr_key_script(&signer);
        let mut psbt = two_input_psbt(
            script.clone(),
            Amount::from_sat(10_000),
            script,
            Amount::from_sat(20_000),
        );

        let (before, _) = taproot_sighash(&psbt, 0, None).unwrap();
        psbt.inputs[1].witness_utxo.as_mut().unwrap().script_pubkey = p2tr_key_script(&other);
        let (after, _) = taproot_sighash(&psbt, 0, None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn leaf_hash_changes_the_digest() {
        let signer = test_signer(1);
        let script = p2tr_key_script(&signer);
        let psbt = single_input_psbt(script, Amount::from_sat(10_000));

        let leaf = miniscript::bitcoin::ScriptBuf::from_hex("51").unwrap();
        let leaf_hash = TapLeafHash::from_script(
            &leaf,
            miniscript::bitcoin::taproot::LeafVersion::TapScript,
        );
        let (key_path, _) = taproot_sighash(&psbt, 0, None).unwrap();
        let (script_path, _) = taproot_sighash(&psbt, 0, Some(leaf_hash)).unwrap();
        assert_ne!(key_path, script_path);
    }
}
