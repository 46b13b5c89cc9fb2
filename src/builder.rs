//! The transaction-building session: skeleton creation, metadata
//! attachment, signing, finalization and extraction, all over a single
//! owned PSBT. The PSBT hex round-trip is the only persistable state; the
//! descriptors and signers fed into a session are transient.

use miniscript::bitcoin::absolute::LockTime;
use miniscript::bitcoin::consensus::encode;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::script::Instruction;
use miniscript::bitcoin::secp256k1::Secp256k1;
use miniscript::bitcoin::taproot::LeafVersion;
use miniscript::bitcoin::transaction::Version;
use miniscript::bitcoin::{
    opcodes, Address, Network, ScriptBuf, Sequence, TapLeafHash, Transaction, TxIn, TxOut,
    Witness, XOnlyPublicKey,
};
use serde::Serialize;
use tracing::debug;

use crate::descriptor::{TxInput, TxOutput, UtxoDescriptor};
use crate::error::{CodecError, DecodeError, Error, FinalizeError, ReferenceError, SignatureError};
use crate::fee::Dimensions;
use crate::finalize::{self, InputState};
use crate::prevouts;
use crate::sighash::{self, SpendKind};
use crate::signer::KeySigner;

/// Builds, signs and finalizes one transaction.
#[derive(Debug)]
pub struct PsbtBuilder {
    network: Network,
    psbt: Psbt,
}

impl PsbtBuilder {
    /// Create a version-2, locktime-0 transaction skeleton. Inputs default
    /// to the maximum sequence unless a descriptor overrides it; outputs are
    /// given as a raw script or an address for `network`.
    pub fn new(network: Network, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<Self, Error> {
        let tx_inputs = inputs
            .iter()
            .map(build_tx_input)
            .collect::<Result<Vec<_>, Error>>()?;
        let tx_outputs = outputs
            .iter()
            .map(|output| build_tx_output(output, network))
            .collect::<Result<Vec<_>, Error>>()?;

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };
        let psbt = Psbt::from_unsigned_tx(unsigned_tx).map_err(CodecError::Psbt)?;
        debug!(
            inputs = psbt.inputs.len(),
            outputs = psbt.outputs.len(),
            "created signing session"
        );
        Ok(PsbtBuilder { network, psbt })
    }

    /// Restore a session from PSBT hex (the persistence round-trip)
    pub fn from_hex(network: Network, psbt_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(psbt_hex).map_err(CodecError::Hex)?;
        let psbt = Psbt::deserialize(&bytes).map_err(CodecError::Psbt)?;
        Ok(PsbtBuilder { network, psbt })
    }

    /// Serialize the session as PSBT hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.psbt.serialize())
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn input_count(&self) -> usize {
        self.psbt.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.psbt.outputs.len()
    }

    pub fn input_state(&self, index: usize) -> Result<InputState, Error> {
        let input = self
            .psbt
            .inputs
            .get(index)
            .ok_or(ReferenceError::InputIndexOutOfBounds {
                index,
                inputs: self.psbt.inputs.len(),
            })?;
        Ok(finalize::input_state(input))
    }

    /// Whether every input carries final unlocking data
    pub fn is_complete(&self) -> bool {
        self.psbt.inputs.iter().all(finalize::is_finalized)
    }

    // Taproot digests commit to all inputs and outputs, so growing the
    // skeleton under an existing taproot signature would silently invalidate
    // it. Refuse instead.
    fn check_appendable(&self) -> Result<(), Error> {
        for input in &self.psbt.inputs {
            let finalized_taproot = finalize::is_finalized(input)
                && input
                    .witness_utxo
                    .as_ref()
                    .is_some_and(|utxo| utxo.script_pubkey.is_p2tr());
            if input.tap_key_sig.is_some()
                || !input.tap_script_sigs.is_empty()
                || finalized_taproot
            {
                return Err(ReferenceError::WouldInvalidateSignatures.into());
            }
        }
        Ok(())
    }

    /// Append an input to the skeleton, with empty metadata
    pub fn append_input(&mut self, input: &TxInput) -> Result<(), Error> {
        self.check_appendable()?;
        let tx_input = build_tx_input(input)?;
        self.psbt.unsigned_tx.input.push(tx_input);
        self.psbt.inputs.push(Default::default());
        Ok(())
    }

    /// Append an output to the skeleton
    pub fn append_output(&mut self, output: &TxOutput) -> Result<(), Error> {
        self.check_appendable()?;
        let tx_output = build_tx_output(output, self.network)?;
        self.psbt.unsigned_tx.output.push(tx_output);
        self.psbt.outputs.push(Default::default());
        Ok(())
    }

    /// Attach previous-output data and per-path scripts to input `index`.
    ///
    /// The descriptor is validated against the skeleton before anything is
    /// stored: a full previous transaction must hash to the referenced
    /// txid, redeem/witness scripts must hash to the scripts that commit to
    /// them, and a control block must prove its leaf.
    pub fn attach_utxo(&mut self, index: usize, descriptor: UtxoDescriptor) -> Result<(), Error> {
        let inputs = self.psbt.inputs.len();
        if index >= inputs {
            return Err(ReferenceError::InputIndexOutOfBounds { index, inputs }.into());
        }
        if finalize::is_finalized(&self.psbt.inputs[index]) {
            return Err(ReferenceError::InputAlreadyFinalized { index }.into());
        }
        let outpoint = self.psbt.unsigned_tx.input[index].previous_output;

        match descriptor {
            UtxoDescriptor::Legacy {
                prev_tx,
                redeem_script,
                sighash_type,
            } => {
                let txid = prev_tx.compute_txid();
                if txid != outpoint.txid {
                    return Err(ReferenceError::PrevTxMismatch {
                        index,
                        expected: outpoint.txid,
                        actual: txid,
                    }
                    .into());
                }
                let prev_output = prev_tx.output.get(outpoint.vout as usize).ok_or(
                    ReferenceError::OutputIndexOutOfBounds {
                        vout: outpoint.vout,
                    },
                )?;
                if let Some(redeem_script) = &redeem_script {
                    if redeem_script.to_p2sh() != prev_output.script_pubkey {
                        return Err(ReferenceError::RedeemScriptMismatch { index }.into());
                    }
                }
                let input = &mut self.psbt.inputs[index];
                input.non_witness_utxo = Some(prev_tx);
                input.redeem_script = redeem_script;
                input.sighash_type = Some(sighash_type.into());
            }
            UtxoDescriptor::SegwitV0 {
                script_pubkey,
                amount,
                redeem_script,
                witness_script,
                sighash_type,
            } => {
                let spend_script = if script_pubkey.is_p2sh() {
                    let redeem_script = redeem_script
                        .as_ref()
                        .ok_or(ReferenceError::MissingRedeemScript { index })?;
                    if redeem_script.to_p2sh() != script_pubkey {
                        return Err(ReferenceError::RedeemScriptMismatch { index }.into());
                    }
                    redeem_script.clone()
                } else {
                    script_pubkey.clone()
                };
                if spend_script.is_p2wsh() {
                    let witness_script = witness_script
                        .as_ref()
                        .ok_or(ReferenceError::MissingWitnessScript { index })?;
                    if witness_script.to_p2wsh() != spend_script {
                        return Err(ReferenceError::WitnessScriptMismatch { index }.into());
                    }
                } else if !spend_script.is_p2wpkh() {
                    return Err(SignatureError::UnsupportedScript { index }.into());
                }
                let input = &mut self.psbt.inputs[index];
                input.witness_utxo = Some(TxOut {
                    value: amount,
                    script_pubkey,
                });
                input.redeem_script = redeem_script;
                input.witness_script = witness_script;
                input.sighash_type = Some(sighash_type.into());
            }
            UtxoDescriptor::TaprootKeyPath {
                script_pubkey,
                amount,
                sighash_type,
            } => {
                if !script_pubkey.is_p2tr() {
                    return Err(SignatureError::UnsupportedScript { index }.into());
                }
                let input = &mut self.psbt.inputs[index];
                input.witness_utxo = Some(TxOut {
                    value: amount,
                    script_pubkey,
                });
                input.sighash_type = Some(sighash_type.into());
            }
            UtxoDescriptor::TaprootScriptPath {
                script_pubkey,
                amount,
                leaf_script,
                control_block,
                sighash_type,
            } => {
                if !script_pubkey.is_p2tr() {
                    return Err(SignatureError::UnsupportedScript { index }.into());
                }
                let output_key = sighash::taproot_output_key(&script_pubkey)?;
                let secp = Secp256k1::verification_only();
                if !control_block.verify_taproot_commitment(&secp, output_key, &leaf_script) {
                    return Err(DecodeError::InvalidControlBlock(
                        "control block does not commit to the leaf script".to_string(),
                    )
                    .into());
                }
                let input = &mut self.psbt.inputs[index];
                input.witness_utxo = Some(TxOut {
                    value: amount,
                    script_pubkey,
                });
                input.tap_internal_key = Some(control_block.internal_key);
                input
                    .tap_scripts
                    .insert(control_block, (leaf_script, LeafVersion::TapScript));
                input.sighash_type = Some(sighash_type.into());
            }
        }
        debug!(input = index, "attached utxo metadata");
        Ok(())
    }

    fn sign_input_inner(&mut self, index: usize, signer: &KeySigner) -> Result<(), Error> {
        let kind = sighash::classify(&self.psbt, index)?;
        if finalize::is_finalized(&self.psbt.inputs[index]) {
            return Err(ReferenceError::InputAlreadyFinalized { index }.into());
        }

        match kind {
            SpendKind::Legacy => {
                let (script_pubkey, _) = prevouts::resolve(&self.psbt, index)?;
                match &self.psbt.inputs[index].redeem_script {
                    Some(redeem_script) => {
                        ensure_key_in_multisig(redeem_script, signer, index)?;
                    }
                    None => {
                        let expected =
                            ScriptBuf::new_p2pkh(&signer.public_key().pubkey_hash());
                        if *script_pubkey != expected {
                            return Err(SignatureError::KeyMismatch { index }.into());
                        }
                    }
                }
                let (message, sighash_type) = sighash::ecdsa_sighash(&self.psbt, index)?;
                let signature = signer.sign_ecdsa(&message, sighash_type);
                self.psbt.inputs[index]
                    .partial_sigs
                    .insert(signer.public_key(), signature);
            }
            SpendKind::SegwitV0 => {
                let (script_pubkey, _) = prevouts::resolve(&self.psbt, index)?;
                let input = &self.psbt.inputs[index];
                let spend_script = if script_pubkey.is_p2sh() {
                    input
                        .redeem_script
                        .clone()
                        .ok_or(ReferenceError::MissingRedeemScript { index })?
                } else {
                    script_pubkey.clone()
                };
                if spend_script.is_p2wpkh() {
                    let expected = ScriptBuf::new_p2wpkh(
                        &signer.compressed_public_key().wpubkey_hash(),
                    );
                    if spend_script != expected {
                        return Err(SignatureError::KeyMismatch { index }.into());
                    }
                } else if let Some(witness_script) = &input.witness_script {
                    ensure_key_in_multisig(witness_script, signer, index)?;
                }
                let (message, sighash_type) = sighash::ecdsa_sighash(&self.psbt, index)?;
                let signature = signer.sign_ecdsa(&message, sighash_type);
                self.psbt.inputs[index]
                    .partial_sigs
                    .insert(signer.public_key(), signature);
            }
            SpendKind::TaprootKeyPath => {
                let merkle_root = self.psbt.inputs[index].tap_merkle_root;
                let (script_pubkey, _) = prevouts::resolve(&self.psbt, index)?;
                let expected = ScriptBuf::new_p2tr(
                    signer.secp(),
                    signer.x_only_public_key(),
                    merkle_root,
                );
                if *script_pubkey != expected {
                    return Err(SignatureError::KeyMismatch { index }.into());
                }
                let (message, sighash_type) = sighash::taproot_sighash(&self.psbt, index, None)?;
                let signature = signer.sign_schnorr_tweaked(&message, sighash_type, merkle_root);
                let input = &mut self.psbt.inputs[index];
                input.tap_key_sig = Some(signature);
                input.tap_internal_key = Some(signer.x_only_public_key());
            }
            SpendKind::TaprootScriptPath => {
                let (leaf_hash, leaf_script) = {
                    let input = &self.psbt.inputs[index];
                    let (_, (leaf_script, leaf_version)) = input
                        .tap_scripts
                        .iter()
                        .next()
                        .ok_or(FinalizeError::MissingControlBlock { index })?;
                    (
                        TapLeafHash::from_script(leaf_script, *leaf_version),
                        leaf_script.clone(),
                    )
                };
                ensure_key_in_leaf(&leaf_script, &signer.x_only_public_key(), index)?;
                let (message, sighash_type) =
                    sighash::taproot_sighash(&self.psbt, index, Some(leaf_hash))?;
                let signature = signer.sign_schnorr(&message, sighash_type);
                self.psbt.inputs[index]
                    .tap_script_sigs
                    .insert((signer.x_only_public_key(), leaf_hash), signature);
            }
        }

        debug!(input = index, kind = %kind, "signed input");
        Ok(())
    }

    /// Sign input `index` and finalize it if its unlocking data is complete
    pub fn sign_input(&mut self, index: usize, signer: &KeySigner) -> Result<(), Error> {
        self.sign_input_inner(index, signer)?;
        finalize::try_finalize(&mut self.psbt, index)?;
        Ok(())
    }

    /// Sign a batch of inputs, failing fast with the index of the first
    /// failure. Inputs signed before the failure keep their signatures.
    pub fn sign_inputs(&mut self, requests: &[(usize, &KeySigner)]) -> Result<(), Error> {
        for (index, signer) in requests {
            self.sign_input(*index, signer)
                .map_err(|error| Error::at_input(*index, error))?;
        }
        Ok(())
    }

    /// Add one signature to a multisig input. Returns whether the input
    /// reached its threshold and was finalized.
    pub fn multisig_sign_input(
        &mut self,
        index: usize,
        signer: &KeySigner,
    ) -> Result<bool, Error> {
        self.sign_input_inner(index, signer)?;
        finalize::try_finalize(&mut self.psbt, index)
    }

    /// Finalize everything finalizable, then extract the raw transaction.
    /// Fails naming the first input still missing unlocking data.
    pub fn extract_tx(&mut self) -> Result<Transaction, Error> {
        for index in 0..self.psbt.inputs.len() {
            finalize::try_finalize(&mut self.psbt, index)?;
        }

        let mut tx = self.psbt.unsigned_tx.clone();
        for (index, (tx_input, input)) in
            tx.input.iter_mut().zip(self.psbt.inputs.iter()).enumerate()
        {
            if !finalize::is_finalized(input) {
                return Err(FinalizeError::IncompleteSigning { index }.into());
            }
            tx_input.script_sig = input.final_script_sig.clone().unwrap_or_default();
            tx_input.witness = input
                .final_script_witness
                .clone()
                .unwrap_or_else(Witness::new);
        }
        debug!(txid = %tx.compute_txid(), "extracted final transaction");
        Ok(tx)
    }

    /// Extract the raw transaction as consensus hex
    pub fn extract_tx_hex(&mut self) -> Result<String, Error> {
        Ok(encode::serialize_hex(&self.extract_tx()?))
    }

    /// Upper-bound virtual size from the attached metadata
    pub fn estimate_vsize(&self) -> Result<u64, Error> {
        Ok(Dimensions::from_psbt(&self.psbt)?.vsize_max())
    }

    /// Fee for the upper-bound virtual size at `fee_rate` sat/vbyte plus
    /// `extra_bytes` charged at the same rate
    pub fn estimate_fee(&self, fee_rate: u64, extra_bytes: u64) -> Result<u64, Error> {
        Ok(Dimensions::from_psbt(&self.psbt)?.fee(fee_rate, extra_bytes))
    }

    /// Human-readable summary of the session (best effort: fields that need
    /// metadata not yet attached come back empty)
    pub fn summary(&self) -> TxSummary {
        let mut input_total: Option<u64> = Some(0);
        let inputs = (0..self.psbt.inputs.len())
            .map(|index| {
                let outpoint = self.psbt.unsigned_tx.input[index].previous_output;
                let resolved = prevouts::resolve(&self.psbt, index).ok();
                let value = resolved.map(|(_, amount)| amount.to_sat());
                input_total = match (input_total, value) {
                    (Some(total), Some(value)) => Some(total + value),
                    _ => None,
                };
                InputSummary {
                    outpoint: outpoint.to_string(),
                    address: resolved.and_then(|(script, _)| {
                        Address::from_script(script, self.network)
                            .ok()
                            .map(|address| address.to_string())
                    }),
                    value,
                    spend_kind: sighash::classify(&self.psbt, index)
                        .ok()
                        .map(|kind| kind.to_string()),
                    state: finalize::input_state(&self.psbt.inputs[index]).to_string(),
                }
            })
            .collect();

        let outputs: Vec<OutputSummary> = self
            .psbt
            .unsigned_tx
            .output
            .iter()
            .map(|output| OutputSummary {
                address: Address::from_script(&output.script_pubkey, self.network)
                    .ok()
                    .map(|address| address.to_string()),
                script: hex::encode(output.script_pubkey.as_bytes()),
                value: output.value.to_sat(),
            })
            .collect();

        let output_total: u64 = outputs.iter().map(|output| output.value).sum();
        let fee = input_total.map(|total| total.saturating_sub(output_total));
        let dimensions = Dimensions::from_psbt(&self.psbt).ok();

        TxSummary {
            inputs,
            outputs,
            fee,
            vsize_min: dimensions.map(|dimensions| dimensions.vsize_min()),
            vsize_max: dimensions.map(|dimensions| dimensions.vsize_max()),
        }
    }
}

fn build_tx_input(input: &TxInput) -> Result<TxIn, Error> {
    Ok(TxIn {
        previous_output: input.outpoint()?,
        script_sig: ScriptBuf::new(),
        sequence: input.sequence.map(Sequence).unwrap_or(Sequence::MAX),
        witness: Witness::default(),
    })
}

fn build_tx_output(output: &TxOutput, network: Network) -> Result<TxOut, Error> {
    Ok(TxOut {
        value: output.amount(),
        script_pubkey: output.script_pubkey(network)?,
    })
}

fn ensure_key_in_multisig(
    script: &ScriptBuf,
    signer: &KeySigner,
    index: usize,
) -> Result<(), Error> {
    if let Ok((_, keys)) = finalize::parse_multisig_script(script) {
        if !keys.contains(&signer.public_key()) {
            return Err(SignatureError::KeyMismatch { index }.into());
        }
    }
    Ok(())
}

// Recognizes the single-key `<xonly> OP_CHECKSIG` leaf shape and rejects a
// signer whose key is not the one in the leaf. Other leaf scripts are signed
// as requested.
fn ensure_key_in_leaf(
    leaf_script: &ScriptBuf,
    key: &XOnlyPublicKey,
    index: usize,
) -> Result<(), Error> {
    let mut instructions = leaf_script.instructions();
    if let (
        Some(Ok(Instruction::PushBytes(bytes))),
        Some(Ok(Instruction::Op(op))),
        None,
    ) = (instructions.next(), instructions.next(), instructions.next())
    {
        if bytes.len() == 32
            && op == opcodes::all::OP_CHECKSIG
            && bytes.as_bytes() != key.serialize().as_slice()
        {
            return Err(SignatureError::KeyMismatch { index }.into());
        }
    }
    Ok(())
}

/// Per-input line of a transaction summary.
#[derive(Debug, Clone, Serialize)]
pub struct InputSummary {
    pub outpoint: String,
    pub address: Option<String>,
    pub value: Option<u64>,
    pub spend_kind: Option<String>,
    pub state: String,
}

/// Per-output line of a transaction summary.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub address: Option<String>,
    pub script: String,
    pub value: u64,
}

/// Session summary for inspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct TxSummary {
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
    /// Implied fee (inputs minus outputs); unknown until every input has
    /// its previous output attached
    pub fee: Option<u64>,
    pub vsize_min: Option<u64>,
    pub vsize_max: Option<u64>,
}
