//! Weight-based virtual-size and fee estimation.
//!
//! Placeholder unlocking data stands in for the signatures that do not
//! exist yet: DER signatures vary between 71 and 73 bytes, so input weight
//! is tracked as a min/max pair; schnorr signatures are a fixed 64 bytes.
//! Weight = 3 x stripped size + total size, vsize = ceil(weight / 4).

use miniscript::bitcoin::psbt::{Input, Psbt};
use miniscript::bitcoin::{Script, VarInt};

use crate::error::{Error, FinalizeError, ReferenceError};
use crate::finalize::parse_multisig_script;
use crate::prevouts;
use crate::sighash::{self, SpendKind};

// ECDSA signature sizes (DER encoding variance, sighash byte included)
const ECDSA_SIG_MIN: usize = 71;
const ECDSA_SIG_MAX: usize = 73;

// Schnorr signature (sighash byte only when non-default)
const SCHNORR_SIG: usize = 64;

const PUBKEY_SIZE: usize = 33;
const OP_PUSH_SIZE: usize = 1;

// version(4) + locktime(4) + varint for ins(1) + varint for outs(1)
const TX_OVERHEAD_SIZE: usize = 10;
// marker(1) + flag(1), counted in the total size only
const SEGWIT_MARKER_FLAG_SIZE: usize = 2;

/// Size of a length-prefixed slice (varint + data)
fn var_slice_size(length: usize) -> usize {
    VarInt::from(length).size() + length
}

/// Size of a witness stack from its element lengths
fn vector_size(element_lengths: &[usize]) -> usize {
    VarInt::from(element_lengths.len()).size()
        + element_lengths
            .iter()
            .map(|&len| var_slice_size(len))
            .sum::<usize>()
}

/// Size of a script push for `length` bytes of data
fn script_push_size(length: usize) -> usize {
    if length < 76 {
        1 + length
    } else if length <= 0xff {
        2 + length
    } else {
        3 + length
    }
}

/// Input weight from scriptSig and witness component lengths.
/// Weight = 3 * base + (base + witness); witness bytes count once.
fn compute_input_weight(script_components: &[usize], witness_components: &[usize]) -> usize {
    let script_length: usize = script_components.iter().sum();
    // prevout(32) + index(4) + sequence(4) + scriptSig
    let base_size = 40 + var_slice_size(script_length);
    let witness_size = if witness_components.is_empty() {
        0
    } else {
        vector_size(witness_components)
    };
    3 * base_size + base_size + witness_size
}

/// Output weight = 4 * (8-byte value + varint + script)
fn compute_output_weight(script_length: usize) -> usize {
    4 * (8 + var_slice_size(script_length))
}

struct InputWeights {
    min: usize,
    max: usize,
    is_segwit: bool,
}

fn schnorr_sig_size(input: &Input) -> usize {
    // sighash byte is appended only for non-default flags
    match input.sighash_type {
        Some(ty) if ty.to_u32() != 0 => SCHNORR_SIG + 1,
        _ => SCHNORR_SIG,
    }
}

fn multisig_script_components(sig_size: usize, m: usize, script: &Script) -> Vec<usize> {
    let mut components = vec![OP_PUSH_SIZE];
    components.extend(std::iter::repeat(OP_PUSH_SIZE + sig_size).take(m));
    components.push(script_push_size(script.len()));
    components
}

fn multisig_witness_components(sig_size: usize, m: usize, script: &Script) -> Vec<usize> {
    let mut components = vec![0];
    components.extend(std::iter::repeat(sig_size).take(m));
    components.push(script.len());
    components
}

fn input_weights(psbt: &Psbt, index: usize) -> Result<InputWeights, Error> {
    let kind = sighash::classify(psbt, index)?;
    let (script_pubkey, _) = prevouts::resolve(psbt, index)?;
    let input = &psbt.inputs[index];

    match kind {
        SpendKind::Legacy => match &input.redeem_script {
            Some(redeem_script) => {
                let (m, _) = parse_multisig_script(redeem_script).map_err(|reason| {
                    FinalizeError::MalformedMultisigScript { index, reason }
                })?;
                let min = compute_input_weight(
                    &multisig_script_components(ECDSA_SIG_MIN, m, redeem_script),
                    &[],
                );
                let max = compute_input_weight(
                    &multisig_script_components(ECDSA_SIG_MAX, m, redeem_script),
                    &[],
                );
                Ok(InputWeights {
                    min,
                    max,
                    is_segwit: false,
                })
            }
            None => {
                // <sig> <pubkey> scriptSig
                let min = compute_input_weight(
                    &[OP_PUSH_SIZE + ECDSA_SIG_MIN, OP_PUSH_SIZE + PUBKEY_SIZE],
                    &[],
                );
                let max = compute_input_weight(
                    &[OP_PUSH_SIZE + ECDSA_SIG_MAX, OP_PUSH_SIZE + PUBKEY_SIZE],
                    &[],
                );
                Ok(InputWeights {
                    min,
                    max,
                    is_segwit: false,
                })
            }
        },
        SpendKind::SegwitV0 => {
            let (spend_script, script_components) = if script_pubkey.is_p2sh() {
                let redeem_script = input
                    .redeem_script
                    .as_deref()
                    .ok_or(ReferenceError::MissingRedeemScript { index })?;
                (redeem_script, vec![script_push_size(redeem_script.len())])
            } else {
                (script_pubkey.as_script(), vec![])
            };

            if spend_script.is_p2wpkh() {
                let min = compute_input_weight(&script_components, &[ECDSA_SIG_MIN, PUBKEY_SIZE]);
                let max = compute_input_weight(&script_components, &[ECDSA_SIG_MAX, PUBKEY_SIZE]);
                Ok(InputWeights {
                    min,
                    max,
                    is_segwit: true,
                })
            } else if spend_script.is_p2wsh() {
                let witness_script = input
                    .witness_script
                    .as_deref()
                    .ok_or(ReferenceError::MissingWitnessScript { index })?;
                let (min_witness, max_witness) = match parse_multisig_script(witness_script) {
                    Ok((m, _)) => (
                        multisig_witness_components(ECDSA_SIG_MIN, m, witness_script),
                        multisig_witness_components(ECDSA_SIG_MAX, m, witness_script),
                    ),
                    // not a checkmultisig policy: assume a single signature
                    Err(_) => (
                        vec![ECDSA_SIG_MIN, witness_script.len()],
                        vec![ECDSA_SIG_MAX, witness_script.len()],
                    ),
                };
                Ok(InputWeights {
                    min: compute_input_weight(&script_components, &min_witness),
                    max: compute_input_weight(&script_components, &max_witness),
                    is_segwit: true,
                })
            } else {
                Err(FinalizeError::UnsupportedScript { index }.into())
            }
        }
        SpendKind::TaprootKeyPath => {
            let weight = compute_input_weight(&[], &[schnorr_sig_size(input)]);
            Ok(InputWeights {
                min: weight,
                max: weight,
                is_segwit: true,
            })
        }
        SpendKind::TaprootScriptPath => {
            let (control_block, (leaf_script, _)) = input
                .tap_scripts
                .iter()
                .next()
                .ok_or(FinalizeError::MissingControlBlock { index })?;
            let weight = compute_input_weight(
                &[],
                &[
                    schnorr_sig_size(input),
                    leaf_script.len(),
                    control_block.serialize().len(),
                ],
            );
            Ok(InputWeights {
                min: weight,
                max: weight,
                is_segwit: true,
            })
        }
    }
}

/// Weight bounds for a transaction under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    input_weight_min: usize,
    input_weight_max: usize,
    output_weight: usize,
    has_segwit: bool,
}

impl Dimensions {
    pub fn empty() -> Dimensions {
        Dimensions {
            input_weight_min: 0,
            input_weight_max: 0,
            output_weight: 0,
            has_segwit: false,
        }
    }

    /// Estimate dimensions for a PSBT from its attached input metadata.
    ///
    /// Every input must carry its previous-output data (and redeem/witness
    /// scripts or tap scripts where its spend path needs them).
    pub fn from_psbt(psbt: &Psbt) -> Result<Dimensions, Error> {
        let mut dimensions = Dimensions::empty();
        for index in 0..psbt.inputs.len() {
            let weights = input_weights(psbt, index)?;
            dimensions.input_weight_min += weights.min;
            dimensions.input_weight_max += weights.max;
            dimensions.has_segwit = dimensions.has_segwit || weights.is_segwit;
        }
        for output in &psbt.unsigned_tx.output {
            dimensions.output_weight += compute_output_weight(output.script_pubkey.len());
        }
        Ok(dimensions)
    }

    pub fn plus(&self, other: &Dimensions) -> Dimensions {
        Dimensions {
            input_weight_min: self.input_weight_min + other.input_weight_min,
            input_weight_max: self.input_weight_max + other.input_weight_max,
            output_weight: self.output_weight + other.output_weight,
            has_segwit: self.has_segwit || other.has_segwit,
        }
    }

    fn overhead_weight(&self) -> usize {
        if self.input_weight_max == 0 && self.output_weight == 0 {
            return 0;
        }
        let mut weight = 4 * TX_OVERHEAD_SIZE;
        if self.has_segwit {
            weight += SEGWIT_MARKER_FLAG_SIZE;
        }
        weight
    }

    pub fn weight_min(&self) -> u64 {
        (self.overhead_weight() + self.input_weight_min + self.output_weight) as u64
    }

    pub fn weight_max(&self) -> u64 {
        (self.overhead_weight() + self.input_weight_max + self.output_weight) as u64
    }

    pub fn vsize_min(&self) -> u64 {
        self.weight_min().div_ceil(4)
    }

    pub fn vsize_max(&self) -> u64 {
        self.weight_max().div_ceil(4)
    }

    /// Fee for the upper size bound at `fee_rate` sat/vbyte, with
    /// `extra_bytes` of caller-accounted overhead charged at the same rate
    pub fn fee(&self, fee_rate: u64, extra_bytes: u64) -> u64 {
        (self.vsize_max() + extra_bytes) * fee_rate
    }
}
