use miniscript::bitcoin::address::ParseError;
use miniscript::bitcoin::consensus::encode;
use miniscript::bitcoin::{psbt, secp256k1, Txid};

/// Failures while decoding caller-supplied material (hex, txids, keys,
/// addresses, scripts).
#[derive(Debug)]
pub enum DecodeError {
    InvalidHex(hex::FromHexError),
    InvalidTxid(String),
    InvalidKey(secp256k1::Error),
    InvalidAddress(ParseError),
    InvalidScript(String),
    InvalidControlBlock(String),
    /// Output descriptor must carry exactly one of address and script
    InvalidOutput,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidHex(error) => write!(f, "invalid hex: {}", error),
            DecodeError::InvalidTxid(error) => write!(f, "invalid txid: {}", error),
            DecodeError::InvalidKey(error) => write!(f, "invalid key: {}", error),
            DecodeError::InvalidAddress(error) => write!(f, "invalid address: {}", error),
            DecodeError::InvalidScript(error) => write!(f, "invalid script: {}", error),
            DecodeError::InvalidControlBlock(error) => {
                write!(f, "invalid control block: {}", error)
            }
            DecodeError::InvalidOutput => {
                write!(f, "output must have exactly one of address and script")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::InvalidHex(error) => Some(error),
            DecodeError::InvalidKey(error) => Some(error),
            DecodeError::InvalidAddress(error) => Some(error),
            _ => None,
        }
    }
}

/// References to inputs, outputs or previous outputs that do not exist or
/// contradict each other.
#[derive(Debug)]
pub enum ReferenceError {
    InputIndexOutOfBounds {
        index: usize,
        inputs: usize,
    },
    OutputIndexOutOfBounds {
        vout: u32,
    },
    BothUtxoFieldsSet {
        index: usize,
    },
    NoUtxoFields {
        index: usize,
    },
    /// Stored previous transaction does not hash to the referenced txid
    PrevTxMismatch {
        index: usize,
        expected: Txid,
        actual: Txid,
    },
    /// SIGHASH_SINGLE signing an input with no output at the same index
    SingleNoMatchingOutput {
        index: usize,
        outputs: usize,
    },
    MissingRedeemScript {
        index: usize,
    },
    MissingWitnessScript {
        index: usize,
    },
    RedeemScriptMismatch {
        index: usize,
    },
    WitnessScriptMismatch {
        index: usize,
    },
    InputAlreadyFinalized {
        index: usize,
    },
    /// Appending inputs or outputs would invalidate existing taproot
    /// signatures, which commit to all inputs and outputs
    WouldInvalidateSignatures,
}

impl std::fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceError::InputIndexOutOfBounds { index, inputs } => {
                write!(f, "input index {} out of bounds ({} inputs)", index, inputs)
            }
            ReferenceError::OutputIndexOutOfBounds { vout } => {
                write!(f, "output index {} out of bounds", vout)
            }
            ReferenceError::BothUtxoFieldsSet { index } => {
                write!(
                    f,
                    "input {}: both witness_utxo and non_witness_utxo are set",
                    index
                )
            }
            ReferenceError::NoUtxoFields { index } => {
                write!(
                    f,
                    "input {}: neither witness_utxo nor non_witness_utxo is set",
                    index
                )
            }
            ReferenceError::PrevTxMismatch {
                index,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "input {}: previous transaction hashes to {} but outpoint references {}",
                    index, actual, expected
                )
            }
            ReferenceError::SingleNoMatchingOutput { index, outputs } => {
                write!(
                    f,
                    "input {}: SIGHASH_SINGLE with no matching output ({} outputs)",
                    index, outputs
                )
            }
            ReferenceError::MissingRedeemScript { index } => {
                write!(f, "input {}: redeem script required but not set", index)
            }
            ReferenceError::MissingWitnessScript { index } => {
                write!(f, "input {}: witness script required but not set", index)
            }
            ReferenceError::RedeemScriptMismatch { index } => {
                write!(
                    f,
                    "input {}: redeem script does not hash to the output script",
                    index
                )
            }
            ReferenceError::WitnessScriptMismatch { index } => {
                write!(
                    f,
                    "input {}: witness script does not hash to the witness program",
                    index
                )
            }
            ReferenceError::InputAlreadyFinalized { index } => {
                write!(f, "input {} is already finalized", index)
            }
            ReferenceError::WouldInvalidateSignatures => {
                write!(
                    f,
                    "cannot append inputs or outputs: existing taproot signatures commit to all inputs and outputs"
                )
            }
        }
    }
}

impl std::error::Error for ReferenceError {}

/// Failures while computing digests or producing signatures.
#[derive(Debug)]
pub enum SignatureError {
    Secp(secp256k1::Error),
    Sighash(String),
    /// The signing key does not match the locking script
    KeyMismatch { index: usize },
    UnsupportedScript { index: usize },
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Secp(error) => write!(f, "secp256k1: {}", error),
            SignatureError::Sighash(error) => write!(f, "sighash computation failed: {}", error),
            SignatureError::KeyMismatch { index } => {
                write!(
                    f,
                    "input {}: signing key does not match the locking script",
                    index
                )
            }
            SignatureError::UnsupportedScript { index } => {
                write!(f, "input {}: unsupported script type for signing", index)
            }
        }
    }
}

impl std::error::Error for SignatureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignatureError::Secp(error) => Some(error),
            _ => None,
        }
    }
}

/// Failures while assembling final script-sigs and witnesses.
#[derive(Debug)]
pub enum FinalizeError {
    MalformedMultisigScript { index: usize, reason: String },
    MissingControlBlock { index: usize },
    UnsupportedScript { index: usize },
    ScriptPush(String),
    /// Extraction requested while an input is not finalized
    IncompleteSigning { index: usize },
}

impl std::fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalizeError::MalformedMultisigScript { index, reason } => {
                write!(f, "input {}: malformed multisig script: {}", index, reason)
            }
            FinalizeError::MissingControlBlock { index } => {
                write!(
                    f,
                    "input {}: taproot script path requires a control block",
                    index
                )
            }
            FinalizeError::UnsupportedScript { index } => {
                write!(
                    f,
                    "input {}: unsupported script type for finalization",
                    index
                )
            }
            FinalizeError::ScriptPush(error) => write!(f, "script push failed: {}", error),
            FinalizeError::IncompleteSigning { index } => {
                write!(f, "input {} is not finalized", index)
            }
        }
    }
}

impl std::error::Error for FinalizeError {}

/// Failures in the PSBT container or raw transaction codecs.
#[derive(Debug)]
pub enum CodecError {
    Psbt(psbt::Error),
    Consensus(encode::Error),
    Hex(hex::FromHexError),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Psbt(error) => write!(f, "psbt codec: {}", error),
            CodecError::Consensus(error) => write!(f, "consensus codec: {}", error),
            CodecError::Hex(error) => write!(f, "hex codec: {}", error),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Psbt(error) => Some(error),
            CodecError::Consensus(error) => Some(error),
            CodecError::Hex(error) => Some(error),
        }
    }
}

/// Top-level error for builder operations.
#[derive(Debug)]
pub enum Error {
    Decode(DecodeError),
    Reference(ReferenceError),
    Signature(SignatureError),
    Finalize(FinalizeError),
    Codec(CodecError),
    /// Context wrapper naming the failing input in a batch operation
    Input { index: usize, source: Box<Error> },
}

impl Error {
    /// Wrap an error with the index of the input a batch operation failed on
    pub fn at_input(index: usize, source: Error) -> Error {
        Error::Input {
            index,
            source: Box::new(source),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Decode(error) => write!(f, "{}", error),
            Error::Reference(error) => write!(f, "{}", error),
            Error::Signature(error) => write!(f, "{}", error),
            Error::Finalize(error) => write!(f, "{}", error),
            Error::Codec(error) => write!(f, "{}", error),
            Error::Input { index, source } => write!(f, "input {}: {}", index, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(error) => Some(error),
            Error::Reference(error) => Some(error),
            Error::Signature(error) => Some(error),
            Error::Finalize(error) => Some(error),
            Error::Codec(error) => Some(error),
            Error::Input { source, .. } => Some(source.as_ref()),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        Error::Decode(error)
    }
}

impl From<ReferenceError> for Error {
    fn from(error: ReferenceError) -> Self {
        Error::Reference(error)
    }
}

impl From<SignatureError> for Error {
    fn from(error: SignatureError) -> Self {
        Error::Signature(error)
    }
}

impl From<FinalizeError> for Error {
    fn from(error: FinalizeError) -> Self {
        Error::Finalize(error)
    }
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        Error::Codec(error)
    }
}
