mod address;
pub mod builder;
pub mod descriptor;
mod error;
pub mod fee;
pub mod finalize;
mod prevouts;
pub mod sighash;
pub mod signer;
#[cfg(test)]
mod test_utils;

// re-export bitcoin from the miniscript crate so downstream callers share
// our exact types
pub use ::miniscript::bitcoin;

pub use address::{from_output_script, to_output_script};
pub use builder::{InputSummary, OutputSummary, PsbtBuilder, TxSummary};
pub use descriptor::{
    parse_control_block_hex, parse_script_hex, parse_tx_hex, TxInput, TxOutput, UtxoDescriptor,
};
pub use error::{
    CodecError, DecodeError, Error, FinalizeError, ReferenceError, SignatureError,
};
pub use fee::Dimensions;
pub use finalize::InputState;
pub use sighash::SpendKind;
pub use signer::{
    verify_ecdsa_signature, verify_taproot_key_signature, verify_taproot_script_signature,
    KeySigner,
};
