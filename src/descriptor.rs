use miniscript::bitcoin::taproot::ControlBlock;
use miniscript::bitcoin::{
    Amount, EcdsaSighashType, Network, OutPoint, ScriptBuf, TapSighashType, Transaction, Txid,
};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, DecodeError, Error};

/// A reference to the unspent output a transaction input spends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInput {
    pub out_tx_id: String,
    pub out_index: u32,
    /// Sequence number; defaults to the maximum when unset
    #[serde(default)]
    pub sequence: Option<u32>,
}

impl TxInput {
    pub fn new(out_tx_id: &str, out_index: u32) -> Self {
        TxInput {
            out_tx_id: out_tx_id.to_string(),
            out_index,
            sequence: None,
        }
    }

    /// Parse the referenced outpoint
    pub fn outpoint(&self) -> Result<OutPoint, Error> {
        let txid = self
            .out_tx_id
            .parse::<Txid>()
            .map_err(|e| DecodeError::InvalidTxid(e.to_string()))?;
        Ok(OutPoint {
            txid,
            vout: self.out_index,
        })
    }
}

/// A transaction output given either as an address or as a raw output
/// script (hex). Exactly one of the two must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    pub amount: u64,
}

impl TxOutput {
    pub fn to_address(address: &str, amount: u64) -> Self {
        TxOutput {
            address: Some(address.to_string()),
            script: None,
            amount,
        }
    }

    pub fn to_script(script_hex: &str, amount: u64) -> Self {
        TxOutput {
            address: None,
            script: Some(script_hex.to_string()),
            amount,
        }
    }

    /// Resolve the output script, decoding the address for the given network
    /// when no raw script is supplied
    pub fn script_pubkey(&self, network: Network) -> Result<ScriptBuf, Error> {
        match (&self.script, &self.address) {
            (Some(script), None) => parse_script_hex(script),
            (None, Some(address)) => crate::address::to_output_script(address, network),
            _ => Err(DecodeError::InvalidOutput.into()),
        }
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.amount)
    }
}

/// Decode an output script from hex
pub fn parse_script_hex(script_hex: &str) -> Result<ScriptBuf, Error> {
    ScriptBuf::from_hex(script_hex)
        .map_err(|e| DecodeError::InvalidScript(e.to_string()).into())
}

/// Decode a raw transaction from consensus hex
pub fn parse_tx_hex(tx_hex: &str) -> Result<Transaction, Error> {
    let bytes = hex::decode(tx_hex).map_err(CodecError::Hex)?;
    miniscript::bitcoin::consensus::encode::deserialize(&bytes)
        .map_err(|e| CodecError::Consensus(e).into())
}

/// Decode a taproot control block from hex
pub fn parse_control_block_hex(control_block_hex: &str) -> Result<ControlBlock, Error> {
    let bytes = hex::decode(control_block_hex)
        .map_err(|e| DecodeError::InvalidControlBlock(e.to_string()))?;
    ControlBlock::decode(&bytes)
        .map_err(|e| DecodeError::InvalidControlBlock(e.to_string()).into())
}

/// Everything needed to sign one spend path of an unspent output.
///
/// Each variant carries exactly the fields that are meaningful for its path,
/// so an input can never mix (say) a full previous transaction with a
/// taproot control block. Legacy spends carry the whole previous
/// transaction; the other paths carry the spent output directly.
#[derive(Debug, Clone)]
pub enum UtxoDescriptor {
    /// Pre-segwit spend (p2pkh, or p2sh when a redeem script is attached)
    Legacy {
        prev_tx: Transaction,
        redeem_script: Option<ScriptBuf>,
        sighash_type: EcdsaSighashType,
    },
    /// Segwit v0 spend (p2wpkh/p2wsh, optionally nested in p2sh)
    SegwitV0 {
        script_pubkey: ScriptBuf,
        amount: Amount,
        redeem_script: Option<ScriptBuf>,
        witness_script: Option<ScriptBuf>,
        sighash_type: EcdsaSighashType,
    },
    /// Taproot key-path spend
    TaprootKeyPath {
        script_pubkey: ScriptBuf,
        amount: Amount,
        sighash_type: TapSighashType,
    },
    /// Taproot script-path spend of one leaf; the control block proving the
    /// leaf's inclusion is supplied by the caller
    TaprootScriptPath {
        script_pubkey: ScriptBuf,
        amount: Amount,
        leaf_script: ScriptBuf,
        control_block: ControlBlock,
        sighash_type: TapSighashType,
    },
}

impl UtxoDescriptor {
    /// Legacy descriptor with the default ALL sighash
    pub fn legacy(prev_tx: Transaction) -> Self {
        UtxoDescriptor::Legacy {
            prev_tx,
            redeem_script: None,
            sighash_type: EcdsaSighashType::All,
        }
    }

    /// Segwit v0 descriptor with the default ALL sighash
    pub fn segwit_v0(script_pubkey: ScriptBuf, amount: Amount) -> Self {
        UtxoDescriptor::SegwitV0 {
            script_pubkey,
            amount,
            redeem_script: None,
            witness_script: None,
            sighash_type: EcdsaSighashType::All,
        }
    }

    /// Taproot key-path descriptor with the default sighash
    pub fn taproot_key_path(script_pubkey: ScriptBuf, amount: Amount) -> Self {
        UtxoDescriptor::TaprootKeyPath {
            script_pubkey,
            amount,
            sighash_type: TapSighashType::Default,
        }
    }

    /// Taproot script-path descriptor with the default sighash
    pub fn taproot_script_path(
        script_pubkey: ScriptBuf,
        amount: Amount,
        leaf_script: ScriptBuf,
        control_block: ControlBlock,
    ) -> Self {
        UtxoDescriptor::TaprootScriptPath {
            script_pubkey,
            amount,
            leaf_script,
            control_block,
            sighash_type: TapSighashType::Default,
        }
    }
}
