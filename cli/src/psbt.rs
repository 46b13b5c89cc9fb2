use anyhow::{Context, Result};
use clap::Subcommand;
use utxo_psbt::PsbtBuilder;

use crate::network::NetworkArg;

#[derive(Subcommand)]
pub enum PsbtCommand {
    /// Summarize a PSBT: inputs, outputs, signing states and the implied fee
    Parse {
        /// PSBT as hex
        psbt: String,
        /// Network for address formatting
        #[arg(long, short, value_enum)]
        network: NetworkArg,
    },
    /// Estimate virtual size and fee for a PSBT
    Estimate {
        /// PSBT as hex
        psbt: String,
        /// Network for address formatting
        #[arg(long, short, value_enum)]
        network: NetworkArg,
        /// Fee rate in satoshis per virtual byte
        #[arg(long, default_value_t = 1)]
        fee_rate: u64,
        /// Extra virtual bytes charged at the same rate
        #[arg(long, default_value_t = 0)]
        extra_bytes: u64,
    },
}

pub fn handle_command(command: PsbtCommand) -> Result<()> {
    match command {
        PsbtCommand::Parse { psbt, network } => {
            let builder =
                PsbtBuilder::from_hex(network.into(), &psbt).context("Failed to parse PSBT")?;
            println!("{}", serde_json::to_string_pretty(&builder.summary())?);
            Ok(())
        }
        PsbtCommand::Estimate {
            psbt,
            network,
            fee_rate,
            extra_bytes,
        } => {
            let builder =
                PsbtBuilder::from_hex(network.into(), &psbt).context("Failed to parse PSBT")?;
            let vsize = builder
                .estimate_vsize()
                .context("Failed to estimate virtual size")?;
            let fee = builder
                .estimate_fee(fee_rate, extra_bytes)
                .context("Failed to estimate fee")?;
            println!("vsize: {}", vsize);
            println!("fee: {}", fee);
            Ok(())
        }
    }
}
