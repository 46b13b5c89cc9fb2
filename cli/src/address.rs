use anyhow::{Context, Result};
use clap::Subcommand;
use utxo_psbt::bitcoin::Script;
use utxo_psbt::{from_output_script, to_output_script};

use crate::network::NetworkArg;

#[derive(Subcommand)]
pub enum AddressCommand {
    /// Decode an address to its output script (hex)
    Decode {
        /// The address to decode
        address: String,
        /// Network (btc, tbtc, signet, regtest)
        #[arg(short, long, value_enum)]
        network: NetworkArg,
    },
    /// Encode an output script (hex) to an address
    Encode {
        /// Output script as hex
        script: String,
        /// Network (btc, tbtc, signet, regtest)
        #[arg(short, long, value_enum)]
        network: NetworkArg,
    },
}

pub fn handle_command(command: AddressCommand) -> Result<()> {
    match command {
        AddressCommand::Decode { address, network } => {
            let script = to_output_script(&address, network.into())
                .context("Failed to decode address")?;
            println!("{}", hex::encode(script.as_bytes()));
            Ok(())
        }
        AddressCommand::Encode { script, network } => {
            let script_bytes =
                hex::decode(&script).context("Invalid hex string for output script")?;
            let script_obj = Script::from_bytes(&script_bytes);
            let address = from_output_script(script_obj, network.into())
                .context("Failed to encode output script to address")?;
            println!("{}", address);
            Ok(())
        }
    }
}
