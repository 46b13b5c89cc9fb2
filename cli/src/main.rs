use anyhow::Result;
use clap::{Parser, Subcommand};

mod address;
mod network;
mod psbt;

#[derive(Parser)]
#[command(name = "utxo-psbt-cli", about = "Inspect PSBTs and convert addresses", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Address encoding and decoding
    #[command(subcommand)]
    Address(address::AddressCommand),
    /// PSBT inspection and fee estimation
    #[command(subcommand)]
    Psbt(psbt::PsbtCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Address(command) => address::handle_command(command),
        Commands::Psbt(command) => psbt::handle_command(command),
    }
}
