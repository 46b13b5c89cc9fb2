//! Address/script conversion helpers, network-checked.

use miniscript::bitcoin::{Address, Network, Script, ScriptBuf};

use crate::error::{DecodeError, Error};

/// Parse an address for `network` into its output script
pub fn to_output_script(address: &str, network: Network) -> Result<ScriptBuf, Error> {
    let address = address
        .parse::<Address<_>>()
        .map_err(DecodeError::InvalidAddress)?
        .require_network(network)
        .map_err(DecodeError::InvalidAddress)?;
    Ok(address.script_pubkey())
}

/// Render an output script as an address for `network`
pub fn from_output_script(script: &Script, network: Network) -> Result<String, Error> {
    let address = Address::from_script(script, network)
        .map_err(|error| DecodeError::InvalidScript(error.to_string()))?;
    Ok(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{p2wpkh_script, test_signer};

    #[test]
    fn round_trips_a_p2wpkh_address() {
        let signer = test_signer(1);
        let script = p2wpkh_script(&signer);
        let address = from_output_script(&script, Network::Bitcoin).unwrap();
        assert!(address.starts_with("bc1q"));
        assert_eq!(to_output_script(&address, Network::Bitcoin).unwrap(), script);
    }

    #[test]
    fn rejects_address_for_another_network() {
        let signer = test_signer(1);
        let script = p2wpkh_script(&signer);
        let address = from_output_script(&script, Network::Bitcoin).unwrap();
        assert!(matches!(
            to_output_script(&address, Network::Testnet).unwrap_err(),
            Error::Decode(DecodeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_non_standard_script() {
        let script = ScriptBuf::from_hex("6a0102").unwrap();
        assert!(from_output_script(&script, Network::Bitcoin).is_err());
    }
}
