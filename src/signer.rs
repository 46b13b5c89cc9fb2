use miniscript::bitcoin::key::{Keypair, TapTweak};
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use miniscript::bitcoin::{
    ecdsa, taproot, CompressedPublicKey, EcdsaSighashType, PublicKey, TapNodeHash, TapSighashType,
    XOnlyPublicKey,
};

use crate::error::{DecodeError, Error, ReferenceError};
use crate::sighash;

fn input_at(psbt: &Psbt, input_index: usize) -> Result<&miniscript::bitcoin::psbt::Input, Error> {
    psbt.inputs
        .get(input_index)
        .ok_or_else(|| {
            ReferenceError::InputIndexOutOfBounds {
                index: input_index,
                inputs: psbt.inputs.len(),
            }
            .into()
        })
}

/// Signs PSBT inputs with a single secp256k1 key.
///
/// Signing is deterministic: RFC6979 nonces for ECDSA and no auxiliary
/// randomness for schnorr, so repeated runs over the same transaction yield
/// identical signatures.
#[derive(Debug)]
pub struct KeySigner {
    secret_key: SecretKey,
    secp: Secp256k1<All>,
}

impl KeySigner {
    pub fn new(secret_key: SecretKey) -> Self {
        KeySigner {
            secret_key,
            secp: Secp256k1::new(),
        }
    }

    /// Build a signer from a 32-byte private key in hex
    pub fn from_hex(secret_key_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(secret_key_hex).map_err(DecodeError::InvalidHex)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(DecodeError::InvalidKey)?;
        Ok(KeySigner::new(secret_key))
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.secret_key.public_key(&self.secp))
    }

    pub fn compressed_public_key(&self) -> CompressedPublicKey {
        CompressedPublicKey(self.secret_key.public_key(&self.secp))
    }

    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.secret_key.public_key(&self.secp).x_only_public_key().0
    }

    /// Produce a DER-encoded ECDSA signature carrying the given sighash flag
    pub fn sign_ecdsa(&self, message: &Message, sighash_type: EcdsaSighashType) -> ecdsa::Signature {
        ecdsa::Signature {
            signature: self.secp.sign_ecdsa(message, &self.secret_key),
            sighash_type,
        }
    }

    /// Produce a schnorr signature with the untweaked key (script-path spends)
    pub fn sign_schnorr(
        &self,
        message: &Message,
        sighash_type: TapSighashType,
    ) -> taproot::Signature {
        let keypair = Keypair::from_secret_key(&self.secp, &self.secret_key);
        taproot::Signature {
            signature: self.secp.sign_schnorr_no_aux_rand(message, &keypair),
            sighash_type,
        }
    }

    /// Produce a schnorr signature with the BIP341 output-key tweak applied
    /// (key-path spends); `merkle_root` is the root of the attached script
    /// tree, or `None` for a plain key-path output
    pub fn sign_schnorr_tweaked(
        &self,
        message: &Message,
        sighash_type: TapSighashType,
        merkle_root: Option<TapNodeHash>,
    ) -> taproot::Signature {
        let keypair = Keypair::from_secret_key(&self.secp, &self.secret_key);
        let tweaked = keypair.tap_tweak(&self.secp, merkle_root);
        taproot::Signature {
            signature: self
                .secp
                .sign_schnorr_no_aux_rand(message, &tweaked.to_keypair()),
            sighash_type,
        }
    }
}

/// Verify the stored ECDSA partial signature for `public_key` against a
/// freshly computed digest.
///
/// Returns `Ok(false)` when no signature is stored for the key or the stored
/// signature does not verify.
pub fn verify_ecdsa_signature(
    psbt: &Psbt,
    input_index: usize,
    public_key: &PublicKey,
) -> Result<bool, Error> {
    let input = input_at(psbt, input_index)?;
    let Some(signature) = input.partial_sigs.get(public_key) else {
        return Ok(false);
    };

    let (message, _) = sighash::ecdsa_sighash(psbt, input_index)?;
    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_ecdsa(&message, &signature.signature, &public_key.inner)
        .is_ok())
}

/// Verify the stored taproot key-path signature against the output key
/// committed in the spent script.
pub fn verify_taproot_key_signature(psbt: &Psbt, input_index: usize) -> Result<bool, Error> {
    let input = input_at(psbt, input_index)?;
    let Some(signature) = input.tap_key_sig else {
        return Ok(false);
    };

    let (script_pubkey, _) = crate::prevouts::resolve(psbt, input_index)?;
    let output_key = sighash::taproot_output_key(script_pubkey)?;
    let (message, _) = sighash::taproot_sighash(psbt, input_index, None)?;
    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&signature.signature, &message, &output_key)
        .is_ok())
}

/// Verify a stored taproot script-path signature for `x_only_key` against
/// the leaf committed in the input's tap scripts.
pub fn verify_taproot_script_signature(
    psbt: &Psbt,
    input_index: usize,
    x_only_key: &XOnlyPublicKey,
) -> Result<bool, Error> {
    use miniscript::bitcoin::TapLeafHash;

    let input = input_at(psbt, input_index)?;
    let secp = Secp256k1::verification_only();

    for (script, leaf_version) in input.tap_scripts.values() {
        let leaf_hash = TapLeafHash::from_script(script, *leaf_version);
        let Some(signature) = input.tap_script_sigs.get(&(*x_only_key, leaf_hash)) else {
            continue;
        };
        let (message, _) = sighash::taproot_sighash(psbt, input_index, Some(leaf_hash))?;
        if secp
            .verify_schnorr(&signature.signature, &message, x_only_key)
            .is_ok()
        {
            return Ok(true);
        }
    }
    Ok(false)
}
