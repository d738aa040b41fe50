//! EIP-3009 typed-data hashing and signature recovery.
//!
//! Provides functions for:
//! - Building the token's EIP-712 domain ([`token_domain`])
//! - Computing the `TransferWithAuthorization` signing hash ([`signing_hash`])
//! - Recovering the signer with EIP-2 malleability protection ([`recover_signer`])
//! - Signing and encoding authorizations for clients and tests ([`sign_authorization`], [`encode_signature_hex`])

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::signers::SignerSync;
use alloy::sol_types::SolStruct;

use crate::payment::PaymentAuthorization;
use crate::{ChainConfig, TransferWithAuthorization};

/// Build the EIP-712 domain of the configured stablecoin.
pub fn token_domain(config: &ChainConfig) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(config.eip712_domain_name.clone())),
        version: Some(std::borrow::Cow::Owned(
            config.eip712_domain_version.clone(),
        )),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(config.asset),
        salt: None,
    }
}

/// The typed-data struct the payer signed.
pub fn typed_message(auth: &PaymentAuthorization) -> TransferWithAuthorization {
    TransferWithAuthorization {
        from: auth.payer,
        to: auth.payee,
        value: auth.amount,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
    }
}

/// Compute the EIP-712 signing hash for an authorization.
pub fn signing_hash(auth: &PaymentAuthorization, config: &ChainConfig) -> B256 {
    typed_message(auth).eip712_signing_hash(&token_domain(config))
}

/// secp256k1 curve order N / 2 (signatures with s > this are malleable, EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Parse a 65-byte `r || s || v` signature, rejecting high-s values.
pub fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, String> {
    if signature_bytes.len() != 65 {
        return Err(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        ));
    }

    // from_raw accepts v in {0, 1, 27, 28} and rejects anything else.
    let sig = Signature::from_raw(signature_bytes).map_err(|e| format!("invalid signature: {e}"))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err("high-s signature rejected (EIP-2 malleability)".to_string());
    }
    Ok(sig)
}

/// Recover the address that signed `auth`.
pub fn recover_signer(auth: &PaymentAuthorization, config: &ChainConfig) -> Result<Address, String> {
    let sig = parse_signature(&auth.signature)?;
    let hash = signing_hash(auth, config);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| format!("recovery failed: {e}"))
}

/// Sign an authorization with a local key and store the 65-byte signature on it.
pub fn sign_authorization<S: SignerSync>(
    signer: &S,
    auth: &mut PaymentAuthorization,
    config: &ChainConfig,
) -> Result<Signature, alloy::signers::Error> {
    let hash = signing_hash(auth, config);
    let sig = signer.sign_hash_sync(&hash)?;
    auth.signature = alloy::primitives::Bytes::copy_from_slice(&sig.as_bytes());
    Ok(sig)
}

/// Encode a Signature to a hex string with 0x prefix (65 bytes -> 0x + 130 hex).
/// Uses Electrum notation: v = 27 or 28 in the last byte.
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}
