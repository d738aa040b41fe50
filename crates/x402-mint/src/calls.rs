//! Calldata for the two relayer transactions.

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolCall;

use crate::chain::{TxPurpose, TxRequest};
use crate::eip3009;
use crate::payment::PaymentAuthorization;
use crate::{IEIP3009, IMintableCollection};

/// Gas limit for a single-token mint.
pub const MINT_GAS_LIMIT: u64 = 200_000;

/// `transferWithAuthorization(from, to, value, validAfter, validBefore, nonce, v, r, s)`
/// on `token`, executing the payer's signed transfer.
///
/// The signature must already have passed validation; a malformed one is
/// reported rather than submitted.
pub fn transfer_with_authorization(
    token: Address,
    auth: &PaymentAuthorization,
) -> Result<TxRequest, String> {
    let sig = eip3009::parse_signature(&auth.signature)?;
    let call = IEIP3009::transferWithAuthorizationCall {
        from: auth.payer,
        to: auth.payee,
        value: auth.amount,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
        v: 27 + u8::from(sig.v()),
        r: B256::from(sig.r().to_be_bytes::<32>()),
        s: B256::from(sig.s().to_be_bytes::<32>()),
    };
    Ok(TxRequest {
        purpose: TxPurpose::Payment,
        to: token,
        input: call.abi_encode().into(),
        gas_limit: None,
    })
}

/// `mint(to, amount)` on the collection.
pub fn mint(collection: Address, to: Address, amount: u64) -> TxRequest {
    let call = IMintableCollection::mintCall {
        to,
        amount: U256::from(amount),
    };
    TxRequest {
        purpose: TxPurpose::Mint,
        to: collection,
        input: call.abi_encode().into(),
        gas_limit: Some(MINT_GAS_LIMIT.saturating_mul(amount.max(1))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChainConfig;
    use alloy::primitives::{Bytes, FixedBytes};
    use alloy::signers::local::PrivateKeySigner;

    #[test]
    fn test_payment_calldata_carries_signed_fields() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut auth = PaymentAuthorization {
            payer: signer.address(),
            payee: Address::repeat_byte(0x2e),
            amount: U256::from(2_000_000u64),
            valid_after: 1,
            valid_before: 2,
            nonce: FixedBytes::repeat_byte(0x05),
            signature: Bytes::new(),
        };
        let sig = eip3009::sign_authorization(&signer, &mut auth, &config).unwrap();

        let tx = transfer_with_authorization(config.asset, &auth).unwrap();
        assert_eq!(tx.purpose, TxPurpose::Payment);
        assert_eq!(tx.to, config.asset);

        let decoded = IEIP3009::transferWithAuthorizationCall::abi_decode(&tx.input).unwrap();
        assert_eq!(decoded.from, signer.address());
        assert_eq!(decoded.value, U256::from(2_000_000u64));
        assert_eq!(decoded.nonce, auth.nonce);
        assert!(decoded.v == 27 || decoded.v == 28);
        assert_eq!(decoded.r, B256::from(sig.r().to_be_bytes::<32>()));
    }

    #[test]
    fn test_payment_calldata_rejects_bad_signature() {
        let auth = PaymentAuthorization {
            payer: Address::ZERO,
            payee: Address::ZERO,
            amount: U256::ZERO,
            valid_after: 0,
            valid_before: 1,
            nonce: FixedBytes::ZERO,
            signature: Bytes::from(vec![0u8; 10]),
        };
        assert!(transfer_with_authorization(Address::ZERO, &auth).is_err());
    }

    #[test]
    fn test_mint_calldata() {
        let collection = Address::repeat_byte(0xaa);
        let to = Address::repeat_byte(0x01);
        let tx = mint(collection, to, 1);
        assert_eq!(tx.purpose, TxPurpose::Mint);
        assert_eq!(tx.gas_limit, Some(MINT_GAS_LIMIT));

        let decoded = IMintableCollection::mintCall::abi_decode(&tx.input).unwrap();
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.amount, U256::from(1u64));
    }
}
