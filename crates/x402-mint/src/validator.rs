use alloy::primitives::{Address, U256};

use crate::eip3009;
use crate::error::ValidationError;
use crate::payment::PaymentAuthorization;
use crate::ChainConfig;

/// Stateless, I/O-free checks on an authorization.
///
/// Checks run in a fixed order (payee, amount, window, signature) so the
/// cheap field comparisons reject garbage before any curve arithmetic.
#[derive(Debug, Clone)]
pub struct AuthorizationValidator {
    config: ChainConfig,
}

impl AuthorizationValidator {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Accept `auth` if it pays at least `expected_min_amount` to
    /// `expected_payee`, is valid at `now` (both bounds inclusive), and was
    /// signed by its payer over this deployment's EIP-712 domain.
    pub fn validate(
        &self,
        auth: &PaymentAuthorization,
        expected_payee: Address,
        expected_min_amount: U256,
        now: u64,
    ) -> Result<(), ValidationError> {
        if auth.payee != expected_payee {
            return Err(ValidationError::RecipientMismatch {
                expected: expected_payee,
                got: auth.payee,
            });
        }

        if auth.amount < expected_min_amount {
            return Err(ValidationError::InsufficientAmount {
                offered: auth.amount,
                required: expected_min_amount,
            });
        }

        if auth.valid_after >= auth.valid_before {
            return Err(ValidationError::InvalidWindow {
                valid_after: auth.valid_after,
                valid_before: auth.valid_before,
            });
        }
        if now < auth.valid_after {
            return Err(ValidationError::NotYetValid {
                valid_after: auth.valid_after,
                now,
            });
        }
        if now > auth.valid_before {
            return Err(ValidationError::Expired {
                valid_before: auth.valid_before,
                now,
            });
        }

        let signer =
            eip3009::recover_signer(auth, &self.config).map_err(ValidationError::InvalidSignature)?;
        if signer != auth.payer {
            return Err(ValidationError::InvalidSignature(format!(
                "signer {signer} does not match payer {}",
                auth.payer
            )));
        }

        Ok(())
    }
}
