use crate::error::{PythoraError, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use tracing::info;
use zeroize::Zeroize;

/// Default environment variables holding the signing key
pub const PRIVATE_KEY_ENV: &str = "PYTHORA_PRIVATE_KEY";
const FALLBACK_PRIVATE_KEY_ENV: &str = "PRIVATE_KEY";

/// Wallet for signing price update transactions
///
/// # Security
/// The raw private key string is zeroized right after the signer is built and
/// never stored in the struct.
#[derive(Clone)]
pub struct Wallet {
    signer: PrivateKeySigner,
}

impl Wallet {
    /// Create a wallet from a private key hex string
    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self> {
        let mut secure_key = private_key.trim().trim_start_matches("0x").to_string();

        let parsed = secure_key.parse::<PrivateKeySigner>();
        secure_key.zeroize();

        let mut signer =
            parsed.map_err(|e| PythoraError::Wallet(format!("Invalid private key: {}", e)))?;
        signer.set_chain_id(Some(chain_id));

        info!(
            address = %signer.address(),
            chain_id,
            "Wallet initialized (private key zeroized from memory)"
        );

        Ok(Self { signer })
    }

    /// Create a wallet from the default environment variables
    pub fn from_env(chain_id: u64) -> Result<Self> {
        let mut private_key = std::env::var(PRIVATE_KEY_ENV)
            .or_else(|_| std::env::var(FALLBACK_PRIVATE_KEY_ENV))
            .map_err(|_| {
                PythoraError::Wallet(format!(
                    "{} or {} environment variable not set",
                    PRIVATE_KEY_ENV, FALLBACK_PRIVATE_KEY_ENV
                ))
            })?;

        let result = Self::from_private_key(&private_key, chain_id);
        private_key.zeroize();
        result
    }

    /// Create a wallet from a named environment variable
    pub fn from_env_var(var: &str, chain_id: u64) -> Result<Self> {
        let mut private_key = std::env::var(var).map_err(|_| {
            PythoraError::Wallet(format!("{} environment variable not set", var))
        })?;

        let result = Self::from_private_key(&private_key, chain_id);
        private_key.zeroize();
        result
    }

    /// Get the wallet address
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Transaction-signing wallet for an alloy provider
    pub fn ethereum_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("chain_id", &self.signer.chain_id())
            .finish()
    }
}
