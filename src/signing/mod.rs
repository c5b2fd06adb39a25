mod nonce_manager;
mod wallet;

pub use nonce_manager::{NonceManager, NonceStats};
pub use wallet::{Wallet, PRIVATE_KEY_ENV};
