pub mod attestation;
pub mod state;

pub use attestation::*;
pub use state::*;
