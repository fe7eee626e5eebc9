//! Bearer-token verification against an identity provider's published signing keys.

pub mod claims;
pub mod keys;
pub mod verifier;

pub use claims::*;
pub use keys::*;
pub use verifier::*;
