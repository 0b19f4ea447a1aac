//! Cryptographic primitives for the Truman mesh.
//!
//! Provides BLS12-381 signatures and the node identity built on them.

pub mod bls;
pub mod identity;

pub use bls::{BlsError, PublicKey, SecretKey, Signature};
pub use identity::{IdentityError, NodeIdentity};
