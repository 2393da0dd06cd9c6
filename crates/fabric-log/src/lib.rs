//! Append-only, hash-chained event log (component C1).
//!
//! A leaf crate: no network or crypto-identity dependency of its own. Wire
//! an identity in via [`Signer`]/[`Verifier`] and drive replication through
//! [`replication::RangeRequest`]/[`replication::RangeResponse`].

pub mod entry;
pub mod error;
pub mod log;
pub mod replication;
pub mod signing;

pub use entry::{EventType, LogEntry, Payload};
pub use error::LogError;
pub use log::VerifiableLog;
pub use replication::{RangeRequest, RangeResponse};
pub use signing::{Signer, Verifier};

#[cfg(any(test, feature = "test-util"))]
pub use signing::{InsecureTestSigner, InsecureTestVerifier};
