//! Range-based replication contract between two `VerifiableLog` instances.
//!
//! `fabric-log` does not itself speak to the network; `fabric-p2p` wraps a
//! `RangeRequest`/`RangeResponse` pair inside its request/response protocol
//! and calls [`VerifiableLog::apply_remote_range`] with what comes back.

use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;
use crate::error::LogError;
use crate::log::VerifiableLog;

/// Ask a peer for the entries it holds in `[from_index, to_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRequest {
    pub from_index: u64,
    pub to_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeResponse {
    pub entries: Vec<LogEntry>,
}

impl VerifiableLog {
    /// Build a response to `req` from the local tail.
    pub fn serve_range(&self, req: &RangeRequest) -> RangeResponse {
        RangeResponse {
            entries: self.range(req.from_index, req.to_index),
        }
    }

    /// Apply a batch of remote entries received from a replicator.
    ///
    /// Entries must be contiguous with the local tail (each entry's
    /// `prev_hash` must equal the previous one's `entry_hash`, and the
    /// first entry's `prev_hash` must equal the current tail's
    /// `entry_hash`), individually hash-valid, and individually signed by
    /// the peer id they claim as author. A batch that fails any check is
    /// rejected in full: no partial application.
    pub async fn apply_remote_range(&self, entries: Vec<LogEntry>) -> Result<u64, LogError> {
        if entries.is_empty() {
            return Ok(self.length());
        }

        let expected_start = self.length();
        let mut expected_prev = if expected_start == 0 {
            String::new()
        } else {
            self.get(expected_start - 1)?.entry_hash
        };

        for entry in &entries {
            if !entry.hash_matches() {
                return Err(LogError::IntegrityViolation(entry.index));
            }
            if entry.prev_hash != expected_prev {
                return Err(LogError::ChainMismatch { index: entry.index });
            }
            let signature = hex::decode(&entry.signature).unwrap_or_default();
            if !self
                .verifier
                .verify(&entry.author_peer_id, &entry.signing_bytes(), &signature)
            {
                return Err(LogError::InvalidSignature {
                    index: entry.index,
                    author: entry.author_peer_id.clone(),
                });
            }
            expected_prev = entry.entry_hash.clone();
        }

        if entries[0].index != expected_start {
            return Err(LogError::ChainMismatch {
                index: entries[0].index,
            });
        }

        for entry in entries {
            self.append_verified_remote(entry).await?;
        }
        Ok(self.length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EventType, Payload};
    use crate::signing::{InsecureTestSigner, InsecureTestVerifier, Verifier};
    use std::sync::Arc;

    fn signer(id: &str) -> Arc<dyn crate::signing::Signer> {
        Arc::new(InsecureTestSigner {
            peer_id: id.to_string(),
        })
    }

    fn verifier() -> Arc<dyn Verifier> {
        Arc::new(InsecureTestVerifier)
    }

    #[tokio::test]
    async fn range_round_trips_between_two_logs() {
        let source = VerifiableLog::open(None, signer("source"), verifier())
            .await
            .unwrap();
        for _ in 0..4 {
            source
                .append(EventType::TaskProgress, Payload::new())
                .await
                .unwrap();
        }

        let replica = VerifiableLog::open(None, signer("replica"), verifier())
            .await
            .unwrap();

        let resp = source.serve_range(&RangeRequest {
            from_index: 0,
            to_index: 4,
        });
        let applied = replica.apply_remote_range(resp.entries).await.unwrap();
        assert_eq!(applied, 4);
        assert!(replica.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn forged_signature_is_rejected() {
        let source = VerifiableLog::open(None, signer("source"), verifier())
            .await
            .unwrap();
        source
            .append(EventType::TaskProgress, Payload::new())
            .await
            .unwrap();

        let replica = VerifiableLog::open(None, signer("replica"), verifier())
            .await
            .unwrap();

        let mut entries = source.range(0, 1);
        entries[0].signature = hex::encode(b"not a real signature");

        let result = replica.apply_remote_range(entries).await;
        assert!(matches!(
            result,
            Err(LogError::InvalidSignature { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn non_contiguous_batch_is_rejected() {
        let source = VerifiableLog::open(None, signer("source"), verifier())
            .await
            .unwrap();
        for _ in 0..4 {
            source
                .append(EventType::TaskProgress, Payload::new())
                .await
                .unwrap();
        }

        let replica = VerifiableLog::open(None, signer("replica"), verifier())
            .await
            .unwrap();

        // Skip entry 0: batch starts at index 1, which cannot follow an
        // empty local log.
        let entries = source.range(1, 4);
        let result = replica.apply_remote_range(entries).await;
        assert!(matches!(result, Err(LogError::ChainMismatch { index: 1 })));
    }
}
