use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use crate::entry::{EventType, LogEntry, Payload};
use crate::error::LogError;
use crate::signing::{Signer, Verifier};

/// Capacity of the append-notification broadcast channel. Replication tasks
/// subscribe via [`VerifiableLog::subscribe`]; a lagging subscriber just
/// misses entries and catches up on its next `fetch_range` call, so a modest
/// bound is fine.
const APPEND_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    entries: Vec<LogEntry>,
    poisoned_at: Option<u64>,
}

/// Local, append-only, hash-chained event log (component C1).
///
/// `append` is infallible apart from I/O (spec §4.1): once a log is
/// poisoned by a failed [`VerifiableLog::verify_integrity`] check, further
/// appends are refused until the operator replaces the underlying file,
/// per §7's "Integrity violation" handling.
pub struct VerifiableLog {
    peer_id: String,
    signer: Arc<dyn Signer>,
    pub(crate) verifier: Arc<dyn Verifier>,
    inner: RwLock<Inner>,
    file: Option<Mutex<tokio::fs::File>>,
    replicators: RwLock<HashSet<String>>,
    append_tx: broadcast::Sender<LogEntry>,
}

impl VerifiableLog {
    /// Open (or create) a log backed by a JSON-Lines file at `path`, or run
    /// purely in memory when `path` is `None` (used by tests).
    ///
    /// `verifier` checks the signature on every entry absorbed through
    /// [`VerifiableLog::apply_remote_range`]; entries this node appends
    /// itself are trusted without a round-trip through it.
    pub async fn open(
        path: Option<PathBuf>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, LogError> {
        let peer_id = signer.peer_id().to_string();
        let mut entries = Vec::new();
        let file = if let Some(path) = path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if path.exists() {
                let text = tokio::fs::read_to_string(&path).await?;
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    entries.push(serde_json::from_str::<LogEntry>(line)?);
                }
            }
            let f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            Some(Mutex::new(f))
        } else {
            None
        };

        let (append_tx, _) = broadcast::channel(APPEND_CHANNEL_CAPACITY);
        let log = Self {
            peer_id,
            signer,
            verifier,
            inner: RwLock::new(Inner {
                entries,
                poisoned_at: None,
            }),
            file,
            replicators: RwLock::new(HashSet::new()),
            append_tx,
        };

        if let Err(LogError::IntegrityViolation(i)) = log.verify_integrity() {
            return Err(LogError::IntegrityViolation(i));
        }
        Ok(log)
    }

    /// Append a new entry. Computes `entry_hash` from a deterministic
    /// serialization excluding `entry_hash`/`signature`, signs over
    /// `author‖entry_hash‖index`, advances the head, persists to disk (if
    /// file-backed), and asynchronously notifies registered replicators.
    pub async fn append(
        &self,
        event_type: EventType,
        payload: Payload,
    ) -> Result<LogEntry, LogError> {
        let (index, prev_hash) = {
            let guard = self.inner.read().unwrap();
            if let Some(i) = guard.poisoned_at {
                return Err(LogError::IntegrityViolation(i));
            }
            match guard.entries.last() {
                Some(last) => (last.index + 1, last.entry_hash.clone()),
                None => (0, String::new()),
            }
        };

        let timestamp = Utc::now();
        let entry_hash = LogEntry::compute_hash(
            index,
            &timestamp,
            &self.peer_id,
            event_type,
            &payload,
            &prev_hash,
        );

        let mut entry = LogEntry {
            index,
            timestamp,
            author_peer_id: self.peer_id.clone(),
            event_type,
            payload,
            prev_hash,
            entry_hash,
            signature: String::new(),
        };
        let sig = self.signer.sign(&entry.signing_bytes());
        entry.signature = hex::encode(sig);

        {
            let mut guard = self.inner.write().unwrap();
            guard.entries.push(entry.clone());
        }

        if let Some(file) = &self.file {
            let line = serde_json::to_string(&entry)?;
            let mut f = file.lock().await;
            f.write_all(line.as_bytes()).await?;
            f.write_all(b"\n").await?;
            f.flush().await?;
        }

        // Best-effort notification; no subscriber is fatal.
        let _ = self.append_tx.send(entry.clone());
        Ok(entry)
    }

    pub fn get(&self, index: u64) -> Result<LogEntry, LogError> {
        let guard = self.inner.read().unwrap();
        guard
            .entries
            .get(index as usize)
            .cloned()
            .ok_or(LogError::NotFound(index))
    }

    pub fn length(&self) -> u64 {
        self.inner.read().unwrap().entries.len() as u64
    }

    /// Entries in `[start, end)`.
    pub fn range(&self, start: u64, end: u64) -> Vec<LogEntry> {
        let guard = self.inner.read().unwrap();
        let start = start as usize;
        let end = (end as usize).min(guard.entries.len());
        if start >= end {
            return Vec::new();
        }
        guard.entries[start..end].to_vec()
    }

    pub fn by_type(&self, event_type: EventType) -> Vec<LogEntry> {
        let guard = self.inner.read().unwrap();
        guard
            .entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn by_author(&self, peer_id: &str) -> Vec<LogEntry> {
        let guard = self.inner.read().unwrap();
        guard
            .entries
            .iter()
            .filter(|e| e.author_peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Recompute `prev_hash`/`entry_hash` for every entry and compare
    /// against what is stored. Returns the first mismatching index, if any.
    ///
    /// On failure, marks the log poisoned: further `append` calls are
    /// refused (§7's fatal "Integrity violation" handling).
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        let guard = self.inner.read().unwrap();
        let mut expected_prev = String::new();
        for entry in &guard.entries {
            if entry.prev_hash != expected_prev || !entry.hash_matches() {
                let index = entry.index;
                drop(guard);
                self.inner.write().unwrap().poisoned_at = Some(index);
                return Err(LogError::IntegrityViolation(index));
            }
            expected_prev = entry.entry_hash.clone();
        }
        Ok(())
    }

    /// Append an entry that has already been validated by the caller
    /// (used by [`crate::replication`] when absorbing a verified remote
    /// batch). Skips hashing/signing; persists and notifies like a normal
    /// append.
    pub(crate) async fn append_verified_remote(&self, entry: LogEntry) -> Result<(), LogError> {
        {
            let mut guard = self.inner.write().unwrap();
            guard.entries.push(entry.clone());
        }

        if let Some(file) = &self.file {
            let line = serde_json::to_string(&entry)?;
            let mut f = file.lock().await;
            f.write_all(line.as_bytes()).await?;
            f.write_all(b"\n").await?;
            f.flush().await?;
        }

        let _ = self.append_tx.send(entry);
        Ok(())
    }

    pub fn add_replicator(&self, peer_id: impl Into<String>) {
        self.replicators.write().unwrap().insert(peer_id.into());
    }

    pub fn remove_replicator(&self, peer_id: &str) {
        self.replicators.write().unwrap().remove(peer_id);
    }

    pub fn replicators(&self) -> Vec<String> {
        self.replicators.read().unwrap().iter().cloned().collect()
    }

    /// Subscribe to newly appended entries (used by the replication
    /// push-path and by tests observing side effects).
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.append_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{InsecureTestSigner, InsecureTestVerifier};
    use std::collections::BTreeMap;

    fn signer(id: &str) -> Arc<dyn Signer> {
        Arc::new(InsecureTestSigner {
            peer_id: id.to_string(),
        })
    }

    fn verifier() -> Arc<dyn Verifier> {
        Arc::new(InsecureTestVerifier)
    }

    #[tokio::test]
    async fn append_chains_hashes() {
        let log = VerifiableLog::open(None, signer("peer-a"), verifier()).await.unwrap();
        let e0 = log
            .append(EventType::PeerJoined, Payload::new())
            .await
            .unwrap();
        assert_eq!(e0.prev_hash, "");

        let e1 = log
            .append(EventType::TaskClaimed, Payload::new())
            .await
            .unwrap();
        assert_eq!(e1.prev_hash, e0.entry_hash);
        assert_eq!(e1.index, 1);

        assert!(log.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn tampered_entry_fails_verification() {
        let log = VerifiableLog::open(None, signer("peer-a"), verifier()).await.unwrap();
        log.append(EventType::PeerJoined, Payload::new())
            .await
            .unwrap();
        log.append(EventType::TaskClaimed, Payload::new())
            .await
            .unwrap();

        {
            let mut guard = log.inner.write().unwrap();
            let mut bad_payload = BTreeMap::new();
            bad_payload.insert("tampered".to_string(), serde_json::json!(true));
            guard.entries[0].payload = bad_payload;
        }

        match log.verify_integrity() {
            Err(LogError::IntegrityViolation(0)) => {}
            other => panic!("expected integrity violation at 0, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poisoned_log_refuses_append() {
        let log = VerifiableLog::open(None, signer("peer-a"), verifier()).await.unwrap();
        log.append(EventType::PeerJoined, Payload::new())
            .await
            .unwrap();
        {
            let mut guard = log.inner.write().unwrap();
            guard.entries[0].entry_hash = "deadbeef".into();
        }
        assert!(log.verify_integrity().is_err());
        assert!(log
            .append(EventType::TaskClaimed, Payload::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn range_and_filters() {
        let log = VerifiableLog::open(None, signer("peer-a"), verifier()).await.unwrap();
        for _ in 0..5 {
            log.append(EventType::TaskProgress, Payload::new())
                .await
                .unwrap();
        }
        log.append(EventType::Escalation, Payload::new())
            .await
            .unwrap();

        assert_eq!(log.length(), 6);
        assert_eq!(log.range(1, 3).len(), 2);
        assert_eq!(log.by_type(EventType::Escalation).len(), 1);
        assert_eq!(log.by_author("peer-a").len(), 6);
        assert_eq!(log.by_author("someone-else").len(), 0);
    }

    #[tokio::test]
    async fn persists_and_reloads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        {
            let log = VerifiableLog::open(Some(path.clone()), signer("peer-a"), verifier())
                .await
                .unwrap();
            log.append(EventType::PeerJoined, Payload::new())
                .await
                .unwrap();
            log.append(EventType::TaskClaimed, Payload::new())
                .await
                .unwrap();
        }

        let reloaded = VerifiableLog::open(Some(path), signer("peer-a"), verifier())
            .await
            .unwrap();
        assert_eq!(reloaded.length(), 2);
        assert!(reloaded.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn replicator_registration_round_trips() {
        let log = VerifiableLog::open(None, signer("peer-a"), verifier()).await.unwrap();
        log.add_replicator("peer-b");
        log.add_replicator("peer-c");
        assert_eq!(log.replicators().len(), 2);
        log.remove_replicator("peer-b");
        assert_eq!(log.replicators(), vec!["peer-c".to_string()]);
    }
}
