use std::sync::Arc;

use fabric_log::{EventType, InsecureTestSigner, InsecureTestVerifier, Payload, VerifiableLog};

/// Testable property 1: for all i >= 1, log[i].prev_hash = log[i-1].entry_hash,
/// and log[i].entry_hash recomputes correctly from its own fields.
#[tokio::test]
async fn log_chain_satisfies_universal_invariant() {
    let signer = Arc::new(InsecureTestSigner {
        peer_id: "peer-under-test".into(),
    });
    let log = VerifiableLog::open(None, signer, Arc::new(InsecureTestVerifier))
        .await
        .unwrap();

    for i in 0..10u32 {
        let mut payload = Payload::new();
        payload.insert("seq".into(), serde_json::json!(i));
        log.append(EventType::TaskProgress, payload).await.unwrap();
    }

    assert_eq!(log.length(), 10);
    for i in 1..10u64 {
        let prev = log.get(i - 1).unwrap();
        let cur = log.get(i).unwrap();
        assert_eq!(cur.prev_hash, prev.entry_hash);
        assert!(cur.hash_matches());
    }
    assert!(log.verify_integrity().is_ok());
}

#[tokio::test]
async fn verify_integrity_reports_first_bad_index() {
    let signer = Arc::new(InsecureTestSigner {
        peer_id: "peer-under-test".into(),
    });
    let log = VerifiableLog::open(None, signer, Arc::new(InsecureTestVerifier))
        .await
        .unwrap();
    for _ in 0..5 {
        log.append(EventType::TaskProgress, Payload::new())
            .await
            .unwrap();
    }

    // Corrupt by re-deriving a file-backed copy with a doctored middle entry
    // is exercised in the unit tests; here we only assert the clean log
    // passes end to end as an integration-level smoke check.
    assert!(log.verify_integrity().is_ok());
    assert_eq!(log.by_type(EventType::TaskProgress).len(), 5);
}
