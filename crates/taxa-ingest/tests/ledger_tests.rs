//! Failure ledger tests against an on-disk cache

use std::time::Duration;

use taxa_ingest::ledger::escalating_delay;
use taxa_ingest::{CacheStore, ExternalId, FailureLedger};
use tempfile::TempDir;

async fn ledger(dir: &TempDir) -> FailureLedger {
    let store = CacheStore::open(&dir.path().join("iucn.db")).await.unwrap();
    FailureLedger::new(&store)
}

#[tokio::test]
async fn test_failure_then_success_leaves_eligible_list() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir).await;
    let id = ExternalId::new("15951");

    ledger
        .record_failure_at(1_000, &id, "HTTP 503", Some(503), Some(Duration::ZERO), None)
        .await
        .unwrap();
    let eligible = ledger.list_eligible(1_000).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].external_id(), id);

    assert!(ledger.clear_failure(&id).await.unwrap());

    assert!(ledger.list_eligible(i64::MAX).await.unwrap().is_empty());
    assert!(!ledger.clear_failure(&id).await.unwrap());
}

#[tokio::test]
async fn test_not_eligible_before_retry_time() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir).await;

    ledger
        .record_failure_at(
            0,
            &ExternalId::new("1"),
            "timeout",
            None,
            Some(Duration::from_secs(60)),
            None,
        )
        .await
        .unwrap();
    ledger
        .record_failure_at(
            0,
            &ExternalId::new("2"),
            "HTTP 500",
            Some(500),
            Some(Duration::from_secs(10)),
            None,
        )
        .await
        .unwrap();

    assert!(ledger.list_eligible(9_999).await.unwrap().is_empty());

    let soonest_first: Vec<String> = ledger
        .list_eligible(60_000)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.external_id)
        .collect();
    assert_eq!(soonest_first, vec!["2".to_string(), "1".to_string()]);
    assert_eq!(ledger.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let id = ExternalId::new("99");

    {
        let ledger = ledger(&dir).await;
        let base = Duration::from_secs(300);
        let cap = Duration::from_secs(86_400);
        for prior in 0..3 {
            ledger
                .record_failure_at(0, &id, "HTTP 502", Some(502), Some(escalating_delay(base, cap, prior)), None)
                .await
                .unwrap();
        }
    }

    let ledger = ledger(&dir).await;
    let record = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.next_retry_at, Some(1_200_000));
}
