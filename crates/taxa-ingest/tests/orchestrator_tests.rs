//! End-to-end ingestion runs against mock provider APIs
//!
//! These tests validate the full orchestration workflow including:
//! - SPARQL enumeration with cursor persistence
//! - 404 handled as an expected absence
//! - decode failures routed to the failure ledger
//! - failed-only retries, staleness skips, and forced refreshes
//! - cache-derived candidate streams for IUCN

use std::time::Duration;

use serde_json::{json, Value};
use taxa_ingest::{
    provider_status, CacheReader, CacheStore, CursorPhase, ExternalId, IngestConfig, IngestError,
    Ingestor, Provider, ProviderConfig, RunOptions,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path},
    Match, Mock, MockServer, Request, ResponseTemplate,
};

/// Matches a SPARQL page request by its cursor position
struct SparqlAfter(i64);

impl Match for SparqlAfter {
    fn matches(&self, request: &Request) -> bool {
        let needle = format!("FILTER(?num > {})", self.0);
        request
            .url
            .query_pairs()
            .any(|(key, value)| key == "query" && value.contains(&needle))
    }
}

fn sparql_page(qids: &[&str]) -> Value {
    let bindings: Vec<Value> = qids
        .iter()
        .map(|qid| json!({ "item": { "type": "uri", "value": format!("http://www.wikidata.org/entity/{}", qid) } }))
        .collect();
    json!({ "head": { "vars": ["item"] }, "results": { "bindings": bindings } })
}

fn taxon(qid: &str, name: &str, iucn_id: Option<&str>) -> Value {
    let mut claims = serde_json::Map::new();
    claims.insert(
        "P225".to_string(),
        json!([{ "mainsnak": { "datavalue": { "value": name } } }]),
    );
    if let Some(iucn_id) = iucn_id {
        claims.insert(
            "P627".to_string(),
            json!([{ "mainsnak": { "datavalue": { "value": iucn_id } } }]),
        );
    }
    let mut entities = serde_json::Map::new();
    entities.insert(
        qid.to_string(),
        json!({ "id": qid, "claims": claims, "sitelinks": {} }),
    );
    json!({ "entities": entities })
}

fn test_config(dir: &TempDir, server: &MockServer) -> IngestConfig {
    let wikidata = ProviderConfig::for_provider(Provider::Wikidata)
        .with_base_url(server.uri())
        .with_query_url(format!("{}/sparql", server.uri()))
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .with_batch_size(2)
        .with_batch_tuning(1, 1, Duration::from_millis(1));
    let iucn = ProviderConfig::for_provider(Provider::Iucn)
        .with_base_url(server.uri())
        .with_auth_token("secret")
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20));

    IngestConfig {
        failure_retry_delay: Duration::ZERO,
        failure_max_retry_delay: Duration::ZERO,
        ..IngestConfig::default()
    }
    .with_data_dir(dir.path())
    .with_provider(wikidata)
    .with_provider(iucn)
}

async fn mount_sparql(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sparql"))
        .and(SparqlAfter(0))
        .respond_with(ResponseTemplate::new(200).set_body_json(sparql_page(&["Q140", "Q141"])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sparql"))
        .and(SparqlAfter(141))
        .respond_with(ResponseTemplate::new(200).set_body_json(sparql_page(&["Q142"])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sparql"))
        .and(SparqlAfter(142))
        .respond_with(ResponseTemplate::new(200).set_body_json(sparql_page(&[])))
        .mount(server)
        .await;
}

async fn mount_entity(server: &MockServer, qid: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/wiki/Special:EntityData/{}.json", qid)))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Q140 valid, Q141 absent, Q142 undecodable unless `q142_valid`
async fn mount_wikidata(server: &MockServer, q142_valid: bool) {
    mount_sparql(server).await;
    mount_entity(
        server,
        "Q140",
        ResponseTemplate::new(200).set_body_json(taxon("Q140", "Panthera leo", Some("15951"))),
    )
    .await;
    mount_entity(server, "Q141", ResponseTemplate::new(404)).await;
    let q142 = if q142_valid {
        ResponseTemplate::new(200).set_body_json(taxon("Q142", "Panthera tigris", None))
    } else {
        ResponseTemplate::new(200).set_body_string("<html>maintenance</html>")
    };
    mount_entity(server, "Q142", q142).await;
}

// ============================================================================
// Full Runs
// ============================================================================

#[tokio::test]
async fn test_full_run_routes_each_outcome() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, false).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let summary = ingestor
        .run(&RunOptions::full(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.added, 1);
    assert_eq!(summary.missing, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.cursor, Some(142));
    assert_eq!(summary.finished, CursorPhase::Exhausted);

    let failure = ingestor
        .ledger()
        .get(&ExternalId::new("Q142"))
        .await
        .unwrap()
        .expect("decode failure is recorded");
    assert_eq!(failure.attempts, 1);
    let rejected = ingestor
        .store()
        .get_import_run(failure.import_run_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(rejected.error.unwrap().contains("Q142"));
    assert!(ingestor.ledger().get(&ExternalId::new("Q141")).await.unwrap().is_none());

    // Two SPARQL pages plus three entity fetches; the 404 completes as a failure
    let stats = ingestor.get_cache_stats().await.unwrap();
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.import_runs, 5);
    assert_eq!(stats.failed_import_runs, 1);
    assert_eq!(stats.names, 1);

    let recent = ingestor.get_import_run_summaries(3).await.unwrap();
    assert_eq!(recent.len(), 3);
}

#[tokio::test]
async fn test_second_run_resumes_and_skips_fresh_entities() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, true).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let cancel = CancellationToken::new();

    let first = ingestor.run(&RunOptions::full(), &cancel).await.unwrap();
    assert_eq!(first.added, 2);

    let resumed = ingestor.run(&RunOptions::full(), &cancel).await.unwrap();
    assert_eq!(resumed.processed, 0);
    assert_eq!(resumed.cursor, Some(142));

    let rescanned = ingestor
        .run(&RunOptions::full().with_reset_cursor(true), &cancel)
        .await
        .unwrap();
    assert_eq!(rescanned.skipped, 2);
    assert_eq!(rescanned.missing, 1);

    let forced = ingestor
        .run(&RunOptions::full().with_reset_cursor(true).with_force(true), &cancel)
        .await
        .unwrap();
    assert_eq!(forced.unchanged, 2);
    assert_eq!(forced.skipped, 0);
}

#[tokio::test]
async fn test_limit_and_resume_from() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, true).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let cancel = CancellationToken::new();

    let limited = ingestor
        .run(&RunOptions::full().with_limit(1), &cancel)
        .await
        .unwrap();
    assert_eq!(limited.processed, 1);
    assert_eq!(limited.cursor, Some(140));

    let skipped_ahead = ingestor
        .run(&RunOptions::full().with_resume_from(141), &cancel)
        .await
        .unwrap();
    assert_eq!(skipped_ahead.processed, 1);
    assert_eq!(skipped_ahead.added, 1);
    assert_eq!(skipped_ahead.cursor, Some(142));
}

#[tokio::test]
async fn test_cancelled_run_does_not_move_cursor() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, true).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = ingestor.run(&RunOptions::full(), &cancel).await.unwrap();

    assert_eq!(summary.finished, CursorPhase::Cancelled);
    assert_eq!(summary.processed, 0);
    assert_eq!(
        ingestor.cursors().get("wikidata.qid").await.unwrap(),
        None
    );
}

// ============================================================================
// Failed-Only Runs
// ============================================================================

#[tokio::test]
async fn test_failed_only_run_retries_ledger_entries() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, false).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let cancel = CancellationToken::new();
    ingestor.run(&RunOptions::full(), &cancel).await.unwrap();
    assert_eq!(ingestor.ledger().count().await.unwrap(), 1);

    server.reset().await;
    mount_wikidata(&server, true).await;

    let retried = ingestor.run(&RunOptions::failed_only(), &cancel).await.unwrap();

    assert_eq!(retried.processed, 1);
    assert_eq!(retried.added, 1);
    assert_eq!(retried.cursor, None);
    assert_eq!(ingestor.ledger().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_only_respects_attempt_ceiling() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = IngestConfig {
        max_failure_attempts: Some(1),
        ..test_config(&dir, &server)
    };
    mount_wikidata(&server, false).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    let cancel = CancellationToken::new();
    ingestor.run(&RunOptions::full(), &cancel).await.unwrap();

    let retried = ingestor.run(&RunOptions::failed_only(), &cancel).await.unwrap();

    assert_eq!(retried.processed, 0);
    assert_eq!(ingestor.ledger().count().await.unwrap(), 1);
}

// ============================================================================
// Cache-Derived Streams and Status
// ============================================================================

#[tokio::test]
async fn test_iucn_candidates_come_from_wikidata_cache() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, true).await;

    Mock::given(method("GET"))
        .and(path("/taxa/sis/15951"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "taxon": {
                "sis_id": 15951,
                "scientific_name": "Panthera leo",
                "genus_name": "Panthera"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let wikidata = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    wikidata.run(&RunOptions::full(), &cancel).await.unwrap();

    let iucn = Ingestor::open(Provider::Iucn, &config).await.unwrap();
    let summary = iucn.run(&RunOptions::full(), &cancel).await.unwrap();

    assert_eq!(summary.added, 1);
    assert_eq!(summary.finished, CursorPhase::Exhausted);

    let reader = CacheReader::open(&config.database_path(Provider::Wikidata))
        .await
        .unwrap();
    let lion_row = reader
        .get_entity(&ExternalId::new("Q140"))
        .await
        .unwrap()
        .unwrap();
    let tiger_row = reader
        .get_entity(&ExternalId::new("Q142"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.cursor, Some(lion_row.id.max(tiger_row.id)));

    let cached = iucn
        .store()
        .get_entity(&ExternalId::new("15951"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.canonical_name.as_deref(), Some("Panthera leo"));
    assert_eq!(cached.parent_id.as_deref(), Some("Panthera"));
}

#[tokio::test]
async fn test_provider_status_reports_cursor_and_failures() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    mount_wikidata(&server, false).await;

    let ingestor = Ingestor::open(Provider::Wikidata, &config).await.unwrap();
    ingestor
        .run(&RunOptions::full(), &CancellationToken::new())
        .await
        .unwrap();

    let report = provider_status(Provider::Wikidata, &config, 10).await.unwrap();

    assert_eq!(report.stream, "wikidata.qid");
    assert_eq!(report.cursor, Some(142));
    assert_eq!(report.failures, 1);
    assert_eq!(report.eligible_failures, 1);
    assert_eq!(report.stats.entities, 1);
    assert_eq!(report.recent_runs.len(), 5);
}

#[tokio::test]
async fn test_status_on_missing_database_creates_nothing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &server);
    let path = config.database_path(Provider::Iucn);

    let result = provider_status(Provider::Iucn, &config, 10).await;

    assert!(matches!(result, Err(IngestError::Config(_))));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_reporting_reads_the_store_the_ingestor_writes() {
    let server = MockServer::start().await;
    let config_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let config = test_config(&config_dir, &server);
    mount_wikidata(&server, true).await;

    let own_path = store_dir.path().join("own.db");
    let store = CacheStore::open(&own_path).await.unwrap();
    let ingestor = Ingestor::with_store(Provider::Wikidata, &config, store).unwrap();
    assert_eq!(ingestor.store().path(), Some(own_path.as_path()));

    ingestor
        .run(&RunOptions::full(), &CancellationToken::new())
        .await
        .unwrap();

    let stats = ingestor.get_cache_stats().await.unwrap();
    assert_eq!(stats.entities, 2);
    let runs = ingestor.get_import_run_summaries(10).await.unwrap();
    assert_eq!(runs.len(), 5);
    assert!(!config.database_path(Provider::Wikidata).exists());
}
