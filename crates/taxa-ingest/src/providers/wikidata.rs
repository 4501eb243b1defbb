//! Wikidata: SPARQL keyset enumeration and EntityData fetches

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{required_str, ProviderAdapter};
use crate::client::{FetchRequest, FetchedResponse};
use crate::config::ProviderConfig;
use crate::cursor::{Candidate, CandidatePage, PageSource};
use crate::error::{FetchError, IngestError, PageError};
use crate::fetcher::TrackedFetcher;
use crate::models::{EntityFetch, EntityFields, ExternalId, FetchedEntity, Provider, RedirectHop};

const PROP_TAXON_NAME: &str = "P225";
const PROP_PARENT_TAXON: &str = "P171";
const PROP_TAXON_RANK: &str = "P105";
const PROP_IUCN_TAXON_ID: &str = "P627";

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// Numeric part of a QID such as `Q140`
pub fn parse_qid(id: &str) -> Option<i64> {
    let digits = id.strip_prefix('Q')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok().filter(|n| *n > 0)
}

/// The single entity object inside an EntityData document
fn primary_entity(document: &Value) -> Option<&Value> {
    document.get("entities")?.as_object()?.values().next()
}

fn first_claim<'a>(entity: &'a Value, property: &str) -> Option<&'a Value> {
    entity
        .get("claims")?
        .get(property)?
        .as_array()?
        .iter()
        .find_map(|claim| claim.pointer("/mainsnak/datavalue/value"))
}

fn claim_string(entity: &Value, property: &str) -> Option<String> {
    first_claim(entity, property)?
        .as_str()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn claim_entity_id(entity: &Value, property: &str) -> Option<String> {
    first_claim(entity, property)?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

/// IUCN taxon id (P627) of a cached wikidata document
pub fn iucn_taxon_id(document: &Value) -> Option<String> {
    claim_string(primary_entity(document)?, PROP_IUCN_TAXON_ID)
}

/// English Wikipedia title of a cached wikidata document
pub fn enwiki_title(document: &Value) -> Option<String> {
    primary_entity(document)?
        .pointer("/sitelinks/enwiki/title")?
        .as_str()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

pub struct WikidataAdapter {
    base_url: String,
}

impl WikidataAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl ProviderAdapter for WikidataAdapter {
    fn provider(&self) -> Provider {
        Provider::Wikidata
    }

    fn entity_request(&self, id: &ExternalId) -> Result<FetchRequest, FetchError> {
        if parse_qid(id.as_str()).is_none() {
            return Err(FetchError::InvalidRequest(format!("'{}' is not a QID", id)));
        }
        Ok(FetchRequest::get(format!(
            "{}/wiki/Special:EntityData/{}.json",
            self.base_url, id
        ))
        .accept("application/json"))
    }

    fn decode_entity(&self, id: &ExternalId, response: &FetchedResponse) -> Result<EntityFetch, FetchError> {
        let document: Value = response.json(id.as_str())?;
        let entity = primary_entity(&document)
            .ok_or_else(|| FetchError::decode(id.as_str(), "no entity in document"))?;

        if entity.get("missing").is_some() {
            return Ok(EntityFetch::Missing {
                reason: format!("{} is missing", id),
            });
        }

        let resolved = required_str(entity, "/id", id)?;
        if parse_qid(resolved).is_none() {
            return Err(FetchError::decode(id.as_str(), format!("'{}' is not a QID", resolved)));
        }

        let canonical_name = claim_string(entity, PROP_TAXON_NAME).or_else(|| {
            entity
                .pointer("/labels/en/value")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        // EntityData follows redirects and answers with the target entity
        let redirects = if resolved != id.as_str() {
            vec![RedirectHop::new(id.as_str(), resolved)]
        } else {
            Vec::new()
        };

        Ok(EntityFetch::Found(FetchedEntity {
            payload: response.body.clone(),
            fields: EntityFields {
                canonical_id: Some(resolved.to_string()),
                canonical_name,
                parent_id: claim_entity_id(entity, PROP_PARENT_TAXON),
                rank: claim_entity_id(entity, PROP_TAXON_RANK),
                is_redirect: false,
            },
            redirects,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<SparqlBinding>,
}

#[derive(Debug, Deserialize)]
struct SparqlBinding {
    item: SparqlValue,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    value: String,
}

/// Taxon items (anything with a taxon name) ordered by numeric QID
pub struct WikidataTaxonSource {
    query_url: String,
    fetcher: TrackedFetcher,
}

impl WikidataTaxonSource {
    pub fn new(config: &ProviderConfig, fetcher: TrackedFetcher) -> Result<Self, IngestError> {
        let query_url = config
            .query_url
            .clone()
            .ok_or_else(|| IngestError::config("TAXA_WIKIDATA_QUERY_URL is required"))?;
        Ok(Self { query_url, fetcher })
    }

    pub fn build_query(after: i64, limit: usize) -> String {
        format!(
            "SELECT ?item WHERE {{ \
               ?item wdt:{name} ?taxonName . \
               BIND(xsd:integer(STRAFTER(STR(?item), \"entity/Q\")) AS ?num) \
               FILTER(?num > {after}) \
             }} ORDER BY ?num LIMIT {limit}",
            name = PROP_TAXON_NAME,
            after = after,
            limit = limit
        )
    }
}

fn decode_page(body: &FetchedResponse, after: i64) -> Result<CandidatePage, FetchError> {
    let target = format!("sparql after {}", after);
    let response: SparqlResponse = body.json(&target)?;
    let scanned = response.results.bindings.len();

    let mut candidates: Vec<Candidate> = Vec::with_capacity(scanned);
    for binding in response.results.bindings {
        let qid = binding
            .item
            .value
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let position = parse_qid(&qid).ok_or_else(|| {
            FetchError::decode(&target, format!("unexpected item '{}'", binding.item.value))
        })?;
        let previous = candidates.last().map(|c| c.position).unwrap_or(after);
        if position <= previous {
            return Err(FetchError::decode(
                &target,
                format!("results out of order at {}", qid),
            ));
        }
        candidates.push(Candidate {
            position,
            external_id: ExternalId::new(qid),
        });
    }

    let last_position = candidates.last().map(|c| c.position);
    Ok(CandidatePage {
        candidates,
        scanned,
        last_position,
    })
}

#[async_trait]
impl PageSource for WikidataTaxonSource {
    async fn fetch_page(
        &self,
        after: i64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<CandidatePage, PageError> {
        let request = FetchRequest::get(self.query_url.as_str())
            .query("query", Self::build_query(after, limit))
            .query("format", "json")
            .accept(SPARQL_RESULTS_JSON);

        let tracked = self.fetcher.fetch(&request, cancel).await?;
        let response = tracked.result?;
        Ok(decode_page(&response, after)?)
    }
}
