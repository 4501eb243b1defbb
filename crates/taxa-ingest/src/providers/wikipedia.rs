//! English Wikipedia: MediaWiki `action=query` page lookups
//!
//! Redirects are resolved server-side (`redirects=1`); the `normalized` and
//! `redirects` arrays of the response become the stored chain, in that order.

use serde::Deserialize;

use super::ProviderAdapter;
use crate::client::{FetchRequest, FetchedResponse};
use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::models::{
    validate_redirect_chain, EntityFetch, EntityFields, ExternalId, FetchedEntity, Provider,
    RedirectHop,
};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    query: Query,
}

#[derive(Debug, Deserialize)]
struct Query {
    #[serde(default)]
    normalized: Vec<TitleHop>,
    #[serde(default)]
    redirects: Vec<TitleHop>,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct TitleHop {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    invalidreason: Option<String>,
    /// Present when the page is itself an unresolved redirect
    #[serde(default)]
    redirect: bool,
}

pub struct WikipediaAdapter {
    api_url: String,
}

impl WikipediaAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_url: config.base_url.clone(),
        }
    }
}

impl ProviderAdapter for WikipediaAdapter {
    fn provider(&self) -> Provider {
        Provider::Wikipedia
    }

    fn entity_request(&self, id: &ExternalId) -> Result<FetchRequest, FetchError> {
        if id.as_str().trim().is_empty() {
            return Err(FetchError::InvalidRequest("empty page title".to_string()));
        }
        Ok(FetchRequest::get(self.api_url.as_str())
            .query("action", "query")
            .query("format", "json")
            .query("formatversion", "2")
            .query("redirects", "1")
            .query("prop", "info|pageprops|extracts")
            .query("exintro", "1")
            .query("titles", id.as_str())
            .accept("application/json"))
    }

    fn decode_entity(&self, id: &ExternalId, response: &FetchedResponse) -> Result<EntityFetch, FetchError> {
        let decoded: QueryResponse = response.json(id.as_str())?;
        let query = decoded.query;

        let page = query
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::decode(id.as_str(), "response has no pages"))?;

        if page.missing {
            return Ok(EntityFetch::Missing {
                reason: format!("page '{}' does not exist", id),
            });
        }
        if page.invalid {
            return Ok(EntityFetch::Missing {
                reason: page
                    .invalidreason
                    .unwrap_or_else(|| format!("'{}' is not a valid title", id)),
            });
        }

        let title = page
            .title
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchError::decode(id.as_str(), "page has no title"))?;

        // A page still flagged as a redirect means resolution stopped (loop or
        // interwiki target); keep it as a stub without a chain
        let redirects: Vec<RedirectHop> = if page.redirect {
            Vec::new()
        } else {
            query
                .normalized
                .into_iter()
                .chain(query.redirects)
                .map(|hop| RedirectHop::new(hop.from, hop.to))
                .collect()
        };
        validate_redirect_chain(&redirects, Some(title.as_str()))
            .map_err(|reason| FetchError::decode(id.as_str(), reason))?;

        Ok(EntityFetch::Found(FetchedEntity {
            payload: response.body.clone(),
            fields: EntityFields {
                canonical_id: Some(title.clone()),
                canonical_name: Some(title),
                parent_id: None,
                rank: None,
                is_redirect: page.redirect,
            },
            redirects,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn adapter() -> WikipediaAdapter {
        WikipediaAdapter::new(&ProviderConfig::for_provider(Provider::Wikipedia))
    }

    fn response(body: Value) -> FetchedResponse {
        FetchedResponse {
            url: "https://en.wikipedia.org/w/api.php".to_string(),
            status: 200,
            body: body.to_string(),
            attempts: 1,
        }
    }

    #[test]
    fn test_request_asks_for_redirect_resolution() {
        let request = adapter().entity_request(&ExternalId::new("Panthera leo")).unwrap();
        assert!(request.query.contains(&("redirects".to_string(), "1".to_string())));
        assert!(request
            .query
            .contains(&("titles".to_string(), "Panthera leo".to_string())));
    }

    #[test]
    fn test_chain_is_normalized_then_redirects() {
        let body = json!({
            "query": {
                "normalized": [{ "fromencoded": false, "from": "panthera_leo", "to": "Panthera leo" }],
                "redirects": [{ "from": "Panthera leo", "to": "Lion" }],
                "pages": [{ "pageid": 36896, "ns": 0, "title": "Lion" }]
            }
        });
        let EntityFetch::Found(entity) = adapter()
            .decode_entity(&ExternalId::new("panthera_leo"), &response(body))
            .unwrap()
        else {
            panic!("expected found");
        };
        assert_eq!(
            entity.redirects,
            vec![
                RedirectHop::new("panthera_leo", "Panthera leo"),
                RedirectHop::new("Panthera leo", "Lion"),
            ]
        );
        assert_eq!(entity.fields.canonical_id.as_deref(), Some("Lion"));
        assert!(!entity.fields.is_redirect);
    }

    #[test]
    fn test_missing_page() {
        let body = json!({
            "query": { "pages": [{ "ns": 0, "title": "Nope", "missing": true }] }
        });
        assert!(matches!(
            adapter().decode_entity(&ExternalId::new("Nope"), &response(body)).unwrap(),
            EntityFetch::Missing { .. }
        ));
    }

    #[test]
    fn test_broken_chain_is_decode_error() {
        let body = json!({
            "query": {
                "redirects": [{ "from": "A", "to": "B" }],
                "pages": [{ "pageid": 1, "title": "C" }]
            }
        });
        let err = adapter()
            .decode_entity(&ExternalId::new("A"), &response(body))
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_unresolved_redirect_is_stub() {
        let body = json!({
            "query": {
                "redirects": [{ "from": "A", "to": "B" }, { "from": "B", "to": "A" }],
                "pages": [{ "pageid": 1, "title": "A", "redirect": true }]
            }
        });
        let EntityFetch::Found(entity) = adapter()
            .decode_entity(&ExternalId::new("A"), &response(body))
            .unwrap()
        else {
            panic!("expected found");
        };
        assert!(entity.fields.is_redirect);
        assert!(entity.redirects.is_empty());
    }
}
