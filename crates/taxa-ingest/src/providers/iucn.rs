//! IUCN Red List: taxon lookups by SIS id

use serde_json::Value;

use super::{required_str, ProviderAdapter};
use crate::client::{FetchRequest, FetchedResponse};
use crate::config::ProviderConfig;
use crate::error::{FetchError, IngestError};
use crate::models::{EntityFetch, EntityFields, ExternalId, FetchedEntity, Provider, RedirectHop};

pub struct IucnAdapter {
    base_url: String,
}

impl IucnAdapter {
    /// Requests carry the bearer token configured on the retry client
    pub fn new(config: &ProviderConfig) -> Result<Self, IngestError> {
        if config.auth_token.is_none() {
            return Err(IngestError::config("TAXA_IUCN_AUTH_TOKEN is required for IUCN ingestion"));
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn is_sis_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

fn non_null_str<'a>(taxon: &'a Value, key: &str) -> Option<&'a str> {
    taxon.get(key)?.as_str().filter(|s| !s.is_empty())
}

impl ProviderAdapter for IucnAdapter {
    fn provider(&self) -> Provider {
        Provider::Iucn
    }

    fn entity_request(&self, id: &ExternalId) -> Result<FetchRequest, FetchError> {
        if !is_sis_id(id.as_str()) {
            return Err(FetchError::InvalidRequest(format!("'{}' is not an IUCN SIS id", id)));
        }
        Ok(FetchRequest::get(format!("{}/taxa/sis/{}", self.base_url, id)).accept("application/json"))
    }

    fn decode_entity(&self, id: &ExternalId, response: &FetchedResponse) -> Result<EntityFetch, FetchError> {
        let document: Value = response.json(id.as_str())?;
        let taxon = document
            .get("taxon")
            .filter(|t| t.is_object())
            .ok_or_else(|| FetchError::decode(id.as_str(), "missing taxon object"))?;

        let sis_id = match taxon.get("sis_id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if is_sis_id(s) => s.clone(),
            _ => return Err(FetchError::decode(id.as_str(), "missing field /taxon/sis_id")),
        };
        let scientific_name = required_str(taxon, "/scientific_name", id)?;

        let rank = if non_null_str(taxon, "subpopulation_name").is_some() {
            "subpopulation"
        } else if non_null_str(taxon, "infra_name").is_some() {
            "infraspecies"
        } else {
            "species"
        };

        // A synonym id answers with the accepted taxon
        let redirects = if sis_id != id.as_str() {
            vec![RedirectHop::new(id.as_str(), sis_id.as_str())]
        } else {
            Vec::new()
        };

        Ok(EntityFetch::Found(FetchedEntity {
            payload: response.body.clone(),
            fields: EntityFields {
                canonical_id: Some(sis_id),
                canonical_name: Some(scientific_name.to_string()),
                parent_id: non_null_str(taxon, "genus_name").map(str::to_string),
                rank: Some(rank.to_string()),
                is_redirect: false,
            },
            redirects,
        }))
    }
}
