//! Name lookup rows for cached entities
//!
//! A [`NameResolver`] turns a fetched entity into searchable name variants.
//! Resolvers are pure; the orchestrator persists whatever they return.

use serde::{Deserialize, Serialize};

use crate::models::{FetchedEntity, Provider};

pub const KIND_CANONICAL: &str = "canonical";
pub const KIND_REDIRECT: &str = "redirect";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameVariant {
    pub original: String,
    pub normalized: String,
    pub kind: String,
}

impl NameVariant {
    pub fn new(original: impl Into<String>, kind: impl Into<String>) -> Self {
        let original = original.into();
        Self {
            normalized: normalize_name(&original),
            original,
            kind: kind.into(),
        }
    }
}

pub trait NameResolver: Send + Sync {
    fn resolve(&self, provider: Provider, entity: &FetchedEntity) -> Vec<NameVariant>;
}

/// Trim, collapse internal whitespace, lowercase
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Emits the canonical name, plus redirect source titles for providers
/// keyed by title. Wikidata and IUCN redirect hops hold ids, not names.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalNameResolver;

impl NameResolver for CanonicalNameResolver {
    fn resolve(&self, provider: Provider, entity: &FetchedEntity) -> Vec<NameVariant> {
        let mut variants: Vec<NameVariant> = Vec::new();

        if let Some(name) = entity.fields.canonical_name.as_deref() {
            if !name.trim().is_empty() {
                variants.push(NameVariant::new(name, KIND_CANONICAL));
            }
        }

        if provider != Provider::Wikipedia {
            return variants;
        }

        for hop in &entity.redirects {
            let candidate = NameVariant::new(hop.from.as_str(), KIND_REDIRECT);
            if candidate.normalized.is_empty()
                || variants.iter().any(|v| v.normalized == candidate.normalized)
            {
                continue;
            }
            variants.push(candidate);
        }

        variants
    }
}
