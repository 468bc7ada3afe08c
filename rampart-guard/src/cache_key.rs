//! Deterministic cache keys built from a query's shape.
//!
//! A key is a pure function of the resource class, the relations flag, the
//! non-empty filters (sorted by name) and the pagination parameters. Two
//! queries that differ only in the order their filters were supplied map to
//! the same key; queries that differ in any filter value never do.

use std::collections::BTreeMap;

use rampart_core::{ResourceClass, ValidationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Keys longer than this are replaced by a digest of their normalized form.
pub const MAX_PLAIN_KEY_LEN: usize = 256;

const KEY_PREFIX: &str = "cache";

/// A cacheable query as seen by the cache engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryShape {
    pub resource_class: ResourceClass,
    pub include_relations: bool,
    pub filters: BTreeMap<String, String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl QueryShape {
    pub fn new(resource_class: ResourceClass) -> Self {
        Self {
            resource_class,
            include_relations: false,
            filters: BTreeMap::new(),
            page: None,
            per_page: None,
        }
    }

    pub fn with_relations(mut self, include: bool) -> Self {
        self.include_relations = include;
        self
    }

    /// Add a filter. Empty values are kept here but ignored by the key.
    pub fn filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    pub fn paginate(mut self, page: u32, per_page: u32) -> Self {
        self.page = Some(page);
        self.per_page = Some(per_page);
        self
    }

    /// Reject inputs the engine refuses to cache or compute.
    pub fn validate(&self, max_page_size: u32) -> Result<(), ValidationError> {
        if self.filters.keys().any(|name| name.is_empty()) {
            return Err(ValidationError::InvalidValue {
                field: "filters".to_string(),
                reason: "filter names must not be empty".to_string(),
            });
        }
        if self.page == Some(0) {
            return Err(ValidationError::InvalidValue {
                field: "page".to_string(),
                reason: "pages start at 1".to_string(),
            });
        }
        match self.per_page {
            Some(0) => Err(ValidationError::InvalidValue {
                field: "per_page".to_string(),
                reason: "must be > 0".to_string(),
            }),
            Some(requested) if requested > max_page_size => {
                Err(ValidationError::PageSizeExceeded {
                    requested,
                    max: max_page_size,
                })
            }
            _ => Ok(()),
        }
    }

    /// Filters that participate in the key, in name order.
    pub fn effective_filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::build(self)
    }
}

/// Store key for a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn build(query: &QueryShape) -> Self {
        let head = format!(
            "{}:{}:{}",
            KEY_PREFIX,
            query.resource_class,
            if query.include_relations {
                "with_relations"
            } else {
                "without_relations"
            }
        );

        let mut tail = String::new();
        for (name, value) in query.effective_filters() {
            tail.push(':');
            push_escaped(&mut tail, name);
            tail.push('=');
            push_escaped(&mut tail, value);
        }
        if let Some(page) = query.page {
            tail.push_str(&format!(":page={}", page));
        }
        if let Some(per_page) = query.per_page {
            tail.push_str(&format!(":per_page={}", per_page));
        }

        if head.len() + tail.len() <= MAX_PLAIN_KEY_LEN {
            Self(head + &tail)
        } else {
            let digest = Sha256::digest(tail.as_bytes());
            Self(format!("{}:h={}", head, hex::encode(digest)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escape the separators so `a=b:c` and `a:b=c` can never collide.
fn push_escaped(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if matches!(ch, '\\' | ':' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
}
