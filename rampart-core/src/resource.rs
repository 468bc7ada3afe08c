//! Resource classes and their TTL / invalidation-tag policies.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::constants::{TTL_LONG_SECS, TTL_SHORT_SECS, TTL_TODAY_SECS};
use crate::error::ValidationError;

static RESOURCE_CLASS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("Invalid resource class regex"));

/// Named category of cacheable query, e.g. `todaySchedule`.
///
/// Deserialization applies the same checks as [`ResourceClass::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceClass(String);

impl ResourceClass {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "resource_class".to_string(),
            });
        }
        if !RESOURCE_CLASS_PATTERN.is_match(&name) {
            return Err(ValidationError::InvalidValue {
                field: "resource_class".to_string(),
                reason: format!("'{}' must be alphanumeric and start with a letter", name),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceClass {
    type Error = ValidationError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl From<ResourceClass> for String {
    fn from(class: ResourceClass) -> Self {
        class.0
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// TTL and invalidation tags for one resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl ResourcePolicy {
    pub fn new<I, S>(ttl: Duration, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ttl,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

const SCHEDULE_TAGS: [&str; 3] = ["schedules", "academic", "timetable"];
const MASTER_TAGS: [&str; 2] = ["academic", "master"];

/// Per-resource-class policy table. Classes not listed get the default.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCatalog {
    policies: HashMap<String, ResourcePolicy>,
    default_policy: ResourcePolicy,
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        let short = Duration::from_secs(TTL_SHORT_SECS);
        let long = Duration::from_secs(TTL_LONG_SECS);

        let mut policies = HashMap::new();
        policies.insert(
            "todaySchedule".to_string(),
            ResourcePolicy::new(Duration::from_secs(TTL_TODAY_SECS), SCHEDULE_TAGS),
        );
        for name in ["schedules", "weeklySchedule"] {
            policies.insert(name.to_string(), ResourcePolicy::new(short, SCHEDULE_TAGS));
        }
        policies.insert(
            "scheduleStats".to_string(),
            ResourcePolicy::new(short * 2, SCHEDULE_TAGS),
        );
        for name in ["subjects", "teachers", "classrooms", "classes", "users"] {
            policies.insert(name.to_string(), ResourcePolicy::new(long, MASTER_TAGS));
        }

        Self {
            policies,
            default_policy: ResourcePolicy::new(short, std::iter::empty::<String>()),
        }
    }
}

impl ResourceCatalog {
    /// Catalog with no classes; everything gets `default_policy`.
    pub fn empty(default_policy: ResourcePolicy) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy,
        }
    }

    pub fn with_policy(mut self, class: &str, policy: ResourcePolicy) -> Self {
        self.policies.insert(class.to_string(), policy);
        self
    }

    /// Override only the TTL, keeping tags (or the default's tags).
    pub fn set_ttl(&mut self, class: &str, ttl: Duration) {
        let tags = self.policy(class).tags.clone();
        self.policies
            .insert(class.to_string(), ResourcePolicy { ttl, tags });
    }

    pub fn policy(&self, class: &str) -> &ResourcePolicy {
        self.policies.get(class).unwrap_or(&self.default_policy)
    }

    pub fn ttl(&self, class: &ResourceClass) -> Duration {
        self.policy(class.as_str()).ttl
    }

    pub fn tags(&self, class: &ResourceClass) -> &BTreeSet<String> {
        &self.policy(class.as_str()).tags
    }

    pub fn classes(&self) -> impl Iterator<Item = (&str, &ResourcePolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_class_validation() {
        assert!(ResourceClass::new("todaySchedule").is_ok());
        assert!(ResourceClass::new("schedule_stats2").is_ok());
        assert!(matches!(
            ResourceClass::new(""),
            Err(ValidationError::RequiredFieldMissing { .. })
        ));
        assert!(ResourceClass::new("9lives").is_err());
        assert!(ResourceClass::new("with:colon").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let class: ResourceClass = serde_json::from_str(r#""weeklySchedule""#).unwrap();
        assert_eq!(class.as_str(), "weeklySchedule");
        assert_eq!(serde_json::to_string(&class).unwrap(), r#""weeklySchedule""#);

        assert!(serde_json::from_str::<ResourceClass>(r#""a:b""#).is_err());
        assert!(serde_json::from_str::<ResourceClass>(r#""""#).is_err());
    }

    #[test]
    fn test_default_catalog_ttls() {
        let catalog = ResourceCatalog::default();
        let class = |n: &str| ResourceClass::new(n).unwrap();

        assert_eq!(catalog.ttl(&class("todaySchedule")), Duration::from_secs(120));
        assert_eq!(catalog.ttl(&class("weeklySchedule")), Duration::from_secs(300));
        assert_eq!(catalog.ttl(&class("scheduleStats")), Duration::from_secs(600));
        assert_eq!(catalog.ttl(&class("teachers")), Duration::from_secs(1800));
        assert_eq!(catalog.ttl(&class("somethingElse")), Duration::from_secs(300));
    }

    #[test]
    fn test_catalog_tags() {
        let catalog = ResourceCatalog::default();
        let schedules = catalog.tags(&ResourceClass::new("schedules").unwrap());
        assert!(schedules.contains("timetable"));
        assert!(catalog
            .tags(&ResourceClass::new("unknown").unwrap())
            .is_empty());
    }

    #[test]
    fn test_set_ttl_keeps_tags() {
        let mut catalog = ResourceCatalog::default();
        catalog.set_ttl("todaySchedule", Duration::from_secs(150));
        let policy = catalog.policy("todaySchedule");
        assert_eq!(policy.ttl, Duration::from_secs(150));
        assert!(policy.tags.contains("schedules"));
    }
}
