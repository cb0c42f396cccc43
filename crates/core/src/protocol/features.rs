//! Feature flags and negotiation
//!
//! Features travel as strings so peers can add new ones without a schema
//! break, but they are parsed into [`Feature`] on receipt. Strings this build
//! does not know become [`Feature::Unknown`], which never survives negotiation.

use crate::error::RequestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Readiness check
    Health,
    /// Asset refresh / import / move / delete
    AssetsBasic,
    /// Player and bundle builds
    BuildMinimal,
    /// Host log lines pushed as events
    LogEvents,
    /// Long-running operation lifecycle pushed as events
    OperationEvents,
    /// A feature string this build does not recognize
    Unknown(String),
}

impl Feature {
    /// Every feature this build knows about
    pub const KNOWN: [Feature; 5] = [
        Feature::Health,
        Feature::AssetsBasic,
        Feature::BuildMinimal,
        Feature::LogEvents,
        Feature::OperationEvents,
    ];

    pub fn parse(name: &str) -> Self {
        match name {
            "health" => Feature::Health,
            "assets.basic" => Feature::AssetsBasic,
            "build.minimal" => Feature::BuildMinimal,
            "events.log" => Feature::LogEvents,
            "events.operation" => Feature::OperationEvents,
            other => Feature::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Feature::Health => "health",
            Feature::AssetsBasic => "assets.basic",
            Feature::BuildMinimal => "build.minimal",
            Feature::LogEvents => "events.log",
            Feature::OperationEvents => "events.operation",
            Feature::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Feature::Unknown(_))
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Feature::parse(s))
    }
}

/// An immutable set of features. Only known features are ever stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All features this build supports
    pub fn all() -> Self {
        Self(Feature::KNOWN.iter().cloned().collect())
    }

    /// Parse wire strings, discarding unknown ones
    pub fn from_wire<S: AsRef<str>>(names: &[S]) -> Self {
        names
            .iter()
            .map(|name| Feature::parse(name.as_ref()))
            .collect()
    }

    pub fn to_wire(&self) -> Vec<String> {
        self.0.iter().map(|f| f.as_str().to_string()).collect()
    }

    /// Features present in both sets
    pub fn negotiate(&self, requested: &FeatureSet) -> FeatureSet {
        FeatureSet(self.0.intersection(&requested.0).cloned().collect())
    }

    pub fn contains(&self, feature: &Feature) -> bool {
        feature.is_known() && self.0.contains(feature)
    }

    /// Fail fast when a handler needs a feature the connection was not granted
    pub fn require(&self, feature: Feature) -> Result<(), RequestError> {
        if self.contains(&feature) {
            Ok(())
        } else {
            Err(RequestError::FeatureNotNegotiated {
                feature: feature.as_str().to_string(),
            })
        }
    }

    pub fn is_subset(&self, other: &FeatureSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().filter(Feature::is_known).collect())
    }
}

impl From<Vec<String>> for FeatureSet {
    fn from(names: Vec<String>) -> Self {
        Self::from_wire(&names)
    }
}

impl From<FeatureSet> for Vec<String> {
    fn from(set: FeatureSet) -> Self {
        set.to_wire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for feature in Feature::KNOWN {
            assert_eq!(Feature::parse(feature.as_str()), feature);
        }
        assert_eq!(
            Feature::parse("teleport"),
            Feature::Unknown("teleport".to_string())
        );
    }

    #[test]
    fn test_negotiation_is_subset_of_both_sides() {
        let host = FeatureSet::from_wire(&["health", "assets.basic", "events.log"]);
        let client = FeatureSet::from_wire(&["health", "build.minimal", "events.log", "teleport"]);

        let accepted = host.negotiate(&client);
        assert!(accepted.is_subset(&host));
        assert!(accepted.is_subset(&client));
        assert_eq!(accepted.to_wire(), vec!["health", "events.log"]);
    }

    #[test]
    fn test_unknown_and_empty_requests_are_tolerated() {
        let host = FeatureSet::all();
        assert!(host.negotiate(&FeatureSet::empty()).is_empty());
        assert!(
            host.negotiate(&FeatureSet::from_wire(&["x", "y.z"]))
                .is_empty()
        );
    }

    #[test]
    fn test_require_reports_feature_not_negotiated() {
        let granted = FeatureSet::from_wire(&["health"]);
        assert!(granted.require(Feature::Health).is_ok());
        assert_eq!(
            granted.require(Feature::BuildMinimal),
            Err(RequestError::FeatureNotNegotiated {
                feature: "build.minimal".to_string()
            })
        );
        assert!(!granted.contains(&Feature::Unknown("health".to_string())));
    }
}
