//! Tag policy configuration.
//!
//! Historical behavior disagreed on how tags flow between a cover letter and
//! the patches of its series, and on how contributor values are compared.
//! Both choices are explicit here and default to the cover-to-patches,
//! exact-match behavior.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How tags flow between a cover letter and the patches of its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropagationPolicy {
    /// Every submission aggregates only its own body and comments.
    None,
    /// Patches also aggregate their series' cover letter body and comments.
    #[default]
    CoverToPatches,
    /// As `CoverToPatches`, and the cover letter also aggregates every patch
    /// in its series. The cover is recomputed when series membership changes,
    /// not on every patch-side edit.
    Bidirectional,
}

impl PropagationPolicy {
    /// Whether a patch's aggregate includes its cover letter's tags.
    pub fn cover_flows_to_patches(&self) -> bool {
        matches!(self, Self::CoverToPatches | Self::Bidirectional)
    }

    /// Whether a cover letter's aggregate includes its patches' tags.
    pub fn patches_flow_to_cover(&self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

impl std::fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::CoverToPatches => write!(f, "cover-to-patches"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

impl std::str::FromStr for PropagationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "none" | "off" => Ok(Self::None),
            "cover-to-patches" | "cover" => Ok(Self::CoverToPatches),
            "bidirectional" | "both" => Ok(Self::Bidirectional),
            _ => Err(format!("Invalid propagation policy: {}", s)),
        }
    }
}

/// How two contributor values are compared when deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributorMatching {
    /// Case-sensitive equality of the trimmed value.
    #[default]
    Exact,
    /// Compare with the `<address>` part lower-cased and runs of whitespace
    /// collapsed. The first spelling seen is the one kept.
    NormalizeEmail,
}

impl std::fmt::Display for ContributorMatching {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::NormalizeEmail => write!(f, "normalize-email"),
        }
    }
}

impl std::str::FromStr for ContributorMatching {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "exact" => Ok(Self::Exact),
            "normalize-email" | "normalize" => Ok(Self::NormalizeEmail),
            _ => Err(format!("Invalid contributor matching: {}", s)),
        }
    }
}

/// Policy applied by aggregation and propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagPolicy {
    pub propagation: PropagationPolicy,
    pub contributor_matching: ContributorMatching,
}

impl TagPolicy {
    /// Create a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Other values |
    /// |----------|---------|-------------|
    /// | `PATCHTAG_PROPAGATION` | `cover-to-patches` | `none`, `bidirectional` |
    /// | `PATCHTAG_CONTRIBUTOR_MATCHING` | `exact` | `normalize-email` |
    ///
    /// An unparsable value is a [`Error::Config`].
    pub fn from_env() -> Result<Self> {
        let mut policy = Self::default();

        if let Ok(v) = std::env::var("PATCHTAG_PROPAGATION") {
            policy.propagation = v.parse().map_err(Error::Config)?;
        }
        if let Ok(v) = std::env::var("PATCHTAG_CONTRIBUTOR_MATCHING") {
            policy.contributor_matching = v.parse().map_err(Error::Config)?;
        }

        Ok(policy)
    }

    /// Set the propagation policy.
    pub fn with_propagation(mut self, propagation: PropagationPolicy) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the contributor matching rule.
    pub fn with_contributor_matching(mut self, matching: ContributorMatching) -> Self {
        self.contributor_matching = matching;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = TagPolicy::default();
        assert_eq!(policy.propagation, PropagationPolicy::CoverToPatches);
        assert_eq!(policy.contributor_matching, ContributorMatching::Exact);
    }

    #[test]
    fn test_propagation_parse() {
        assert_eq!(
            "none".parse::<PropagationPolicy>().unwrap(),
            PropagationPolicy::None
        );
        assert_eq!(
            "Cover_To_Patches".parse::<PropagationPolicy>().unwrap(),
            PropagationPolicy::CoverToPatches
        );
        assert_eq!(
            "bidirectional".parse::<PropagationPolicy>().unwrap(),
            PropagationPolicy::Bidirectional
        );
        assert!("sideways".parse::<PropagationPolicy>().is_err());
    }

    #[test]
    fn test_propagation_display_parses_back() {
        for p in [
            PropagationPolicy::None,
            PropagationPolicy::CoverToPatches,
            PropagationPolicy::Bidirectional,
        ] {
            assert_eq!(p.to_string().parse::<PropagationPolicy>().unwrap(), p);
        }
    }

    #[test]
    fn test_flow_directions() {
        assert!(!PropagationPolicy::None.cover_flows_to_patches());
        assert!(PropagationPolicy::CoverToPatches.cover_flows_to_patches());
        assert!(!PropagationPolicy::CoverToPatches.patches_flow_to_cover());
        assert!(PropagationPolicy::Bidirectional.patches_flow_to_cover());
    }

    #[test]
    fn test_matching_parse() {
        assert_eq!(
            "normalize_email".parse::<ContributorMatching>().unwrap(),
            ContributorMatching::NormalizeEmail
        );
        assert!("fuzzy".parse::<ContributorMatching>().is_err());
    }

    #[test]
    fn test_builder() {
        let policy = TagPolicy::new()
            .with_propagation(PropagationPolicy::None)
            .with_contributor_matching(ContributorMatching::NormalizeEmail);
        assert_eq!(policy.propagation, PropagationPolicy::None);
        assert_eq!(
            policy.contributor_matching,
            ContributorMatching::NormalizeEmail
        );
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&PropagationPolicy::CoverToPatches).unwrap();
        assert_eq!(json, "\"cover-to-patches\"");
    }
}
