use std::fmt;
use std::str::FromStr;

use fm_core::config::ContextConfig;
use serde::{Deserialize, Serialize};

pub const ACTIVE_LIMIT_BYTES: usize = 1024 * 1024;
pub const RECENT_LIMIT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Active,
    Recent,
    Archived,
}

impl ContextTier {
    /// Tier for a payload of `size` bytes under the default limits.
    pub fn for_size(size: usize) -> Self {
        TierLimits::default().classify(size)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTier::Active => "active",
            ContextTier::Recent => "recent",
            ContextTier::Archived => "archived",
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ContextTier::Active),
            "recent" => Ok(ContextTier::Recent),
            "archived" => Ok(ContextTier::Archived),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Inclusive upper bounds of the two fast tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub active: usize,
    pub recent: usize,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            active: ACTIVE_LIMIT_BYTES,
            recent: RECENT_LIMIT_BYTES,
        }
    }
}

impl From<&ContextConfig> for TierLimits {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            active: cfg.active_limit_bytes,
            recent: cfg.recent_limit_bytes,
        }
    }
}

impl TierLimits {
    pub fn classify(&self, size: usize) -> ContextTier {
        if size <= self.active {
            ContextTier::Active
        } else if size <= self.recent {
            ContextTier::Recent
        } else {
            ContextTier::Archived
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_inclusive_on_the_lower_tier() {
        assert_eq!(ContextTier::for_size(0), ContextTier::Active);
        assert_eq!(ContextTier::for_size(1_048_576), ContextTier::Active);
        assert_eq!(ContextTier::for_size(1_048_577), ContextTier::Recent);
        assert_eq!(ContextTier::for_size(10_485_760), ContextTier::Recent);
        assert_eq!(ContextTier::for_size(10_485_761), ContextTier::Archived);
    }

    #[test]
    fn custom_limits_follow_config() {
        let limits = TierLimits {
            active: 10,
            recent: 100,
        };
        assert_eq!(limits.classify(10), ContextTier::Active);
        assert_eq!(limits.classify(11), ContextTier::Recent);
        assert_eq!(limits.classify(101), ContextTier::Archived);
    }
}
