use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::LimiterKind;

/// Configuration for a single limiter in a [`ModelConfig`]'s chain.
///
/// `time_period` is optional; when omitted it defaults per `kind` (see
/// [`LimiterKind::default_period_secs`]) — 60s for the `*PM` kinds, 86400s
/// for the `*PD` kinds, ignored for `Concurrent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub kind: LimiterKind,
    pub limit: u64,
    #[serde(default)]
    pub time_period: Option<u64>,
}

impl LimiterConfig {
    pub fn new(kind: LimiterKind, limit: u64) -> Self {
        Self {
            kind,
            limit,
            time_period: None,
        }
    }

    pub fn with_period(mut self, period_secs: u64) -> Self {
        self.time_period = Some(period_secs);
        self
    }

    /// Resolve the effective period in seconds, applying `kind`'s default
    /// when `time_period` is unset. `None` for `Concurrent`.
    pub fn resolved_period_secs(&self) -> Option<u64> {
        self.time_period.or_else(|| self.kind.default_period_secs())
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.limit == 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "limiter {:?}: limit must be greater than 0",
                self.kind
            )));
        }
        if let Some(period) = self.time_period {
            if period == 0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "limiter {:?}: time_period must be greater than 0",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for one tenant (`model_id`) and the ordered limiter chain
/// that governs its admission. At least one limiter is required; the list
/// order is the chain's acquisition order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub rate_limiters: Vec<LimiterConfig>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>, rate_limiters: Vec<LimiterConfig>) -> Self {
        Self {
            model_id: model_id.into(),
            rate_limiters,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rate_limiters.is_empty() {
            return Err(EngineError::InvalidConfiguration(format!(
                "model '{}': at least one rate_limiter must be provided",
                self.model_id
            )));
        }
        for limiter in &self.rate_limiters {
            limiter.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_periods_match_kind() {
        assert_eq!(LimiterKind::Rpm.default_period_secs(), Some(60));
        assert_eq!(LimiterKind::Rpd.default_period_secs(), Some(86_400));
        assert_eq!(LimiterKind::Concurrent.default_period_secs(), None);
    }

    #[test]
    fn rejects_zero_limit() {
        let cfg = LimiterConfig::new(LimiterKind::Rpm, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_period() {
        let cfg = LimiterConfig::new(LimiterKind::Rpm, 5).with_period(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_limiter_list() {
        let cfg = ModelConfig::new("gpt", vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let cfg = ModelConfig::new("gpt", vec![LimiterConfig::new(LimiterKind::Rpm, 10)]);
        assert!(cfg.validate().is_ok());
    }
}
