//! Fixed lease period policy deciding how long a grant or renewal lasts.

use crate::lease::{LeaseError, ANY, FOREVER};
use crate::utils::RiverError;

/// Grantor-side duration policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Duration granted for an `ANY` request, in ms.
    pub default_duration_ms: i64,

    /// Upper bound on any grant, in ms; `FOREVER` for no bound.
    pub max_duration_ms: i64,

    /// If true, requests above the maximum are denied instead of clamped.
    pub deny_over_max: bool,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy {
            default_duration_ms: 300_000,
            max_duration_ms: 3_600_000,
            deny_over_max: false,
        }
    }
}

impl LeasePolicy {
    /// Composes a policy from defaults overridden by an optional TOML string.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, RiverError> {
        let policy = parsed_config!(config_str => LeasePolicy;
                                    default_duration_ms, max_duration_ms,
                                    deny_over_max)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Checks policy sanity.
    pub fn validate(&self) -> Result<(), RiverError> {
        if self.default_duration_ms <= 0 {
            return logged_err!(
                "invalid default lease duration {}",
                self.default_duration_ms
            );
        }
        if self.max_duration_ms < self.default_duration_ms {
            return logged_err!(
                "max lease duration {} below default {}",
                self.max_duration_ms,
                self.default_duration_ms
            );
        }
        Ok(())
    }

    /// Decides the duration to grant for a request, in ms.
    pub fn grant(&self, requested: i64) -> Result<i64, LeaseError> {
        if requested == ANY {
            return Ok(self.default_duration_ms);
        }
        if requested < 0 {
            return Err(LeaseError::Denied(format!(
                "negative duration {} requested",
                requested
            )));
        }
        if requested == FOREVER && self.max_duration_ms == FOREVER {
            return Ok(FOREVER);
        }
        if requested > self.max_duration_ms {
            if self.deny_over_max {
                return Err(LeaseError::Denied(format!(
                    "duration {} exceeds maximum {}",
                    requested, self.max_duration_ms
                )));
            }
            return Ok(self.max_duration_ms);
        }
        Ok(requested)
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    #[test]
    fn grant_rules() {
        let policy = LeasePolicy {
            default_duration_ms: 1000,
            max_duration_ms: 5000,
            deny_over_max: false,
        };
        assert_eq!(policy.grant(ANY), Ok(1000));
        assert_eq!(policy.grant(0), Ok(0));
        assert_eq!(policy.grant(4000), Ok(4000));
        assert_eq!(policy.grant(9000), Ok(5000));
        assert_eq!(policy.grant(FOREVER), Ok(5000));
        assert!(matches!(policy.grant(-7), Err(LeaseError::Denied(_))));
    }

    #[test]
    fn deny_over_max() {
        let policy = LeasePolicy {
            deny_over_max: true,
            ..Default::default()
        };
        assert!(matches!(
            policy.grant(policy.max_duration_ms + 1),
            Err(LeaseError::Denied(_))
        ));
    }

    #[test]
    fn unbounded_forever() {
        let policy = LeasePolicy {
            default_duration_ms: 1000,
            max_duration_ms: FOREVER,
            deny_over_max: true,
        };
        assert_eq!(policy.grant(FOREVER), Ok(FOREVER));
    }

    #[test]
    fn parse_policy() -> Result<(), RiverError> {
        let policy = LeasePolicy::from_config_str(Some(
            "default_duration_ms = 2000\ndeny_over_max = true",
        ))?;
        assert_eq!(policy.default_duration_ms, 2000);
        assert_eq!(policy.max_duration_ms, 3_600_000);
        assert!(policy.deny_over_max);
        assert!(LeasePolicy::from_config_str(Some(
            "default_duration_ms = -5"
        ))
        .is_err());
        Ok(())
    }
}
