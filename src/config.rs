//! Registry configuration.
//!
//! Two things can be set for the whole process: whether new pools carve their
//! objects out of chunks, and how many idle bytes all pools together may keep
//! around before a sweep starts releasing memory aggressively. Both can come
//! from the environment:
//!
//! - `MEMPOOLS`: `0` selects the flat strategy, any other integer the chunked
//!   one. `true`/`false`, `yes`/`no` and `on`/`off` are accepted too.
//! - `MEMPOOLS_IDLE_LIMIT`: `unlimited`, or a size such as `524288`, `512K`,
//!   `2MB` or `1G` (binary multiples).

use std::{fmt, str::FromStr};

use crate::error::{ConfigError, Result};

/// Selects the default strategy.
pub const CHUNKING_ENV: &str = "MEMPOOLS";
/// Overrides the default idle limit.
pub const IDLE_LIMIT_ENV: &str = "MEMPOOLS_IDLE_LIMIT";

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

/// Idle bytes every pool together may keep before sweeps get aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleLimit {
    Unlimited,
    Bytes(usize),
}

impl IdleLimit {
    /// Whether `idle_bytes` is over the limit. Never true for [`IdleLimit::Unlimited`].
    pub fn is_exceeded_by(&self, idle_bytes: i64) -> bool {
        match self {
            IdleLimit::Unlimited => false,
            IdleLimit::Bytes(limit) => idle_bytes > *limit as i64,
        }
    }

    /// A zero byte limit means freed objects are given back right away instead
    /// of being kept for reuse.
    pub fn frees_aggressively(&self) -> bool {
        matches!(self, IdleLimit::Bytes(0))
    }
}

impl Default for IdleLimit {
    fn default() -> Self {
        IdleLimit::Bytes(2 * MB)
    }
}

impl fmt::Display for IdleLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleLimit::Unlimited => f.write_str("unlimited"),
            IdleLimit::Bytes(bytes) => write!(f, "{bytes} bytes"),
        }
    }
}

impl FromStr for IdleLimit {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = |reason| ConfigError::InvalidIdleLimit {
            value: value.to_owned(),
            reason,
        };

        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") || trimmed == "-1" {
            return Ok(IdleLimit::Unlimited);
        }

        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);

        if digits.is_empty() {
            return Err(invalid("expected a byte count or `unlimited`"));
        }

        let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KB,
            "M" | "MB" | "MIB" => MB,
            "G" | "GB" | "GIB" => GB,
            _ => return Err(invalid("unknown size suffix")),
        };

        digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_mul(multiplier))
            .map(IdleLimit::Bytes)
            .ok_or_else(|| invalid("size does not fit in usize"))
    }
}

/// Process wide defaults handed to [`crate::Registry::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// New pools use the chunked strategy unless asked otherwise.
    pub chunked_by_default: bool,
    pub idle_limit: IdleLimit,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            chunked_by_default: true,
            idle_limit: IdleLimit::default(),
        }
    }
}

impl RegistryConfig {
    /// Defaults overridden by [`CHUNKING_ENV`] and [`IDLE_LIMIT_ENV`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RegistryConfig::from_env`] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(CHUNKING_ENV) {
            config.chunked_by_default = parse_toggle(CHUNKING_ENV, &value)?;
        }

        if let Some(value) = lookup(IDLE_LIMIT_ENV) {
            config.idle_limit = value.parse()?;
        }

        Ok(config)
    }
}

fn parse_toggle(var: &'static str, value: &str) -> Result<bool> {
    let trimmed = value.trim();

    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(n != 0);
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidToggle {
            var,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn idle_limit_parsing() {
        assert_eq!("unlimited".parse(), Ok(IdleLimit::Unlimited));
        assert_eq!(" Unlimited ".parse(), Ok(IdleLimit::Unlimited));
        assert_eq!("-1".parse(), Ok(IdleLimit::Unlimited));
        assert_eq!("0".parse(), Ok(IdleLimit::Bytes(0)));
        assert_eq!("4096".parse(), Ok(IdleLimit::Bytes(4096)));
        assert_eq!("512K".parse(), Ok(IdleLimit::Bytes(512 * KB)));
        assert_eq!("2MB".parse(), Ok(IdleLimit::Bytes(2 * MB)));
        assert_eq!("1 GiB".parse(), Ok(IdleLimit::Bytes(GB)));
    }

    #[test]
    fn idle_limit_rejects_garbage() {
        assert!(matches!(
            "lots".parse::<IdleLimit>(),
            Err(ConfigError::InvalidIdleLimit { .. })
        ));
        assert!("12 parsecs".parse::<IdleLimit>().is_err());
        assert!("99999999999999999999999".parse::<IdleLimit>().is_err());
    }

    #[test]
    fn idle_limit_checks() {
        let limit = IdleLimit::Bytes(100);
        assert!(!limit.is_exceeded_by(100));
        assert!(limit.is_exceeded_by(101));
        assert!(!limit.frees_aggressively());

        assert!(!IdleLimit::Unlimited.is_exceeded_by(i64::MAX));
        assert!(IdleLimit::Bytes(0).frees_aggressively());
        assert_eq!(IdleLimit::default(), IdleLimit::Bytes(2 * MB));
    }

    #[test]
    fn config_from_lookup() {
        assert_eq!(
            RegistryConfig::from_lookup(lookup(&[])),
            Ok(RegistryConfig::default())
        );

        let config =
            RegistryConfig::from_lookup(lookup(&[(CHUNKING_ENV, "0"), (IDLE_LIMIT_ENV, "unlimited")]))
                .unwrap();
        assert!(!config.chunked_by_default);
        assert_eq!(config.idle_limit, IdleLimit::Unlimited);

        let config = RegistryConfig::from_lookup(lookup(&[(CHUNKING_ENV, "yes")])).unwrap();
        assert!(config.chunked_by_default);
    }

    #[test]
    fn config_reports_bad_toggle() {
        let err = RegistryConfig::from_lookup(lookup(&[(CHUNKING_ENV, "maybe")])).unwrap_err();

        assert_eq!(
            err,
            ConfigError::InvalidToggle {
                var: CHUNKING_ENV,
                value: "maybe".into()
            }
        );
        assert!(err.to_string().contains("MEMPOOLS"));
    }
}
