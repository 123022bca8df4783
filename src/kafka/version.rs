use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tracing::{warn, Dispatch};

/// Broker protocol version, passed to librdkafka as `broker.version.fallback`.
///
/// Releases from 1.0 on use three components (`2.7.2`); the 0.x line uses
/// four (`0.10.2.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KafkaVersion {
    parts: [u16; 4],
}

impl KafkaVersion {
    pub const DEFAULT: KafkaVersion = KafkaVersion { parts: [2, 7, 2, 0] };

    /// Parses `hint`, falling back to [`DEFAULT`](Self::DEFAULT) when it is empty or invalid.
    /// An invalid hint is reported on `console` as a warning.
    pub fn resolve(hint: &str, console: &Dispatch) -> KafkaVersion {
        let hint = hint.trim();
        if hint.is_empty() {
            return Self::DEFAULT;
        }

        match hint.parse() {
            Ok(version) => version,
            Err(e) => {
                tracing::dispatcher::with_default(console, || {
                    warn!(
                        error = %e,
                        "cannot parse kafka version from {} will use default {}: err={}",
                        hint,
                        Self::DEFAULT,
                        e
                    );
                });
                Self::DEFAULT
            }
        }
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for KafkaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid kafka version '{}'", s));

        let numbers = s
            .split('.')
            .map(|part| part.parse::<u16>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;

        let expected = if numbers.first() == Some(&0) { 4 } else { 3 };
        if numbers.len() != expected {
            return Err(invalid());
        }

        let mut parts = [0u16; 4];
        parts[..numbers.len()].copy_from_slice(&numbers);
        Ok(KafkaVersion { parts })
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.parts;
        if major == 0 {
            write!(f, "{}.{}.{}.{}", major, minor, patch, build)
        } else {
            write!(f, "{}.{}.{}", major, minor, patch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modern_version() {
        let version: KafkaVersion = "3.6.1".parse().unwrap();
        assert_eq!(version.to_string(), "3.6.1");
        assert!(version > KafkaVersion::DEFAULT);
    }

    #[test]
    fn test_parse_legacy_version() {
        let version: KafkaVersion = "0.10.2.1".parse().unwrap();
        assert_eq!(version.to_string(), "0.10.2.1");
        assert!(version < KafkaVersion::DEFAULT);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "2.7", "2.7.2.0", "0.10.2", "v2.7.2", "2..7", "2.x.1"] {
            assert!(input.parse::<KafkaVersion>().is_err(), "{} should be rejected", input);
        }
    }

    #[test]
    fn test_resolve_defaults_on_empty_or_invalid() {
        let console = Dispatch::none();
        assert_eq!(KafkaVersion::resolve("", &console), KafkaVersion::DEFAULT);
        assert_eq!(KafkaVersion::resolve("  ", &console), KafkaVersion::DEFAULT);
        assert_eq!(KafkaVersion::resolve("bogus", &console), KafkaVersion::DEFAULT);
        assert_eq!(KafkaVersion::resolve("2.8.0", &console).to_string(), "2.8.0");
        assert_eq!(KafkaVersion::DEFAULT.to_string(), "2.7.2");
    }
}
