//! MTA-STS policy model: parsing, validation, and MX matching

use super::StsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound for `max_age`: one year, per RFC 8461 section 3.2.
const MAX_MAX_AGE: Duration = Duration::from_secs(31_557_600);

/// A parsed MTA-STS policy (RFC 8461 section 3.2).
///
/// The serde annotations define the cache payload encoding; `max_age` is
/// persisted as a nanosecond duration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    pub mode: Mode,
    #[serde(rename = "mx")]
    pub mxs: Vec<String>,
    #[serde(with = "duration_nanos")]
    pub max_age: Duration,
}

/// The mode of a policy.
///
/// Unknown tags are carried verbatim in `Other` so that parsing never
/// validates; `Policy::check` is where they get rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    Enforce,
    Testing,
    None,
    Other(String),
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Other(String::new())
    }
}

impl From<String> for Mode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "enforce" => Mode::Enforce,
            "testing" => Mode::Testing,
            "none" => Mode::None,
            _ => Mode::Other(s),
        }
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Enforce => write!(f, "enforce"),
            Mode::Testing => write!(f, "testing"),
            Mode::None => write!(f, "none"),
            Mode::Other(s) => write!(f, "{}", s),
        }
    }
}

impl Policy {
    /// Parse the text representation of a policy, as served over HTTPS.
    ///
    /// Lines without a `:` and unrecognized keys are ignored; a bad
    /// `max_age` leaves 0, which `check` will reject. Parsing never
    /// validates, so the result may well be an invalid policy.
    pub fn parse(raw: &[u8]) -> Policy {
        let mut p = Policy::default();

        for line in String::from_utf8_lossy(raw).lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            let key = key.trim();
            let value = value.trim();

            match key {
                "version" => p.version = value.to_string(),
                "mode" => p.mode = Mode::from(value.to_string()),
                "max_age" => {
                    let secs: u64 = value.parse().unwrap_or(0);
                    p.max_age = Duration::from_secs(secs);
                }
                "mx" => p.mxs.push(value.to_string()),
                _ => {}
            }
        }

        p
    }

    /// Check that the policy contents are valid.
    ///
    /// Applied to freshly parsed policies and again to policies loaded
    /// from the cache.
    pub fn check(&self) -> Result<(), StsError> {
        if self.version != "STSv1" {
            return Err(StsError::UnknownVersion);
        }

        // A zero max_age is invalid (it may also be a parse failure), and
        // so is anything over one year, per RFC 8461 section 3.2.
        if self.max_age.is_zero() || self.max_age > MAX_MAX_AGE {
            return Err(StsError::InvalidMaxAge);
        }

        if matches!(self.mode, Mode::Other(_)) {
            return Err(StsError::InvalidMode);
        }

        // The "mx" field is required; a policy without it is invalid.
        if self.mxs.is_empty() {
            return Err(StsError::InvalidMx);
        }

        Ok(())
    }

    /// Check whether the given MX is allowed, according to the policy
    /// (RFC 8461 section 4.1).
    ///
    /// Modes other than `enforce` never block delivery.
    pub fn mx_is_allowed(&self, mx: &str) -> bool {
        if self.mode != Mode::Enforce {
            return true;
        }

        self.mxs.iter().any(|pattern| match_domain(mx, pattern))
    }
}

/// Check whether `domain` matches `pattern`, per RFC 8461 section 4.1
/// (itself based on RFC 6125 section 6.4): byte equality after
/// normalization, or a `*.` pattern matching exactly one leading label.
fn match_domain(domain: &str, pattern: &str) -> bool {
    let (Ok(domain), Ok(pattern)) = (domain_to_ascii(domain), domain_to_ascii(pattern)) else {
        // Callers are expected to have normalized already; a failure here
        // is a non-match, not an error.
        return false;
    };

    if domain == pattern {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some((_, tail)) = domain.split_once('.') {
            if tail == suffix {
                return true;
            }
        }
    }

    false
}

/// Normalize a domain to its ASCII (IDNA) form: lowercase, trailing dot
/// stripped.
pub fn domain_to_ascii(domain: &str) -> Result<String, StsError> {
    let domain = domain.strip_suffix('.').unwrap_or(domain).to_lowercase();
    idna::domain_to_ascii(&domain).map_err(|_| StsError::InvalidDomain(domain.clone()))
}

mod duration_nanos {
    //! Serialize a `Duration` as integer nanoseconds.

    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
