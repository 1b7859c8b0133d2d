use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A firmware version in the form `vX.Y.Z` with an optional alphanumeric
/// suffix (`v1.2.0-beta1`). Input may omit the leading `v`; the canonical
/// form always carries it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FirmwareVersion(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid firmware version {0:?}")]
pub struct InvalidVersion(pub String);

impl FirmwareVersion {
    pub fn parse(raw: &str) -> Result<Self, InvalidVersion> {
        let bare = raw.strip_prefix('v').unwrap_or(raw);
        let parsed =
            semver::Version::parse(bare).map_err(|_| InvalidVersion(raw.to_string()))?;

        // The wire format allows a single alphanumeric suffix segment and no
        // build metadata, which is stricter than full semver.
        if !parsed.build.is_empty() {
            return Err(InvalidVersion(raw.to_string()));
        }
        let pre = parsed.pre.as_str();
        if !pre.is_empty() && !pre.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidVersion(raw.to_string()));
        }

        Ok(FirmwareVersion(format!("v{parsed}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The version without the leading `v`, as semver for ordering.
    pub fn semver(&self) -> semver::Version {
        semver::Version::parse(&self.0[1..]).expect("canonical version parses")
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareVersion({})", self.0)
    }
}

impl FromStr for FirmwareVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FirmwareVersion::parse(s)
    }
}

impl<'de> Deserialize<'de> for FirmwareVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        FirmwareVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_v_is_normalized() {
        assert_eq!(FirmwareVersion::parse("1.0.0").unwrap().as_str(), "v1.0.0");
        assert_eq!(FirmwareVersion::parse("v1.0.0").unwrap().as_str(), "v1.0.0");
        assert_eq!(
            FirmwareVersion::parse("v2.1.3-rc1").unwrap().as_str(),
            "v2.1.3-rc1"
        );
    }

    #[test]
    fn test_rejects_malformed_versions() {
        for raw in ["", "v1.0", "1", "v1.0.0-beta.1", "v1.0.0+build", "abc", "v1.0.0-b-1"] {
            assert!(FirmwareVersion::parse(raw).is_err(), "input {raw:?}");
        }
    }

    #[test]
    fn test_semver_ordering() {
        let a = FirmwareVersion::parse("v1.2.0").unwrap();
        let b = FirmwareVersion::parse("v1.10.0").unwrap();
        assert!(a.semver() < b.semver());
    }
}
