//! Protocol version parsing and compatibility

use std::fmt;
use std::str::FromStr;

/// A `major.minor` protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Same major line. Minor differences are compatible in both directions.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a major.minor version")]
pub struct VersionParseError(String);

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(err)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(major) || !digits(minor) {
            return Err(err());
        }
        Ok(Self {
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.0".parse::<ProtocolVersion>(), Ok(ProtocolVersion::new(1, 0)));
        assert_eq!("2.17".parse::<ProtocolVersion>(), Ok(ProtocolVersion::new(2, 17)));
        for bad in ["", "1", "1.", ".1", "a.b", "1.2.3", "-1.0", "1.+2"] {
            assert!(bad.parse::<ProtocolVersion>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn test_compatibility_is_major_only() {
        let host = ProtocolVersion::new(1, 3);
        assert!(host.is_compatible_with(&ProtocolVersion::new(1, 0)));
        assert!(host.is_compatible_with(&ProtocolVersion::new(1, 9)));
        assert!(!host.is_compatible_with(&ProtocolVersion::new(2, 3)));
    }
}
