//! Semantic version parsing and minor-pair comparison.
//!
//! Versions look like `v1.2.3` or `1.2.3-rc.1`. Upgrade decisions only ever
//! look at the `(major, minor)` pair; patch releases are always in-place.

use std::fmt;
use std::str::FromStr;

use crate::error::VersionError;

/// A parsed `vMAJOR.MINOR.PATCH[-suffix]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Everything after the first `-` in the patch component.
    pub suffix: Option<String>,
}

impl Version {
    /// Parse a version string. A leading `v` is optional and components
    /// beyond the third are ignored.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let (core, suffix) = match body.split_once('-') {
            Some((core, suffix)) => (core, Some(suffix.to_string())),
            None => (body, None),
        };

        let mut parts = core.split('.');
        let (Some(major), Some(minor), Some(patch)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(VersionError::Malformed(input.to_string()));
        };

        Ok(Self {
            major: parse_component(input, major)?,
            minor: parse_component(input, minor)?,
            patch: parse_component(input, patch)?,
            suffix,
        })
    }

    /// The `(major, minor)` pair used for upgrade decisions.
    pub fn minor_pair(&self) -> (u64, u64) {
        (self.major, self.minor)
    }

    /// The `(major, minor, patch)` triple, ignoring any suffix.
    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

fn parse_component(input: &str, component: &str) -> Result<u64, VersionError> {
    if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionError::Malformed(input.to_string()));
    }
    component
        .parse()
        .map_err(|_| VersionError::Malformed(input.to_string()))
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

/// Returns true when the `(major, minor)` pairs of `a` and `b` differ.
pub fn is_minor_change(a: &str, b: &str) -> Result<bool, VersionError> {
    Ok(Version::parse(a)?.minor_pair() != Version::parse(b)?.minor_pair())
}

/// Returns true when `version`'s `(major, minor)` pair is lexicographically
/// smaller than `than`'s.
///
/// Used to detect a target that is older than what is already deployed:
/// `is_minor_smaller(desired, deployed)`.
pub fn is_minor_smaller(version: &str, than: &str) -> Result<bool, VersionError> {
    Ok(Version::parse(version)?.minor_pair() < Version::parse(than)?.minor_pair())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_parse_with_suffix() {
        let v = Version::parse("v1.2.3-rc.1").unwrap();
        assert_eq!(v.triple(), (1, 2, 3));
        assert_eq!(v.suffix.as_deref(), Some("rc.1"));
        assert_eq!(v.to_string(), "1.2.3-rc.1");
    }

    #[test]
    fn test_parse_without_prefix() {
        let v = Version::parse("1.0.357").unwrap();
        assert_eq!(v.triple(), (1, 0, 357));
        assert_eq!(v.suffix, None);
    }

    #[test]
    fn test_parse_k3s_style_suffix() {
        let v = Version::parse("v1.26.4-k3s1").unwrap();
        assert_eq!(v.triple(), (1, 26, 4));
        assert_eq!(v.suffix.as_deref(), Some("k3s1"));
    }

    #[rstest]
    #[case("")]
    #[case("v1")]
    #[case("1.2")]
    #[case("a.b.c")]
    #[case("1..3")]
    #[case("1.2.x")]
    fn test_parse_rejects_malformed(#[case] input: &str) {
        assert!(Version::parse(input).is_err());
    }

    #[rstest]
    #[case("v1.2.0", "v1.3.0", true)]
    #[case("v1.2.0", "v1.2.9", false)]
    #[case("v1.2.0", "v2.2.0", true)]
    #[case("0.1.0", "v0.1.5-beta", false)]
    fn test_minor_change(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(is_minor_change(a, b).unwrap(), expected);
    }

    #[rstest]
    #[case("v1.2.0", "v1.1.9", false)]
    #[case("v1.1.0", "v1.2.0", true)]
    #[case("v0.1.0", "v0.2.1", true)]
    #[case("v0.1.0", "v0.0.1", false)]
    #[case("v1.9.0", "v2.0.0", true)]
    #[case("v2.0.0", "v1.9.0", false)]
    #[case("v1.2.0", "v1.2.7", false)]
    fn test_minor_smaller(#[case] version: &str, #[case] than: &str, #[case] expected: bool) {
        assert_eq!(is_minor_smaller(version, than).unwrap(), expected);
    }

    proptest! {
        #[test]
        fn prop_display_roundtrip(major in 0u64..1000, minor in 0u64..1000, patch in 0u64..1000) {
            let text = format!("v{major}.{minor}.{patch}");
            let parsed = Version::parse(&text).unwrap();
            prop_assert_eq!(parsed.triple(), (major, minor, patch));
            prop_assert_eq!(Version::parse(&parsed.to_string()).unwrap(), parsed);
        }

        #[test]
        fn prop_smaller_is_strict(a in (0u64..20, 0u64..20), b in (0u64..20, 0u64..20)) {
            let va = format!("{}.{}.0", a.0, a.1);
            let vb = format!("{}.{}.0", b.0, b.1);
            let ab = is_minor_smaller(&va, &vb).unwrap();
            let ba = is_minor_smaller(&vb, &va).unwrap();
            prop_assert!(!(ab && ba));
            prop_assert_eq!(ab || ba, is_minor_change(&va, &vb).unwrap());
        }
    }
}
