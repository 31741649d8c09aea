//! Semantic versions as used by `semver_*` audience conditions.
//!
//! Unlike strict SemVer, minor and patch components may be omitted (`"2"`, `"2.1"`). A condition
//! version compares only to its own precision: `"2.1"` as a target matches any `2.1.x`.
use std::{cmp::Ordering, fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use semver::{BuildMetadata, Prerelease};

use super::EvalError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticVersion {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
    build: BuildMetadata,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // major[.minor[.patch[-pre][+build]]], no leading zeros, no whitespace.
        Regex::new(
            r"^(0|[1-9][0-9]*)(?:\.(0|[1-9][0-9]*)(?:\.(0|[1-9][0-9]*)(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?)?)?$",
        )
        .expect("version pattern should compile")
    })
}

impl SemanticVersion {
    pub fn parse(version: &str) -> Result<SemanticVersion, EvalError> {
        let invalid = || EvalError::InvalidSemanticVersion(version.to_owned());

        let captures = version_pattern().captures(version).ok_or_else(invalid)?;
        let number = |i: usize| -> Result<Option<u64>, EvalError> {
            captures
                .get(i)
                .map(|m| m.as_str().parse::<u64>().map_err(|_| invalid()))
                .transpose()
        };

        let major = number(1)?.ok_or_else(invalid)?;
        let minor = number(2)?;
        let patch = number(3)?;
        let pre = match captures.get(4) {
            Some(m) => Prerelease::new(m.as_str()).map_err(|_| invalid())?,
            None => Prerelease::EMPTY,
        };
        let build = match captures.get(5) {
            Some(m) => BuildMetadata::new(m.as_str()).map_err(|_| invalid())?,
            None => BuildMetadata::EMPTY,
        };

        Ok(SemanticVersion {
            major,
            minor,
            patch,
            pre,
            build,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    /// Compare `self` (the user's version) against `target` (the condition's version), only to
    /// the precision present in `target`. Build metadata never affects ordering.
    pub fn compare_to_target(&self, target: &SemanticVersion) -> Ordering {
        let ordering = self.major.cmp(&target.major);
        if ordering != Ordering::Equal {
            return ordering;
        }

        let Some(target_minor) = target.minor else {
            return Ordering::Equal;
        };
        let Some(minor) = self.minor else {
            return Ordering::Less;
        };
        let ordering = minor.cmp(&target_minor);
        if ordering != Ordering::Equal {
            return ordering;
        }

        let Some(target_patch) = target.patch else {
            return Ordering::Equal;
        };
        let Some(patch) = self.patch else {
            return Ordering::Less;
        };
        let ordering = patch.cmp(&target_patch);
        if ordering != Ordering::Equal {
            return ordering;
        }

        match (self.is_prerelease(), target.is_prerelease()) {
            (false, false) => Ordering::Equal,
            // A release sorts above any pre-release of the same version.
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (true, true) => self.pre.cmp(&target.pre),
        }
    }
}

impl FromStr for SemanticVersion {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SemanticVersion::parse(s)
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}
