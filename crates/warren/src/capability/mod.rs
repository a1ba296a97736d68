//! Capabilities: `name-version` strings advertised by environments.
//!
//! A capability such as `python-3.11` or `gcc-15rc1` names something an
//! environment provides. Requirements are satisfied by any registered
//! capability of the same name whose version is greater or equal, see
//! [`Registry::best_match`].

mod registry;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use warren_common::{WarrenError, WarrenResult};

pub use registry::{Registry, RegistryEntry};

/// One dot-separated component of a version: a number plus an optional
/// trailing suffix (`15rc1` is `15` + `rc1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAtom {
    /// Leading decimal digits; zero when the component has none.
    pub numeric: u64,
    /// Everything after the digits.
    pub suffix: Option<String>,
}

impl VersionAtom {
    fn parse(word: &str) -> Result<Self, String> {
        if word.is_empty() {
            return Err("empty version component".to_string());
        }

        let digits = word.bytes().take_while(u8::is_ascii_digit).count();
        let (number, rest) = word.split_at(digits);
        let numeric = if number.is_empty() {
            0
        } else {
            number
                .parse()
                .map_err(|_| format!("version component {word} is too large"))?
        };
        let suffix = (!rest.is_empty()).then(|| rest.to_string());
        Ok(Self { numeric, suffix })
    }
}

impl Ord for VersionAtom {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric
            .cmp(&other.numeric)
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                // 15 > 15rc
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                // Plain string order; works for alpha < beta < rc, not much else.
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for VersionAtom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed capability id.
///
/// Two capabilities are only comparable if their names match; `partial_cmp`
/// returns `None` otherwise.
#[derive(Debug, Clone)]
pub struct Capability {
    id: String,
    name: String,
    version: Vec<VersionAtom>,
}

impl Capability {
    /// Parse `name-version`.
    ///
    /// The name ends at the last `-` that is followed by a digit; everything
    /// after it is split on `.` into version atoms.
    pub fn parse(id: &str) -> WarrenResult<Self> {
        let invalid = |reason: String| WarrenError::InvalidCapability {
            id: id.to_string(),
            reason,
        };

        let dash = id
            .match_indices('-')
            .map(|(index, _)| index)
            .rev()
            .find(|&index| id[index + 1..].starts_with(|c: char| c.is_ascii_digit()))
            .ok_or_else(|| invalid("no version".to_string()))?;

        let name = &id[..dash];
        if name.is_empty() {
            return Err(invalid("empty name".to_string()));
        }

        let version = id[dash + 1..]
            .split('.')
            .map(VersionAtom::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            version,
        })
    }

    /// The full id as parsed.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version atoms.
    #[must_use]
    pub fn version(&self) -> &[VersionAtom] {
        &self.version
    }

    /// Whether `self` can stand in for `requirement`.
    #[must_use]
    pub fn satisfies(&self, requirement: &Self) -> bool {
        self >= requirement
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl PartialOrd for Capability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.name != other.name {
            return None;
        }
        // Lexicographic: shared atoms first, then the shorter version is less.
        Some(self.version.cmp(&other.version))
    }
}

impl FromStr for Capability {
    type Err = WarrenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cap(id: &str) -> Capability {
        Capability::parse(id).unwrap()
    }

    #[test]
    fn parse_splits_at_last_versioned_dash() {
        let c = cap("foo-bar-1.2rc3");
        assert_eq!(c.name(), "foo-bar");
        assert_eq!(
            c.version(),
            &[
                VersionAtom {
                    numeric: 1,
                    suffix: None
                },
                VersionAtom {
                    numeric: 2,
                    suffix: Some("rc3".to_string())
                },
            ]
        );

        let c = cap("python-3-devel");
        assert_eq!(c.name(), "python");
        assert_eq!(c.version()[0].suffix.as_deref(), Some("-devel"));
    }

    #[test]
    fn parse_rejects_bad_ids() {
        assert!(Capability::parse("novers").is_err());
        assert!(Capability::parse("foo-bar").is_err());
        assert!(Capability::parse("-1.0").is_err());
        assert!(Capability::parse("foo-1..2").is_err());
        assert!(Capability::parse("foo-1.").is_err());
        assert!(Capability::parse("foo-99999999999999999999999").is_err());
    }

    #[test]
    fn non_numeric_atoms() {
        let c = cap("foo-1.beta");
        assert_eq!(
            c.version()[1],
            VersionAtom {
                numeric: 0,
                suffix: Some("beta".to_string())
            }
        );
    }

    #[test]
    fn version_comparison() {
        assert_eq!(
            cap("foo-2.0").partial_cmp(&cap("foo-1.9")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            cap("foo-15").partial_cmp(&cap("foo-15rc1")),
            Some(Ordering::Greater)
        );
        assert_eq!(cap("foo-1.0").partial_cmp(&cap("bar-1.0")), None);
        assert_eq!(
            cap("foo-1.2").partial_cmp(&cap("foo-1.2.0")),
            Some(Ordering::Less)
        );
        assert_eq!(
            cap("foo-1.2").partial_cmp(&cap("foo-1.2")),
            Some(Ordering::Equal)
        );
        assert_eq!(
            cap("foo-1alpha").partial_cmp(&cap("foo-1beta")),
            Some(Ordering::Less)
        );
        assert_eq!(
            cap("foo-10").partial_cmp(&cap("foo-9")),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn mismatched_names_never_satisfy() {
        assert!(!cap("bar-9").satisfies(&cap("foo-1")));
        assert!(!cap("foo-1").satisfies(&cap("bar-1")));
        assert!(cap("foo-1.0").satisfies(&cap("foo-1.0")));
        assert!(cap("foo-1.0.1").satisfies(&cap("foo-1.0")));
        assert!(!cap("foo-1.0rc1").satisfies(&cap("foo-1.0")));
    }

    proptest! {
        #[test]
        fn comparison_is_antisymmetric(
            a in proptest::collection::vec(0u64..20, 1..4),
            b in proptest::collection::vec(0u64..20, 1..4),
        ) {
            let join = |v: &[u64]| v.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
            let a = cap(&format!("pkg-{}", join(&a)));
            let b = cap(&format!("pkg-{}", join(&b)));

            let forward = a.partial_cmp(&b).unwrap();
            let backward = b.partial_cmp(&a).unwrap();
            prop_assert_eq!(forward, backward.reverse());
            prop_assert_eq!(forward == Ordering::Equal, a == b);
        }
    }
}
