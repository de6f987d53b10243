// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::{anyhow, bail, Error, Result};

/// One dot-separated version component: an optional number followed by an
/// optional suffix, e.g. `15`, `15rc`, `2-rc1`.
#[derive(Clone, Debug, Hash)]
pub struct VersionAtom {
    number: Option<u64>,
    suffix: String,
}

impl VersionAtom {
    pub fn number(&self) -> Option<u64> {
        self.number
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl Display for VersionAtom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(number) = self.number {
            write!(f, "{}", number)?;
        }
        write!(f, "{}", self.suffix)
    }
}

impl PartialEq for VersionAtom {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionAtom {}

impl PartialOrd for VersionAtom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionAtom {
    fn cmp(&self, other: &Self) -> Ordering {
        let number_cmp = self.number.cmp(&other.number);
        if number_cmp != Ordering::Equal {
            return number_cmp;
        }
        // A bare number outranks the same number with any suffix, so a final
        // release sorts above its release candidates: 15 > 15rc.
        match (self.suffix.is_empty(), other.suffix.is_empty()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => self.suffix.cmp(&other.suffix),
        }
    }
}

/// A capability version: the dot-separated atoms after the name.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    atoms: Vec<VersionAtom>,
}

impl Version {
    pub fn try_new(text: &str) -> Result<Self> {
        let (_, version) = parser::parse_version(text).map_err(|e| e.to_owned())?;
        Ok(version)
    }

    pub fn atoms(&self) -> &[VersionAtom] {
        &self.atoms
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Version::try_new(text)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", atom)?;
        }
        Ok(())
    }
}

/// A capability: a name plus a version, e.g. `python3-devel-3.9.2`.
///
/// The version starts at the first `-` that is followed by a digit; the name
/// is everything before it and may itself contain `-`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Capability {
    name: String,
    version: Version,
}

impl Capability {
    pub fn try_new(text: &str) -> Result<Self> {
        let (name, version_text) = split_name_version(text);
        if name.is_empty() {
            bail!("Capability {:?} has an empty name", text);
        }
        let version = match version_text {
            Some(version_text) => Version::try_new(version_text)
                .map_err(|e| anyhow!("Capability {:?}: {:#}", text, e))?,
            None => Version::default(),
        };
        Ok(Self {
            name: name.to_owned(),
            version,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether this capability fulfils `requirement`: the names are equal and
    /// this version is at least the required one.
    pub fn satisfies(&self, requirement: &Capability) -> bool {
        self.name == requirement.name && self.version >= requirement.version
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Capability::try_new(text)
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.version.atoms.is_empty() {
            write!(f, "-{}", self.version)?;
        }
        Ok(())
    }
}

fn split_name_version(text: &str) -> (&str, Option<&str>) {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'-' && bytes.get(i + 1).map_or(false, u8::is_ascii_digit) {
            return (&text[..i], Some(&text[i + 1..]));
        }
    }
    (text, None)
}

mod parser {
    use nom::{
        bytes::complete::take_while,
        character::complete::{char, digit1},
        combinator::{eof, opt},
        multi::separated_list1,
        IResult,
    };

    use super::{Version, VersionAtom};

    fn parse_atom(input: &str) -> IResult<&str, VersionAtom> {
        let (input, digits) = opt(digit1)(input)?;
        let (input, suffix) = take_while(|c| c != '.')(input)?;
        let number = digits.map(|d: &str| d.parse().unwrap_or(u64::MAX));
        Ok((
            input,
            VersionAtom {
                number,
                suffix: suffix.to_owned(),
            },
        ))
    }

    pub(super) fn parse_version(input: &str) -> IResult<&str, Version> {
        let (input, atoms) = separated_list1(char('.'), parse_atom)(input)?;
        let (input, _) = eof(input)?;
        Ok((input, Version { atoms }))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cap(text: &str) -> Capability {
        Capability::try_new(text).unwrap()
    }

    #[test]
    fn parses_name_and_version() {
        let c = cap("python3-devel-3.9.2");
        assert_eq!(c.name(), "python3-devel");
        assert_eq!(c.version().to_string(), "3.9.2");

        let c = cap("python3-devel-3.9.2-rc1");
        assert_eq!(c.name(), "python3-devel");
        assert_eq!(c.version().atoms().len(), 3);

        let c = cap("bash");
        assert_eq!(c.name(), "bash");
        assert!(c.version().atoms().is_empty());
    }

    #[test]
    fn display_round_trips() {
        for text in ["python3-devel-3.9.2", "python3-devel-3.8.0rc", "gcc-12", "bash"] {
            assert_eq!(cap(text).to_string(), text);
        }
    }

    #[test]
    fn rejects_empty_name() {
        assert!(Capability::try_new("-3.9").is_err());
    }

    #[test]
    fn release_beats_release_candidate() {
        assert!(cap("x-15").version() > cap("x-15rc").version());
        assert!(cap("x-3.8.1").version() > cap("x-3.8.0rc").version());
    }

    #[test]
    fn numeric_atoms_compare_numerically() {
        assert!(cap("x-3.10").version() > cap("x-3.9").version());
        assert!(cap("x-10").version() > cap("x-9").version());
    }

    #[test]
    fn satisfies_requires_equal_name_and_version_at_least() {
        let requirement = cap("python3-devel-3.8");
        assert!(cap("python3-devel-3.8").satisfies(&requirement));
        assert!(cap("python3-devel-3.8.1").satisfies(&requirement));
        assert!(!cap("python3-devel-3.7.9").satisfies(&requirement));
        assert!(!cap("python2-devel-3.8.1").satisfies(&requirement));
    }

    #[test]
    fn greatest_satisfying_candidate_wins() {
        let requirement = cap("python3-devel-3.8");
        let candidates = [
            cap("python3-devel-3.7.9"),
            cap("python3-devel-3.8.1"),
            cap("python3-devel-3.8.0rc"),
        ];
        let winner = candidates
            .iter()
            .filter(|c| c.satisfies(&requirement))
            .max_by(|a, b| a.version().cmp(b.version()))
            .unwrap();
        assert_eq!(winner.to_string(), "python3-devel-3.8.1");
    }

    fn arbitrary_version() -> impl Strategy<Value = Version> {
        proptest::collection::vec(
            (proptest::option::of(0u64..100), "[a-z]{0,3}"),
            1..4,
        )
        .prop_filter_map("atom must not be empty", |atoms| {
            let atoms: Vec<VersionAtom> = atoms
                .into_iter()
                .filter(|(number, suffix)| number.is_some() || !suffix.is_empty())
                .map(|(number, suffix)| VersionAtom { number, suffix })
                .collect();
            (!atoms.is_empty()).then_some(Version { atoms })
        })
    }

    proptest! {
        #[test]
        fn ordering_is_antisymmetric(a in arbitrary_version(), b in arbitrary_version()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn ordering_is_transitive(
            a in arbitrary_version(),
            b in arbitrary_version(),
            c in arbitrary_version(),
        ) {
            let mut sorted = vec![a, b, c];
            sorted.sort();
            prop_assert!(sorted[0] <= sorted[1]);
            prop_assert!(sorted[1] <= sorted[2]);
            prop_assert!(sorted[0] <= sorted[2]);
        }

        #[test]
        fn parse_display_round_trip(version in arbitrary_version()) {
            // Suffixes produced by the strategy never contain '.', so the
            // textual form must parse back to an equal version.
            let reparsed = Version::try_new(&version.to_string()).unwrap();
            prop_assert_eq!(version, reparsed);
        }
    }
}
