//! Version identifiers of the form `major.minor.patch[-Xbuildid]`.
//!
//! `X` is one of the build-type letters `T D A B P R` and `buildid` is
//! exactly sixteen decimal digits. Comparison operators used by package
//! references live here as well.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of decimal digits in a build id.
pub const BUILD_ID_DIGITS: usize = 16;
const MAX_BUILD_ID: i64 = 9_999_999_999_999_999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed version '{input}': {reason}")]
    Malformed { input: String, reason: &'static str },
}

impl VersionError {
    fn malformed(input: &str, reason: &'static str) -> Self {
        Self::Malformed {
            input: input.to_owned(),
            reason,
        }
    }
}

/// Build flavor. Declaration order is the sort order; an untagged version
/// sorts after every tagged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BuildType {
    Test,
    Debug,
    Alpha,
    Beta,
    Prerelease,
    Release,
    #[default]
    Unset,
}

impl BuildType {
    pub fn from_letter(c: u8) -> Option<Self> {
        match c {
            b'T' => Some(Self::Test),
            b'D' => Some(Self::Debug),
            b'A' => Some(Self::Alpha),
            b'B' => Some(Self::Beta),
            b'P' => Some(Self::Prerelease),
            b'R' => Some(Self::Release),
            _ => None,
        }
    }

    pub fn letter(self) -> Option<char> {
        match self {
            Self::Test => Some('T'),
            Self::Debug => Some('D'),
            Self::Alpha => Some('A'),
            Self::Beta => Some('B'),
            Self::Prerelease => Some('P'),
            Self::Release => Some('R'),
            Self::Unset => None,
        }
    }

    /// Stable single-byte tag used in canonical encodings.
    pub fn tag(self) -> u8 {
        match self {
            Self::Test => 1,
            Self::Debug => 2,
            Self::Alpha => 3,
            Self::Beta => 4,
            Self::Prerelease => 5,
            Self::Release => 6,
            Self::Unset => 0,
        }
    }
}

/// A package or schema version.
///
/// `major < 0` means "no version". A negative `minor` or `patch` marks the
/// field as absent, which only happens for hand-built templates; the parser
/// always fills missing numeric fields with `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub build_type: BuildType,
    pub build_id: Option<i64>,
}

impl Default for Version {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Version {
    pub const EMPTY: Version = Version {
        major: -1,
        minor: -1,
        patch: -1,
        build_type: BuildType::Unset,
        build_id: None,
    };

    pub const fn new(major: i32, minor: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            patch,
            build_type: BuildType::Unset,
            build_id: None,
        }
    }

    #[must_use]
    pub const fn with_build(mut self, build_type: BuildType, build_id: Option<i64>) -> Self {
        self.build_type = build_type;
        self.build_id = build_id;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.major < 0
    }

    /// Match `candidate` against `self` used as a template: only fields set
    /// on the template take part in the comparison.
    pub fn matches_template(&self, candidate: &Version) -> bool {
        if self.is_empty() {
            return true;
        }
        if self.major != candidate.major {
            return false;
        }
        if self.minor >= 0 && self.minor != candidate.minor {
            return false;
        }
        if self.patch >= 0 && self.patch != candidate.patch {
            return false;
        }
        if self.build_type != BuildType::Unset && self.build_type != candidate.build_type {
            return false;
        }
        match self.build_id {
            Some(id) => candidate.build_id == Some(id),
            None => true,
        }
    }
}

fn is_blank(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn is_terminator(c: u8) -> bool {
    is_blank(c) || matches!(c, b'#' | b')' | b'\r' | b'\n')
}

struct Scanner<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.peek().map_or(true, is_terminator)
    }

    fn digits(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn fail(&self, reason: &'static str) -> VersionError {
        VersionError::malformed(self.input, reason)
    }

    /// A numeric component. Empty is accepted only right before a terminator.
    fn component(&mut self) -> Result<i32, VersionError> {
        let digits = self.digits();
        if digits.is_empty() {
            return if self.at_end() {
                Ok(0)
            } else {
                Err(self.fail("expected a digit"))
            };
        }
        digits
            .parse::<i32>()
            .map_err(|_| self.fail("numeric component out of range"))
    }
}

/// Parse the longest version prefix of `input`.
///
/// Returns the version and the number of bytes consumed, including leading
/// blanks but not the terminator that ended the version.
pub fn parse(input: &str) -> Result<(Version, usize), VersionError> {
    let mut sc = Scanner {
        input,
        bytes: input.as_bytes(),
        pos: 0,
    };
    while sc.peek().is_some_and(is_blank) {
        sc.pos += 1;
    }

    let major_digits = sc.digits();
    if major_digits.is_empty() {
        return Err(sc.fail("expected a major version number"));
    }
    let major = major_digits
        .parse::<i32>()
        .map_err(|_| sc.fail("numeric component out of range"))?;
    let mut v = Version::new(major, 0, 0);

    if sc.at_end() {
        return Ok((v, sc.pos));
    }
    if sc.peek() != Some(b'.') {
        return Err(sc.fail("unexpected character after major"));
    }
    sc.pos += 1;
    v.minor = sc.component()?;

    if sc.at_end() {
        return Ok((v, sc.pos));
    }
    if sc.peek() != Some(b'.') {
        return Err(sc.fail("unexpected character after minor"));
    }
    sc.pos += 1;
    v.patch = sc.component()?;

    if sc.at_end() {
        return Ok((v, sc.pos));
    }
    if sc.peek() != Some(b'-') {
        return Err(sc.fail("unexpected character after patch"));
    }
    sc.pos += 1;

    let build_type = sc
        .peek()
        .and_then(BuildType::from_letter)
        .ok_or_else(|| sc.fail("expected a build type letter after '-'"))?;
    sc.pos += 1;
    v.build_type = build_type;

    let id = sc.digits();
    if !id.is_empty() {
        if id.len() != BUILD_ID_DIGITS {
            return Err(sc.fail("build id must have exactly 16 digits"));
        }
        v.build_id = Some(
            id.parse::<i64>()
                .map_err(|_| sc.fail("build id out of range"))?,
        );
    }

    if !sc.at_end() {
        return Err(sc.fail("unexpected character after build"));
    }
    Ok((v, sc.pos))
}

/// Render a version in canonical form, stopping at the first absent field.
///
/// A build id is only written after a build-type letter.
pub fn serialize(v: &Version) -> String {
    let mut out = String::new();
    if v.major < 0 {
        return out;
    }
    out.push_str(&v.major.to_string());
    if v.minor < 0 {
        return out;
    }
    out.push('.');
    out.push_str(&v.minor.to_string());
    if v.patch < 0 {
        return out;
    }
    out.push('.');
    out.push_str(&v.patch.to_string());
    if let Some(letter) = v.build_type.letter() {
        out.push('-');
        out.push(letter);
        if let Some(id) = v.build_id.filter(|id| (0..=MAX_BUILD_ID).contains(id)) {
            out.push_str(&format!("{id:0width$}", width = BUILD_ID_DIGITS));
        }
    }
    out
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    /// Parse a whole string; trailing content other than blanks is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (v, consumed) = parse(trimmed)?;
        if consumed != trimmed.len() {
            return Err(VersionError::malformed(s, "trailing characters"));
        }
        Ok(v)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&serialize(self))
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Ok(Version::EMPTY);
        }
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Version constraint operator of a package reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operator {
    #[default]
    Unknown,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Equal => "==",
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Less => 1,
            Self::LessOrEqual => 2,
            Self::Greater => 3,
            Self::GreaterOrEqual => 4,
            Self::Equal => 5,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_operator(input: &str) -> Result<Operator, VersionError> {
    match input {
        "<" => Ok(Operator::Less),
        "<=" | "=<" => Ok(Operator::LessOrEqual),
        ">" => Ok(Operator::Greater),
        ">=" => Ok(Operator::GreaterOrEqual),
        "=" | "==" => Ok(Operator::Equal),
        _ => Err(VersionError::malformed(input, "unknown operator")),
    }
}

impl FromStr for Operator {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_operator(s)
    }
}
