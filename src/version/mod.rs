// src/version/mod.rs

//! Debian version handling and dependency relations
//!
//! Versions follow the `[epoch:]upstream[-revision]` layout and compare with
//! dpkg's rules: digits compare numerically, everything else lexically with
//! letters before non-letters and `~` before anything (even the end of the
//! string).

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A parsed Debian version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebianVersion {
    pub epoch: u32,
    pub upstream: String,
    pub revision: Option<String>,
}

impl DebianVersion {
    /// Parse a version string
    ///
    /// - "1.2.3" → epoch=0, upstream="1.2.3", revision=None
    /// - "2:1.2-3ubuntu1" → epoch=2, upstream="1.2", revision=Some("3ubuntu1")
    /// - "1.0-rc1-2" → upstream="1.0-rc1", revision=Some("2")
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, r)) => {
                let epoch = e.parse::<u32>().map_err(|err| {
                    Error::ParseError(format!("Invalid epoch in version '{}': {}", s, err))
                })?;
                (epoch, r)
            }
            None => (0, s),
        };

        let (upstream, revision) = match rest.rfind('-') {
            Some(pos) => (&rest[..pos], Some(rest[pos + 1..].to_string())),
            None => (rest, None),
        };

        if upstream.is_empty() {
            return Err(Error::ParseError(format!(
                "Empty upstream version in '{}'",
                s
            )));
        }
        if !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::ParseError(format!(
                "Version '{}' does not start with a digit",
                s
            )));
        }
        let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | '-' | ':');
        if !rest.chars().all(valid) {
            return Err(Error::ParseError(format!(
                "Invalid character in version '{}'",
                s
            )));
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.filter(|r| !r.is_empty()),
        })
    }

    pub fn compare(&self, other: &DebianVersion) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_part(&self.upstream, &other.upstream))
            .then_with(|| {
                compare_part(
                    self.revision.as_deref().unwrap_or("0"),
                    other.revision.as_deref().unwrap_or("0"),
                )
            })
    }
}

impl fmt::Display for DebianVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.upstream)?;
        if let Some(ref revision) = self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}

impl Ord for DebianVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for DebianVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two version strings, falling back to plain string order when
/// either side does not parse
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (DebianVersion::parse(a), DebianVersion::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn char_order(c: Option<char>) -> i32 {
    match c {
        None => 0,
        Some('~') => -1,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn compare_part(a: &str, b: &str) -> Ordering {
    let mut a = a;
    let mut b = b;
    while !a.is_empty() || !b.is_empty() {
        let a_split = a.find(|c: char| c.is_ascii_digit()).unwrap_or(a.len());
        let b_split = b.find(|c: char| c.is_ascii_digit()).unwrap_or(b.len());
        let (a_lex, a_rest) = a.split_at(a_split);
        let (b_lex, b_rest) = b.split_at(b_split);

        let mut ac = a_lex.chars();
        let mut bc = b_lex.chars();
        loop {
            let (x, y) = (ac.next(), bc.next());
            if x.is_none() && y.is_none() {
                break;
            }
            match char_order(x).cmp(&char_order(y)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        let a_num_end = a_rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(a_rest.len());
        let b_num_end = b_rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(b_rest.len());
        let a_num = a_rest[..a_num_end].trim_start_matches('0');
        let b_num = b_rest[..b_num_end].trim_start_matches('0');
        let ord = a_num.len().cmp(&b_num.len()).then_with(|| a_num.cmp(b_num));
        if ord != Ordering::Equal {
            return ord;
        }

        a = &a_rest[a_num_end..];
        b = &b_rest[b_num_end..];
    }
    Ordering::Equal
}

/// Relation operators used in Depends fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    /// Any version is acceptable
    Any,
    /// `<<`
    StrictlyEarlier(String),
    /// `<=`
    EarlierOrEqual(String),
    /// `=`
    Exactly(String),
    /// `>=`
    LaterOrEqual(String),
    /// `>>`
    StrictlyLater(String),
}

impl VersionConstraint {
    /// Parse the parenthesised part of a relation, e.g. `>= 1.2`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(VersionConstraint::Any);
        }

        let ops: [(&str, fn(String) -> VersionConstraint); 7] = [
            ("<<", VersionConstraint::StrictlyEarlier),
            ("<=", VersionConstraint::EarlierOrEqual),
            (">=", VersionConstraint::LaterOrEqual),
            (">>", VersionConstraint::StrictlyLater),
            ("=", VersionConstraint::Exactly),
            ("<", VersionConstraint::EarlierOrEqual),
            (">", VersionConstraint::LaterOrEqual),
        ];
        for (op, build) in ops {
            if let Some(rest) = s.strip_prefix(op) {
                let version = rest.trim();
                DebianVersion::parse(version)?;
                return Ok(build(version.to_string()));
            }
        }
        Err(Error::ParseError(format!("Invalid version relation '{}'", s)))
    }

    /// Check if a version satisfies this constraint
    pub fn satisfies(&self, version: &str) -> bool {
        let check = |wanted: &str, accept: fn(Ordering) -> bool| {
            accept(compare_versions(version, wanted))
        };
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::StrictlyEarlier(v) => check(v, |o| o == Ordering::Less),
            VersionConstraint::EarlierOrEqual(v) => check(v, |o| o != Ordering::Greater),
            VersionConstraint::Exactly(v) => check(v, |o| o == Ordering::Equal),
            VersionConstraint::LaterOrEqual(v) => check(v, |o| o != Ordering::Less),
            VersionConstraint::StrictlyLater(v) => check(v, |o| o == Ordering::Greater),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => Ok(()),
            VersionConstraint::StrictlyEarlier(v) => write!(f, "<< {}", v),
            VersionConstraint::EarlierOrEqual(v) => write!(f, "<= {}", v),
            VersionConstraint::Exactly(v) => write!(f, "= {}", v),
            VersionConstraint::LaterOrEqual(v) => write!(f, ">= {}", v),
            VersionConstraint::StrictlyLater(v) => write!(f, ">> {}", v),
        }
    }
}

/// One alternative in a dependency group: `name (op version)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    pub name: String,
    pub constraint: VersionConstraint,
}

impl Relation {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, constraint) = match s.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    Error::ParseError(format!("Unterminated relation '{}'", s))
                })?;
                (name.trim(), VersionConstraint::parse(inner)?)
            }
            None => (s, VersionConstraint::Any),
        };
        // Architecture qualifiers (`foo:any`) do not matter for resolution
        let name = name.split(':').next().unwrap_or(name);
        if name.is_empty() {
            return Err(Error::ParseError(format!("Empty package name in '{}'", s)));
        }
        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constraint {
            VersionConstraint::Any => write!(f, "{}", self.name),
            ref c => write!(f, "{} ({})", self.name, c),
        }
    }
}

/// Parse a full Depends field into groups of alternatives
///
/// `a (>= 1), b | c` → `[[a (>= 1)], [b, c]]`
pub fn parse_depends(field: &str) -> Result<Vec<Vec<Relation>>> {
    field
        .split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(|group| group.split('|').map(Relation::parse).collect())
        .collect()
}
