//! Connection Specs
//!
//! A connection string names an upstream property relative to a root:
//!
//! - `first_name`: a property of the root
//! - `spouse.first_name`: a property of the entity held by `spouse`
//! - `children*.name` (or `children.*.name`): `name` of every entity in the
//!   list held by `children`
//! - `first_name:mylabel`: any of the above with a label, used to order and
//!   remove reactions
//!
//! Strings are parsed once when a property or reaction is declared.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{EngineError, Result};

/// One parsed segment of a connection string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A property or attribute name.
    Name(String),
    /// Fan out over each element of the preceding list.
    Wildcard,
    /// A trailing label. Not part of the path.
    Label(String),
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionSpec {
    text: String,
    segments: SmallVec<[Segment; 4]>,
}

impl ConnectionSpec {
    /// Parse a connection string.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let fail = |reason: &str| Err(EngineError::invalid_connection(text, reason));

        if text.is_empty() {
            return fail("connection string is empty");
        }

        let (path, label) = match text.split_once(':') {
            Some((path, label)) => (path, Some(label)),
            None => (text, None),
        };

        let mut segments: SmallVec<[Segment; 4]> = SmallVec::new();
        let mut wildcards = 0;

        for part in path.split('.') {
            let (name, star) = match part.strip_suffix('*') {
                Some(rest) => (rest, true),
                None => (part, false),
            };
            if name.ends_with('*') {
                return fail("recursive wildcards are not supported");
            }
            if !name.is_empty() {
                if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return fail("names may only contain letters, digits and underscores");
                }
                segments.push(Segment::Name(name.to_string()));
            } else if !star {
                return fail("empty path segment");
            }
            if star {
                if !matches!(segments.last(), Some(Segment::Name(_))) {
                    return fail("a wildcard must follow a name");
                }
                wildcards += 1;
                segments.push(Segment::Wildcard);
            }
        }

        if wildcards > 1 {
            return fail("at most one wildcard per connection is supported");
        }
        if !matches!(segments.last(), Some(Segment::Name(_))) {
            return fail("a connection must end with a name");
        }

        if let Some(label) = label {
            if label.is_empty() {
                return fail("empty label");
            }
            segments.push(Segment::Label(label.to_string()));
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    /// The string this spec was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Path segments without the label.
    pub fn path(&self) -> &[Segment] {
        match self.segments.last() {
            Some(Segment::Label(_)) => &self.segments[..self.segments.len() - 1],
            _ => &self.segments,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self.segments.last() {
            Some(Segment::Label(label)) => Some(label),
            _ => None,
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.contains(&Segment::Wildcard)
    }

    /// The last name of the path, i.e. the property that is read.
    pub fn property(&self) -> &str {
        self.path()
            .iter()
            .rev()
            .find_map(|s| match s {
                Segment::Name(name) => Some(name.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
