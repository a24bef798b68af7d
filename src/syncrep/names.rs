//! Standby Name List
//!
//! Parses the `synchronous_standby_names` setting: a comma-separated list
//! of identifiers naming the standbys eligible to become synchronous.
//! Only syntax is checked here.

use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// Longest identifier kept; longer names are truncated
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Parsed list of eligible standby names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StandbyNames {
    names: Vec<String>,
}

impl StandbyNames {
    /// Parse a raw list.
    ///
    /// Unquoted names are lowercased and end at whitespace or a comma.
    /// Double-quoted names keep their case and may contain anything, with
    /// `""` standing for a literal quote. A blank value is an empty list.
    pub fn parse(raw: &str) -> Result<Self> {
        let syntax = |detail: &str| Error::ConfigSyntax {
            value: raw.to_string(),
            detail: detail.to_string(),
        };

        let mut names = Vec::new();
        let mut rest = raw.trim_start();
        if rest.is_empty() {
            return Ok(Self::default());
        }

        loop {
            let name = if let Some(quoted) = rest.strip_prefix('"') {
                let mut name = String::new();
                let mut chars = quoted.char_indices();
                let end = loop {
                    match chars.next() {
                        None => return Err(syntax("unterminated quoted name")),
                        Some((i, '"')) => {
                            if quoted[i + 1..].starts_with('"') {
                                name.push('"');
                                chars.next();
                            } else {
                                break i + 1;
                            }
                        }
                        Some((_, c)) => name.push(c),
                    }
                };
                if name.is_empty() {
                    return Err(syntax("zero-length quoted name"));
                }
                rest = &quoted[end..];
                name
            } else {
                let end = rest
                    .find(|c: char| c == ',' || c.is_whitespace())
                    .unwrap_or(rest.len());
                if end == 0 {
                    return Err(syntax("empty name in list"));
                }
                let name = rest[..end].to_ascii_lowercase();
                rest = &rest[end..];
                name
            };
            names.push(truncate_identifier(name));

            rest = rest.trim_start();
            match rest.strip_prefix(',') {
                Some(after) => rest = after.trim_start(),
                None if rest.is_empty() => break,
                None => return Err(syntax("expected a comma between names")),
            }
        }

        Ok(Self { names })
    }

    /// Whether no standby is eligible
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether `name` is listed
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Names in configured order
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }

    /// Names in configured order
    pub fn to_vec(&self) -> Vec<String> {
        self.names.clone()
    }
}

impl FromStr for StandbyNames {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn truncate_identifier(mut name: String) -> String {
    if name.len() > MAX_IDENTIFIER_LEN {
        let mut cut = MAX_IDENTIFIER_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        let original = name.clone();
        name.truncate(cut);
        tracing::warn!("identifier \"{}\" will be truncated to \"{}\"", original, name);
    }
    name
}
