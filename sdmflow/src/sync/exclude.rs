//! Exclusion patterns for the bulk mirror.
//!
//! Patterns follow rsync's conventions: a trailing `/` restricts a pattern to
//! directories, a pattern without `/` matches a file or directory name at any
//! depth, and a pattern with `/` is matched against the whole path from the
//! tree root. `*` stays within one path component, `**` crosses them, `?`
//! matches one character.

use crate::errors::ConfigurationError;
use regex::Regex;
use std::path::{Component, Path};

#[derive(Debug, Clone)]
struct ExcludePattern {
    raw: String,
    regex: Regex,
    dir_only: bool,
    anchored: bool,
}

impl ExcludePattern {
    fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let mut body = raw.trim();
        let dir_only = body.len() > 1 && body.ends_with('/');
        if dir_only {
            body = &body[..body.len() - 1];
        }
        let anchored = body.contains('/');
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return Err(ConfigurationError::invalid(
                "sync.exclude",
                format!("'{raw}' does not match anything"),
            ));
        }

        let regex = Regex::new(&glob_to_regex(body)).map_err(|e| {
            ConfigurationError::invalid("sync.exclude", format!("bad pattern '{raw}': {e}"))
        })?;
        Ok(Self {
            raw: raw.trim().to_string(),
            regex,
            dir_only,
            anchored,
        })
    }

    fn matches(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            self.regex.is_match(rel_path)
        } else {
            let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
            self.regex.is_match(name)
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// An ordered list of exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeList {
    patterns: Vec<ExcludePattern>,
}

impl ExcludeList {
    /// Compiles a list of patterns; blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern cannot match anything.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter(|p| !p.as_ref().trim().is_empty())
            .map(|p| ExcludePattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// The patterns as written.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.raw.as_str())
    }

    /// Returns true if there are no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if `rel_path` itself matches a pattern.
    #[must_use]
    pub fn matches(&self, rel_path: &Path, is_dir: bool) -> bool {
        let normalized = normalize(rel_path);
        self.patterns.iter().any(|p| p.matches(&normalized, is_dir))
    }

    /// Writes one pattern per line, the format `rsync --exclude-from` reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut body = String::new();
        for pattern in self.patterns() {
            body.push_str(pattern);
            body.push('\n');
        }
        std::fs::write(path, body)
    }
}

fn normalize(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
