//! Host matching helpers shared by the filters

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use crate::error::FilterError;

/// Hostname suffix list with an exact-match exclusion set
#[derive(Debug, Clone, Default)]
pub struct SiteList {
    suffixes: Vec<String>,
    exclude: HashSet<String>,
}

impl SiteList {
    /// Build from configured suffixes and excluded hosts
    #[must_use]
    pub fn new(sites: &[String], exclude: &[String]) -> Self {
        Self {
            suffixes: sites.iter().map(|s| s.to_ascii_lowercase()).collect(),
            exclude: exclude.iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }

    /// Whether `host` ends with a listed suffix and is not excluded
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        !self.exclude.contains(&host) && self.suffixes.iter().any(|s| host.ends_with(s.as_str()))
    }

    /// Whether no suffixes are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}

/// Translate an fnmatch-style glob into an anchored regex
///
/// `*` matches any run, `?` one character, `[...]` a class (`[!...]`
/// negated). An unterminated `[` is literal.
#[must_use]
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^(?s:");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                } else {
                    let body: String = chars[i + 1..j].iter().collect();
                    let body = body.replace('\\', "\\\\");
                    out.push('[');
                    match body.strip_prefix('!') {
                        Some(rest) => {
                            out.push('^');
                            out.push_str(rest);
                        }
                        None if body.starts_with('^') => {
                            out.push('\\');
                            out.push_str(&body);
                        }
                        None => out.push_str(&body),
                    }
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push_str(")$");
    out
}

/// Compile host globs into one case-insensitive matcher
///
/// Returns `Ok(None)` for an empty list.
///
/// # Errors
///
/// `FilterError::InvalidPattern` if a glob yields an invalid class.
pub fn compile_globs(globs: &[String]) -> Result<Option<Regex>, FilterError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let alternation = globs.iter().map(|g| glob_to_regex(g)).collect::<Vec<_>>().join("|");
    RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|e| FilterError::invalid_pattern(globs.join(","), e.to_string()))
}
