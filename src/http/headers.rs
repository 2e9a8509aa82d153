//! Ordered, case-insensitive header list and header-name rules

/// Hop-by-hop and identifying headers never forwarded upstream
pub const SKIP_HEADERS: [&str; 9] = [
    "Vary",
    "Via",
    "X-Forwarded-For",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Upgrade",
    "X-Chrome-Variations",
    "Connection",
    "Cache-Control",
];

/// Whether `name` is on the skip list
#[must_use]
pub fn is_skipped(name: &str) -> bool {
    SKIP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Title-case a header name: every letter following a non-letter is
/// upper-cased, every other letter lower-cased
#[must_use]
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if c.is_alphabetic() {
            if upper_next {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            upper_next = false;
        } else {
            out.push(c);
            upper_next = true;
        }
    }
    out
}

/// Header fields in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every `name` field with a single one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Set `name` only if it is absent
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.entries.push((name, value.into()));
        }
    }

    /// Add a field without touching existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every `name` field, returning the first value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(str::to_string);
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        first
    }

    /// Fields in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same fields with title-cased names
    #[must_use]
    pub fn title_cased(&self) -> Self {
        self.entries
            .iter()
            .map(|(k, v)| (title_case(k), v.clone()))
            .collect()
    }

    /// Whether a comma-separated field carries `token`
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Value of `Content-Length`, if present and valid
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Split a folded `Set-Cookie` value back into individual cookies
///
/// A `", "` separates two cookies when what follows it is a run of
/// characters other than space and `=` ending in `=` or at end of input,
/// so commas inside `Expires` dates are left alone.
#[must_use]
pub fn split_set_cookie(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(offset) = value[search..].find(", ") {
        let sep = search + offset;
        let rest = &value[sep + 2..];
        let run = rest.find([' ', '=']).unwrap_or(rest.len());
        let boundary = run > 0 && (run == rest.len() || rest.as_bytes()[run] == b'=');
        if boundary {
            parts.push(&value[start..sep]);
            start = sep + 2;
        }
        search = sep + 2;
    }
    parts.push(&value[start..]);
    parts
}

/// Quote bare `filename=` parameters of a `Content-Disposition` value
#[must_use]
pub fn quote_disposition(value: &str) -> String {
    if value.contains('"') {
        return value.to_string();
    }
    const KEY: &str = "filename=";
    let mut out = String::with_capacity(value.len() + 4);
    let mut rest = value;
    while let Some(pos) = rest.find(KEY) {
        let (before, after) = rest.split_at(pos + KEY.len());
        out.push_str(before);
        let end = after.find('\'').unwrap_or(after.len());
        if end == 0 {
            rest = after;
            continue;
        }
        out.push('"');
        out.push_str(&after[..end]);
        out.push('"');
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(title_case("content-md5"), "Content-Md5");
        assert_eq!(title_case("www-authenticate"), "Www-Authenticate");
    }

    #[test]
    fn test_skip_list_case_insensitive() {
        assert!(is_skipped("proxy-connection"));
        assert!(is_skipped("Cache-Control"));
        assert!(!is_skipped("Cookie"));
    }

    #[test]
    fn test_header_ops() {
        let mut h: Headers = [("Host", "a"), ("accept", "x"), ("ACCEPT", "y")].into_iter().collect();
        assert_eq!(h.get("Accept"), Some("x"));

        h.set("Accept", "z");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("accept"), Some("z"));

        h.set_default("Host", "b");
        assert_eq!(h.get("host"), Some("a"));
        assert_eq!(h.remove("HOST").as_deref(), Some("a"));
        assert!(!h.contains("Host"));
    }

    #[test]
    fn test_tokens() {
        let h: Headers = [("Connection", "keep-alive, Upgrade")].into_iter().collect();
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn test_split_set_cookie() {
        let folded = "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT; Path=/, b=2; HttpOnly, c=3";
        assert_eq!(
            split_set_cookie(folded),
            vec![
                "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT; Path=/",
                "b=2; HttpOnly",
                "c=3"
            ]
        );
        assert_eq!(split_set_cookie("single=1"), vec!["single=1"]);
    }

    #[test]
    fn test_quote_disposition() {
        assert_eq!(
            quote_disposition("attachment; filename=report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            quote_disposition("attachment; filename=\"a b.pdf\""),
            "attachment; filename=\"a b.pdf\""
        );
        assert_eq!(quote_disposition("inline"), "inline");
    }
}
