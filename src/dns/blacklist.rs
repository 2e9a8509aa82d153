//! Poisoned-answer detection
//!
//! Entries are either exact addresses (`"1.2.3.4"`) or textual prefixes
//! ending in a dot (`"10.10."`), which match every address whose string
//! form starts with them.

use std::collections::HashSet;
use std::net::IpAddr;

/// Set of addresses that mark a DNS reply as forged
#[derive(Debug, Clone, Default)]
pub struct DnsBlacklist {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl DnsBlacklist {
    /// Build from configured entries
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.into();
            if entry.ends_with('.') {
                list.prefixes.push(entry.clone());
            }
            list.exact.insert(entry);
        }
        list
    }

    /// Whether `ip` is blacklisted
    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let text = ip.to_string();
        self.exact.contains(&text) || self.prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }

    /// Whether any address of a reply is blacklisted
    #[must_use]
    pub fn is_poisoned(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.contains(ip))
    }

    /// No entries configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_prefix() {
        let list = DnsBlacklist::new(["1.2.3.4", "10.10."]);
        assert!(list.contains(&"1.2.3.4".parse().unwrap()));
        assert!(list.contains(&"10.10.34.35".parse().unwrap()));
        assert!(!list.contains(&"1.2.3.40".parse().unwrap()));
        assert!(!list.contains(&"110.10.1.1".parse().unwrap()));
    }

    #[test]
    fn test_is_poisoned() {
        let list = DnsBlacklist::new(["203.98.7.65"]);
        let clean: Vec<IpAddr> = vec!["93.184.216.34".parse().unwrap()];
        let mixed: Vec<IpAddr> = vec![
            "93.184.216.34".parse().unwrap(),
            "203.98.7.65".parse().unwrap(),
        ];
        assert!(!list.is_poisoned(&clean));
        assert!(list.is_poisoned(&mixed));
        assert!(!DnsBlacklist::default().is_poisoned(&mixed));
    }
}
