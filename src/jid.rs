//! Jabber identifiers.
//!
//! A jid is `node@domain/resource`. The bare form drops the resource.
//! Node and domain compare case-insensitively, the resource is
//! case-sensitive (RFC 6122 resourceprep keeps case).

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

pub const RESOURCE_SEPARATOR: char = '/';
pub const DOMAIN_SEPARATOR: char = '@';

/// Returns the bare part of a jid string (everything before the first `/`).
pub fn bare_of(jid: &str) -> &str {
    match jid.find(RESOURCE_SEPARATOR) {
        Some(pos) => &jid[..pos],
        None => jid,
    }
}

/// Returns the resource part of a jid string, if any.
pub fn resource_of(jid: &str) -> Option<&str> {
    jid.find(RESOURCE_SEPARATOR).map(|pos| &jid[pos + 1..])
}

/// Returns the domain part of a jid string (bare or full).
pub fn domain_of(jid: &str) -> &str {
    let bare = bare_of(jid);
    match bare.find(DOMAIN_SEPARATOR) {
        Some(pos) => &bare[pos + 1..],
        None => bare,
    }
}

/// Case-normalized bare jid, used as the roster key.
pub fn bare_lower(jid: &str) -> String {
    bare_of(jid).to_lowercase()
}

#[derive(Debug, Clone, Eq)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.filter(|n| !n.is_empty()).map(str::to_string),
            domain: domain.to_string(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }

    /// Parses `node@domain/resource`. The node and resource are optional,
    /// the domain is not.
    pub fn parse(s: &str) -> Result<Self> {
        let (bare, resource) = match s.find(RESOURCE_SEPARATOR) {
            Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
            None => (s, None),
        };
        let (node, domain) = match bare.find(DOMAIN_SEPARATOR) {
            Some(pos) => (Some(&bare[..pos]), &bare[pos + 1..]),
            None => (None, bare),
        };
        if domain.is_empty() {
            return Err(anyhow!("Invalid JID (empty domain): {s}"));
        }
        if node == Some("") {
            return Err(anyhow!("Invalid JID (empty node): {s}"));
        }
        if resource == Some("") {
            return Err(anyhow!("Invalid JID (empty resource): {s}"));
        }
        Ok(Self::new(node, domain, resource))
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The bare form of this jid (resource stripped).
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }

    /// `node@domain` as a string, without the resource.
    pub fn bare_string(&self) -> String {
        match &self.node {
            Some(node) => format!("{node}{DOMAIN_SEPARATOR}{}", self.domain),
            None => self.domain.clone(),
        }
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        let node_eq = match (&self.node, &other.node) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        node_eq
            && self.domain.eq_ignore_ascii_case(&other.domain)
            && self.resource == other.resource
    }
}

impl std::hash::Hash for Jid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        if let Some(node) = &self.node {
            node.to_lowercase().hash(state);
        }
        self.domain.to_lowercase().hash(state);
        self.resource.hash(state);
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}{DOMAIN_SEPARATOR}")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "{RESOURCE_SEPARATOR}{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Jid::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid = Jid::parse("alice@example.org/home").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("home"));
        assert!(!jid.is_bare());
    }

    #[test]
    fn test_parse_bare_jid() {
        let jid = Jid::parse("alice@example.org").unwrap();
        assert_eq!(jid.resource(), None);
        assert!(jid.is_bare());
    }

    #[test]
    fn test_parse_domain_only() {
        let jid = Jid::parse("example.org").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "example.org");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(Jid::parse("@example.org").is_err());
        assert!(Jid::parse("alice@example.org/").is_err());
        assert!(Jid::parse("").is_err());
    }

    #[test]
    fn test_resource_keeps_slashes() {
        // Only the first '/' separates the resource
        let jid = Jid::parse("alice@example.org/foo/bar").unwrap();
        assert_eq!(jid.resource(), Some("foo/bar"));
    }

    #[test]
    fn test_equality_is_case_insensitive_on_bare_parts() {
        let a = Jid::parse("Alice@Example.Org/home").unwrap();
        let b = Jid::parse("alice@example.org/home").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_is_case_sensitive_on_resource() {
        let a = Jid::parse("alice@example.org/Home").unwrap();
        let b = Jid::parse("alice@example.org/home").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bare_strips_resource() {
        let jid = Jid::parse("alice@example.org/home").unwrap();
        assert_eq!(jid.bare().to_string(), "alice@example.org");
        assert_eq!(jid.bare_string(), "alice@example.org");
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["alice@example.org/home", "alice@example.org", "example.org"] {
            assert_eq!(Jid::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_bare_of_helper() {
        assert_eq!(bare_of("alice@example.org/home"), "alice@example.org");
        assert_eq!(bare_of("alice@example.org"), "alice@example.org");
    }

    #[test]
    fn test_resource_of_helper() {
        assert_eq!(resource_of("alice@example.org/home"), Some("home"));
        assert_eq!(resource_of("alice@example.org"), None);
    }

    #[test]
    fn test_domain_of_helper() {
        assert_eq!(domain_of("alice@example.org/home"), "example.org");
        assert_eq!(domain_of("example.org"), "example.org");
    }

    #[test]
    fn test_bare_lower() {
        assert_eq!(bare_lower("Alice@Example.Org/Home"), "alice@example.org");
    }
}
