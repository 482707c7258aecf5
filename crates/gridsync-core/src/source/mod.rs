//! Upstream information-source collaborators.
//!
//! The engine never speaks LDAP or HTTP itself: it consumes search results
//! through [`LdapSearch`] and GOCDB service records through [`GocdbClient`].

pub mod filter;
pub mod gocdb;
pub mod ldif;

use std::collections::BTreeMap;

use crate::errors::SyncResult;

pub use gocdb::{GocdbClient, ServiceExtension, ServiceRecord, StaticGocdb};
pub use ldif::{parse_ldif, LdifDirectory};

/// Default search base for GLUE1 objects in a top-level BDII.
pub const GLUE1_BASE: &str = "Mds-Vo-name=local,o=grid";

/// Default search base for GLUE2 objects in a top-level BDII.
pub const GLUE2_BASE: &str = "o=glue";

/// A single LDAP entry: its DN and multi-valued attribute map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LdapRecord {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl LdapRecord {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style helper appending one value to an attribute.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.attrs
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// All values of an attribute. Attribute names compare case-insensitively.
    pub fn values(&self, name: &str) -> &[String] {
        if let Some(v) = self.attrs.get(name) {
            return v;
        }
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has(&self, name: &str) -> bool {
        !self.values(name).is_empty()
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    /// The longest value of a single-valued attribute.
    ///
    /// BDIIs sometimes publish an attribute twice, once truncated; the
    /// longest value is the full one. Ties keep the first value seen.
    pub fn longest(&self, name: &str) -> Option<&str> {
        self.values(name)
            .iter()
            .fold(None::<&String>, |best, v| match best {
                Some(b) if b.len() >= v.len() => Some(b),
                _ => Some(v),
            })
            .map(String::as_str)
    }

    /// Longest value with surrounding whitespace removed, or `""`.
    pub fn text(&self, name: &str) -> &str {
        self.longest(name).map(str::trim).unwrap_or("")
    }

    /// Value of the first DN component named `attr`.
    pub fn dn_value(&self, attr: &str) -> Option<String> {
        dn_components(&self.dn)
            .into_iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(attr))
            .map(|(_, value)| value)
    }

    /// Value of a `Key=value` pair stored inside a multi-valued attribute,
    /// e.g. `GlueForeignKey: GlueSiteUniqueID=UKI-X`. Longest match wins.
    pub fn keyed_value(&self, attr: &str, key: &str) -> Option<String> {
        let prefix = format!("{key}=");
        self.values(attr)
            .iter()
            .filter_map(|v| v.trim().strip_prefix(&prefix))
            .max_by_key(|v| v.len())
            .map(|v| v.trim().to_string())
    }
}

/// Split a DN into `(attr, value)` pairs, honouring `\,` escapes.
pub fn dn_components(dn: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in dn.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .filter_map(|rdn| {
            let (key, value) = rdn.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// LDAP-like search collaborator.
pub trait LdapSearch {
    /// Run a subtree search below `base`. A transport failure is an
    /// [`crate::errors::SyncError::Upstream`] error.
    fn search(&self, base: &str, filter: &str) -> SyncResult<Vec<LdapRecord>>;
}

impl<T: LdapSearch + ?Sized> LdapSearch for &T {
    fn search(&self, base: &str, filter: &str) -> SyncResult<Vec<LdapRecord>> {
        (**self).search(base, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_value_wins() {
        let rec = LdapRecord::new("GlueSEUniqueID=se.example.ac.uk")
            .with("GlueSEName", "UKI-X:se")
            .with("GlueSEName", "UKI-X:se.example.ac.uk")
            .with("GlueSEName", "UKI");
        assert_eq!(rec.longest("GlueSEName"), Some("UKI-X:se.example.ac.uk"));
    }

    #[test]
    fn test_longest_tie_keeps_first() {
        let rec = LdapRecord::new("x=y").with("A", "abc").with("A", "xyz");
        assert_eq!(rec.longest("A"), Some("abc"));
    }

    #[test]
    fn test_attribute_lookup_is_case_insensitive() {
        let rec = LdapRecord::new("x=y").with("GLUE2PolicyRule", "vo:lhcb");
        assert_eq!(rec.first("glue2policyrule"), Some("vo:lhcb"));
        assert!(rec.values("missing").is_empty());
        assert_eq!(rec.text("missing"), "");
    }

    #[test]
    fn test_dn_components_and_lookup() {
        let rec = LdapRecord::new(
            "GLUE2ShareID=grid,GLUE2ServiceID=urn:ogf:ComputingService:ce.x.ac.uk:arex,GLUE2GroupID=resource,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue",
        );
        assert_eq!(rec.dn_value("GLUE2DomainID").as_deref(), Some("UKI-X"));
        assert_eq!(
            rec.dn_value("glue2serviceid").as_deref(),
            Some("urn:ogf:ComputingService:ce.x.ac.uk:arex")
        );
        assert!(rec.dn_value("GLUE2EndpointID").is_none());
    }

    #[test]
    fn test_dn_escaped_comma() {
        let parts = dn_components(r"cn=a\,b,o=grid");
        assert_eq!(parts[0], ("cn".to_string(), "a,b".to_string()));
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_keyed_value() {
        let rec = LdapRecord::new("x=y")
            .with("GlueForeignKey", "GlueSiteUniqueID=UKI-X")
            .with("GlueForeignKey", "GlueClusterUniqueID=ce.x.ac.uk");
        assert_eq!(
            rec.keyed_value("GlueForeignKey", "GlueSiteUniqueID").as_deref(),
            Some("UKI-X")
        );
        assert!(rec.keyed_value("GlueForeignKey", "GlueSEUniqueID").is_none());
    }
}
