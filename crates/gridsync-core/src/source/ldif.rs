//! LDIF parsing and an in-memory directory that answers filter searches.
//!
//! `ldapsearch -x -LLL -o ldif-wrap=no` output is the interchange format:
//! a `dn:` line, `attr: value` lines, entries separated by blank lines.

use tracing::warn;

use crate::errors::{SyncError, SyncResult};
use crate::source::filter::LdapFilter;
use crate::source::{LdapRecord, LdapSearch};

/// Parse LDIF text into records. Wrapped lines (leading single space) are
/// joined; `#` comments are ignored.
pub fn parse_ldif(text: &str) -> SyncResult<Vec<LdapRecord>> {
    let mut logical: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(cont) = line.strip_prefix(' ') {
            match logical.last_mut() {
                Some(prev) if !prev.is_empty() => prev.push_str(cont),
                _ => {
                    return Err(SyncError::Upstream(format!(
                        "LDIF continuation line without a preceding attribute: {line:?}"
                    )))
                }
            }
        } else {
            logical.push(line.trim_end().to_string());
        }
    }

    let mut records = Vec::new();
    let mut current: Option<LdapRecord> = None;
    for line in logical {
        if line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            if let Some(rec) = current.take() {
                records.push(rec);
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(SyncError::Upstream(format!("malformed LDIF line: {line:?}")));
        };
        let value = if let Some(encoded) = value.strip_prefix(':') {
            warn!("base64 LDIF value for {name} kept verbatim");
            encoded.trim()
        } else {
            value.trim()
        };
        if name.eq_ignore_ascii_case("dn") {
            if let Some(rec) = current.take() {
                records.push(rec);
            }
            current = Some(LdapRecord::new(value));
            continue;
        }
        match current.as_mut() {
            Some(rec) => rec.push(name.trim(), value),
            None => {
                return Err(SyncError::Upstream(format!(
                    "LDIF attribute before any dn: {line:?}"
                )))
            }
        }
    }
    if let Some(rec) = current.take() {
        records.push(rec);
    }
    Ok(records)
}

/// A static directory of LDAP records searchable with GLUE filters.
#[derive(Clone, Debug, Default)]
pub struct LdifDirectory {
    records: Vec<LdapRecord>,
}

impl LdifDirectory {
    pub fn new(records: Vec<LdapRecord>) -> Self {
        Self { records }
    }

    pub fn from_ldif(text: &str) -> SyncResult<Self> {
        Ok(Self::new(parse_ldif(text)?))
    }

    pub fn push(&mut self, record: LdapRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn under_base(dn: &str, base: &str) -> bool {
    let base = base.trim();
    if base.is_empty() {
        return true;
    }
    let dn = dn.to_ascii_lowercase().replace(", ", ",");
    let base = base.to_ascii_lowercase().replace(", ", ",");
    dn == base || dn.ends_with(&format!(",{base}"))
}

impl LdapSearch for LdifDirectory {
    fn search(&self, base: &str, filter: &str) -> SyncResult<Vec<LdapRecord>> {
        let parsed = LdapFilter::parse(filter)?;
        Ok(self
            .records
            .iter()
            .filter(|rec| under_base(&rec.dn, base) && parsed.matches(rec))
            .cloned()
            .collect())
    }
}
