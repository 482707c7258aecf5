//! LDAP search filters: builders used by the normalizers and an evaluator
//! for the in-memory directory.
//!
//! The evaluator covers the subset of RFC 4515 that GLUE queries use:
//! `&`, `|`, `!`, equality, presence, substrings and the `attr:dn:=value`
//! extensible match against DN components. Matching is case-insensitive.

use crate::errors::{SyncError, SyncResult};
use crate::source::{dn_components, LdapRecord};

/// Rows per OR-filter when a filter enumerates many (site, service) pairs.
pub const FILTER_CHUNK_SIZE: usize = 300;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Escape a value for inclusion in a filter string.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

/// `(|(attr=v1)(attr=v2)...)`
pub fn in_values<I, S>(attr: &str, values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from("(|");
    for value in values {
        out.push_str(&format!("({attr}={})", escape_value(value.as_ref())));
    }
    out.push(')');
    out
}

/// `(|(&(a1=x1)(a2=y1))(&(a1=x2)(a2=y2))...)` for rows of `attrs.len()` values.
pub fn in_tuples(attrs: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::from("(|");
    for row in rows {
        out.push_str("(&");
        for (attr, value) in attrs.iter().zip(row) {
            out.push_str(&format!("({attr}={})", escape_value(value)));
        }
        out.push(')');
    }
    out.push(')');
    out
}

/// Build one `in_tuples` filter per chunk of [`FILTER_CHUNK_SIZE`] rows.
pub fn chunked_tuples(attrs: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    rows.chunks(FILTER_CHUNK_SIZE)
        .map(|chunk| in_tuples(attrs, chunk))
        .collect()
}

// ---------------------------------------------------------------------------
// Parsed filter
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LdapFilter {
    And(Vec<LdapFilter>),
    Or(Vec<LdapFilter>),
    Not(Box<LdapFilter>),
    Equal {
        attr: String,
        value: String,
    },
    Present {
        attr: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    /// `attr:dn:=value`: the attribute or any DN component matches.
    DnMatch {
        attr: String,
        value: String,
    },
}

impl LdapFilter {
    pub fn parse(input: &str) -> SyncResult<Self> {
        let chars: Vec<char> = input.trim().chars().collect();
        let mut parser = Parser { chars, pos: 0 };
        let filter = parser.filter()?;
        if parser.pos != parser.chars.len() {
            return Err(SyncError::Filter(format!(
                "trailing input at offset {} in {input:?}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    pub fn matches(&self, record: &LdapRecord) -> bool {
        match self {
            LdapFilter::And(items) => items.iter().all(|f| f.matches(record)),
            LdapFilter::Or(items) => items.iter().any(|f| f.matches(record)),
            LdapFilter::Not(inner) => !inner.matches(record),
            LdapFilter::Present { attr } => {
                attr.eq_ignore_ascii_case("objectClass") || record.has(attr)
            }
            LdapFilter::Equal { attr, value } => record
                .values(attr)
                .iter()
                .any(|v| v.trim().eq_ignore_ascii_case(value)),
            LdapFilter::Substring {
                attr,
                initial,
                any,
                last,
            } => record
                .values(attr)
                .iter()
                .any(|v| substring_match(v, initial.as_deref(), any, last.as_deref())),
            LdapFilter::DnMatch { attr, value } => {
                record
                    .values(attr)
                    .iter()
                    .any(|v| v.trim().eq_ignore_ascii_case(value))
                    || dn_components(&record.dn)
                        .iter()
                        .any(|(k, v)| k.eq_ignore_ascii_case(attr) && v.eq_ignore_ascii_case(value))
            }
        }
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let haystack = value.to_lowercase();
    let mut rest = haystack.as_str();
    if let Some(prefix) = initial {
        let prefix = prefix.to_lowercase();
        match rest.strip_prefix(prefix.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(suffix) => rest.ends_with(suffix.to_lowercase().as_str()),
        None => true,
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, ch: char) -> SyncResult<()> {
        match self.peek() {
            Some(c) if c == ch => {
                self.pos += 1;
                Ok(())
            }
            other => Err(SyncError::Filter(format!(
                "expected {ch:?} at offset {}, found {other:?}",
                self.pos
            ))),
        }
    }

    fn filter(&mut self) -> SyncResult<LdapFilter> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                LdapFilter::And(self.filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                LdapFilter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                LdapFilter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(SyncError::Filter("unexpected end of filter".into())),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> SyncResult<Vec<LdapFilter>> {
        let mut items = Vec::new();
        while self.peek() == Some('(') {
            items.push(self.filter()?);
        }
        Ok(items)
    }

    fn item(&mut self) -> SyncResult<LdapFilter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '=' || c == ')' || c == '(' {
                break;
            }
            self.pos += 1;
        }
        let lhs: String = self.chars[start..self.pos].iter().collect();
        self.expect('=')?;

        let raw_start = self.pos;
        while let Some(c) = self.peek() {
            if c == ')' {
                break;
            }
            if c == '(' {
                return Err(SyncError::Filter(format!(
                    "unescaped '(' in value at offset {}",
                    self.pos
                )));
            }
            self.pos += 1;
        }
        let raw: String = self.chars[raw_start..self.pos].iter().collect();

        if let Some(ext) = lhs.strip_suffix(':') {
            let attr = strip_suffix_ignore_case(ext, ":dn").unwrap_or(ext);
            if attr.is_empty() {
                return Err(SyncError::Filter(format!("empty attribute in {lhs:?}")));
            }
            return Ok(LdapFilter::DnMatch {
                attr: attr.to_string(),
                value: unescape(&raw)?,
            });
        }

        let attr = lhs.trim().to_string();
        if attr.is_empty() || attr.ends_with(['~', '>', '<']) {
            return Err(SyncError::Filter(format!(
                "unsupported filter item {lhs:?}={raw:?}"
            )));
        }

        if raw == "*" {
            return Ok(LdapFilter::Present { attr });
        }
        if !raw.contains('*') {
            return Ok(LdapFilter::Equal {
                attr,
                value: unescape(&raw)?,
            });
        }

        let pieces: Vec<&str> = raw.split('*').collect();
        let initial = Some(pieces[0]).filter(|p| !p.is_empty()).map(unescape).transpose()?;
        let last_piece = pieces[pieces.len() - 1];
        let last = Some(last_piece)
            .filter(|p| !p.is_empty())
            .map(unescape)
            .transpose()?;
        let any = pieces[1..pieces.len() - 1]
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| unescape(p))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(LdapFilter::Substring {
            attr,
            initial,
            any,
            last,
        })
    }
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    if text.len() >= suffix.len()
        && text.is_char_boundary(text.len() - suffix.len())
        && text[text.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    {
        Some(&text[..text.len() - suffix.len()])
    } else {
        None
    }
}

fn unescape(raw: &str) -> SyncResult<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| SyncError::Filter(format!("truncated escape in {raw:?}")))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| SyncError::Filter(format!("bad escape \\{hex} in {raw:?}")))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| SyncError::Filter(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
