//! The configuration store (CS) interface and two reference backends.
//!
//! Paths are `/`-separated, e.g. `/Resources/Sites/LCG/LCG.UKI-X.uk/CE`.
//! The last component of an option path is the option name; everything
//! before it is the section. Sections exist implicitly while they hold
//! options.

pub mod memory;
pub mod schema;
pub mod snapshot;
pub mod sqlite;

use crate::errors::{SyncError, SyncResult};

pub const SITES_ROOT: &str = "/Resources/Sites";
pub const STORAGE_ROOT: &str = "/Resources/StorageElements";
pub const HOSTS_ROOT: &str = "/Registry/Hosts";

pub use memory::MemoryConfigStore;
pub use snapshot::CsSnapshot;
pub use sqlite::SqliteConfigStore;

/// Hierarchical key/value store being reconciled.
///
/// Reads always reflect committed state. Mutations are staged until
/// [`ConfigStore::commit`], which publishes all of them or none.
pub trait ConfigStore {
    fn get_value(&self, path: &str) -> SyncResult<Option<String>>;

    /// Names of the direct sub-sections of `path`, sorted.
    fn get_sections(&self, path: &str) -> SyncResult<Vec<String>>;

    /// Names of the options held directly in `path`, sorted.
    fn get_options(&self, path: &str) -> SyncResult<Vec<String>>;

    /// Create an option (or overwrite it).
    fn set_option(&mut self, path: &str, value: &str) -> SyncResult<()>;

    /// Change an option that must already exist when the batch is committed.
    fn modify_value(&mut self, path: &str, value: &str) -> SyncResult<()>;

    fn delete_option(&mut self, path: &str) -> SyncResult<()>;

    fn delete_section(&mut self, path: &str) -> SyncResult<()>;

    fn commit(&mut self) -> SyncResult<()>;

    /// Drop every staged mutation.
    fn discard(&mut self);
}

/// A staged mutation, applied in order at commit time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Set { path: String, value: String },
    Modify { path: String, value: String },
    DeleteOption { path: String },
    DeleteSection { path: String },
}

impl Mutation {
    pub fn path(&self) -> &str {
        match self {
            Mutation::Set { path, .. }
            | Mutation::Modify { path, .. }
            | Mutation::DeleteOption { path }
            | Mutation::DeleteSection { path } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Join path components into an absolute CS path, dropping empty segments.
pub fn cfg_path(parts: &[&str]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect();
    format!("/{}", joined.join("/"))
}

/// Split an option path into `(section, option)`.
pub fn split_path(path: &str) -> (String, String) {
    let normalized = cfg_path(&[path]);
    match normalized.rsplit_once('/') {
        Some(("", option)) => ("/".to_string(), option.to_string()),
        Some((section, option)) => (section.to_string(), option.to_string()),
        None => ("/".to_string(), normalized),
    }
}

/// Whether `path` is `section` itself or lies below it.
pub fn is_within(path: &str, section: &str) -> bool {
    let section = section.trim_end_matches('/');
    if section.is_empty() {
        return true;
    }
    path == section
        || (path.len() > section.len()
            && path.starts_with(section)
            && path.as_bytes()[section.len()] == b'/')
}

/// Direct children of `section` among a set of option paths, as
/// `(sections, options)`, both sorted and de-duplicated.
pub fn children<'a, I>(paths: I, section: &str) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}/", cfg_path(&[section]).trim_end_matches('/'));
    let mut sections = std::collections::BTreeSet::new();
    let mut options = std::collections::BTreeSet::new();
    for path in paths {
        let Some(rest) = path.strip_prefix(prefix.as_str()) else {
            continue;
        };
        match rest.split_once('/') {
            Some((child, _)) => {
                sections.insert(child.to_string());
            }
            None if !rest.is_empty() => {
                options.insert(rest.to_string());
            }
            None => {}
        }
    }
    (sections.into_iter().collect(), options.into_iter().collect())
}

pub(crate) fn missing_option(path: &str) -> SyncError {
    SyncError::Store(format!("cannot modify missing option {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_path_normalizes_separators() {
        assert_eq!(
            cfg_path(&["/Resources/Sites", "LCG", "LCG.UKI-X.uk/", "CE"]),
            "/Resources/Sites/LCG/LCG.UKI-X.uk/CE"
        );
        assert_eq!(cfg_path(&[]), "/");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/Resources/StorageElements/UKI-X-disk/Host"),
            (
                "/Resources/StorageElements/UKI-X-disk".to_string(),
                "Host".to_string()
            )
        );
        assert_eq!(split_path("/Top"), ("/".to_string(), "Top".to_string()));
    }

    #[test]
    fn test_is_within_respects_component_boundaries() {
        assert!(is_within("/a/b/c", "/a/b"));
        assert!(is_within("/a/b", "/a/b"));
        assert!(!is_within("/a/bc", "/a/b"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_children_splits_sections_and_options() {
        let paths = [
            "/R/S/LCG/A/CE",
            "/R/S/LCG/A/CEs/ce1/CEType",
            "/R/S/LCG/B/Name",
            "/R/S/VAC/C/Name",
        ];
        let (sections, options) = children(paths.iter().copied(), "/R/S/LCG");
        assert_eq!(sections, vec!["A", "B"]);
        assert!(options.is_empty());
        let (sections, options) = children(paths.iter().copied(), "/R/S/LCG/A");
        assert_eq!(sections, vec!["CEs"]);
        assert_eq!(options, vec!["CE"]);
    }
}
