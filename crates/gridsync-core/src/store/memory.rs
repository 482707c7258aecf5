//! In-memory configuration store.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::SyncResult;
use crate::store::{children, cfg_path, is_within, missing_option, ConfigStore, Mutation};

/// Flat ordered map of option path to value with staged mutations.
#[derive(Clone, Debug, Default)]
pub struct MemoryConfigStore {
    committed: BTreeMap<String, String>,
    pending: Vec<Mutation>,
    commits: usize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with already-committed options.
    pub fn with_options<I, K, V>(options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let committed = options
            .into_iter()
            .map(|(k, v)| (cfg_path(&[k.as_ref()]), v.into()))
            .collect();
        Self {
            committed,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.committed
    }

    pub fn pending(&self) -> &[Mutation] {
        &self.pending
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits
    }
}

/// Apply one mutation to a flat option map.
pub(crate) fn apply(map: &mut BTreeMap<String, String>, mutation: &Mutation) -> SyncResult<()> {
    match mutation {
        Mutation::Set { path, value } => {
            map.insert(path.clone(), value.clone());
        }
        Mutation::Modify { path, value } => match map.get_mut(path) {
            Some(slot) => *slot = value.clone(),
            None => return Err(missing_option(path)),
        },
        Mutation::DeleteOption { path } => {
            map.remove(path);
        }
        Mutation::DeleteSection { path } => {
            map.retain(|key, _| !is_within(key, path));
        }
    }
    Ok(())
}

impl ConfigStore for MemoryConfigStore {
    fn get_value(&self, path: &str) -> SyncResult<Option<String>> {
        Ok(self.committed.get(&cfg_path(&[path])).cloned())
    }

    fn get_sections(&self, path: &str) -> SyncResult<Vec<String>> {
        Ok(children(self.committed.keys().map(String::as_str), path).0)
    }

    fn get_options(&self, path: &str) -> SyncResult<Vec<String>> {
        Ok(children(self.committed.keys().map(String::as_str), path).1)
    }

    fn set_option(&mut self, path: &str, value: &str) -> SyncResult<()> {
        self.pending.push(Mutation::Set {
            path: cfg_path(&[path]),
            value: value.to_string(),
        });
        Ok(())
    }

    fn modify_value(&mut self, path: &str, value: &str) -> SyncResult<()> {
        self.pending.push(Mutation::Modify {
            path: cfg_path(&[path]),
            value: value.to_string(),
        });
        Ok(())
    }

    fn delete_option(&mut self, path: &str) -> SyncResult<()> {
        self.pending.push(Mutation::DeleteOption {
            path: cfg_path(&[path]),
        });
        Ok(())
    }

    fn delete_section(&mut self, path: &str) -> SyncResult<()> {
        self.pending.push(Mutation::DeleteSection {
            path: cfg_path(&[path]),
        });
        Ok(())
    }

    fn commit(&mut self) -> SyncResult<()> {
        let mut next = self.committed.clone();
        let pending = std::mem::take(&mut self.pending);
        for mutation in &pending {
            apply(&mut next, mutation)?;
        }
        debug!("memory store committed {} mutations", pending.len());
        self.committed = next;
        self.commits += 1;
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;

    #[test]
    fn test_reads_reflect_committed_state_only() {
        let mut store = MemoryConfigStore::new();
        store.set_option("/A/b", "1").unwrap();
        assert_eq!(store.get_value("/A/b").unwrap(), None);
        store.commit().unwrap();
        assert_eq!(store.get_value("/A/b").unwrap().as_deref(), Some("1"));
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn test_failed_commit_leaves_state_untouched() {
        let mut store = MemoryConfigStore::with_options([("/A/b", "1")]);
        store.set_option("/A/c", "2").unwrap();
        store.modify_value("/A/missing", "3").unwrap();
        let err = store.commit().unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(store.get_value("/A/c").unwrap(), None);
        assert!(store.pending().is_empty());
        assert_eq!(store.commits(), 0);
    }

    #[test]
    fn test_delete_section_removes_descendants_only() {
        let mut store = MemoryConfigStore::with_options([
            ("/S/ab/x", "1"),
            ("/S/ab/sub/y", "2"),
            ("/S/abc/z", "3"),
        ]);
        store.delete_section("/S/ab").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_sections("/S").unwrap(), vec!["abc"]);
    }

    #[test]
    fn test_discard_drops_pending() {
        let mut store = MemoryConfigStore::new();
        store.set_option("/A/b", "1").unwrap();
        store.discard();
        store.commit().unwrap();
        assert!(store.options().is_empty());
    }
}
