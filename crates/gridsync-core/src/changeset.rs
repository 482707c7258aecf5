//! Buffered, diffing mutation set over a [`ConfigStore`].
//!
//! Every writer in the pipeline goes through a [`ChangeSet`] instead of the
//! store. Values are compared against the committed state before anything
//! is staged, so re-running with unchanged inputs stages nothing. Appends are
//! collected per option and folded into a single write at commit time.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::split_list;
use crate::errors::{SyncError, SyncResult};
use crate::store::{cfg_path, is_within, split_path, ConfigStore};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value to be written to a CS option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CsValue {
    Scalar(String),
    /// Written sorted and de-duplicated; compared as a set.
    Set(BTreeSet<String>),
    /// Written in the given order.
    List(Vec<String>),
}

impl CsValue {
    pub fn render(&self) -> String {
        match self {
            CsValue::Scalar(s) => s.clone(),
            CsValue::Set(items) => join(items.iter()),
            CsValue::List(items) => join(items.iter()),
        }
    }

    fn is_set(&self) -> bool {
        matches!(self, CsValue::Set(_))
    }
}

fn join<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items.map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Canonical form of a comma separated option read back from the store.
fn normalize_set(raw: &str) -> String {
    let items: BTreeSet<String> = split_list(raw).collect();
    join(items.iter())
}

fn unchanged(current: Option<&str>, new: &str, as_set: bool) -> bool {
    match current {
        None => false,
        Some(cur) if as_set => normalize_set(cur) == new,
        Some(cur) => cur == new,
    }
}

impl From<&str> for CsValue {
    fn from(value: &str) -> Self {
        CsValue::Scalar(value.to_string())
    }
}

impl From<String> for CsValue {
    fn from(value: String) -> Self {
        CsValue::Scalar(value)
    }
}

impl From<&String> for CsValue {
    fn from(value: &String) -> Self {
        CsValue::Scalar(value.clone())
    }
}

impl From<u64> for CsValue {
    fn from(value: u64) -> Self {
        CsValue::Scalar(value.to_string())
    }
}

impl From<u32> for CsValue {
    fn from(value: u32) -> Self {
        CsValue::Scalar(value.to_string())
    }
}

impl From<u16> for CsValue {
    fn from(value: u16) -> Self {
        CsValue::Scalar(value.to_string())
    }
}

impl From<BTreeSet<String>> for CsValue {
    fn from(value: BTreeSet<String>) -> Self {
        CsValue::Set(value)
    }
}

impl From<&BTreeSet<String>> for CsValue {
    fn from(value: &BTreeSet<String>) -> Self {
        CsValue::Set(value.clone())
    }
}

impl From<Vec<String>> for CsValue {
    fn from(value: Vec<String>) -> Self {
        CsValue::List(value)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Set,
    AppendUnique,
    Append,
    RemoveSection,
    RemoveOption,
    RemoveValue,
}

impl ChangeKind {
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            ChangeKind::RemoveSection | ChangeKind::RemoveOption | ChangeKind::RemoveValue
        )
    }
}

/// One materialized change. `new_value` is `None` for option and section
/// deletions; `option` is `None` for section deletions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub section: String,
    pub option: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl ChangeEntry {
    pub fn path(&self) -> String {
        match &self.option {
            Some(option) => cfg_path(&[&self.section, option]),
            None => self.section.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The store accepted every entry.
    Committed(Vec<ChangeEntry>),
    /// Nothing differed from the store; the store was not touched.
    NoChanges,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum EntryKey {
    Option(String),
    Section(String),
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// Mutation buffer owned by one reconciliation run.
pub struct ChangeSet<'s> {
    store: &'s mut dyn ConfigStore,
    /// Committed values, read at most once per path.
    cache: HashMap<String, Option<String>>,
    entries: IndexMap<EntryKey, ChangeEntry>,
    removed_sections: Vec<String>,
    unique_appends: IndexMap<String, BTreeSet<String>>,
    ordered_appends: IndexMap<String, Vec<String>>,
}

impl<'s> ChangeSet<'s> {
    pub fn new(store: &'s mut dyn ConfigStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            entries: IndexMap::new(),
            removed_sections: Vec::new(),
            unique_appends: IndexMap::new(),
            ordered_appends: IndexMap::new(),
        }
    }

    /// Materialized entries so far, in staging order. Buffered appends are
    /// not included until [`ChangeSet::flush_appends`].
    pub fn entries(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only access to the underlying store's committed state.
    pub fn store(&self) -> &dyn ConfigStore {
        &*self.store
    }

    fn is_removed(&self, path: &str) -> bool {
        self.removed_sections.iter().any(|s| is_within(path, s))
    }

    /// Committed value, masked by sections removed in this run.
    fn committed_value(&mut self, path: &str) -> SyncResult<Option<String>> {
        if self.is_removed(path) {
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }
        let value = self.store.get_value(path)?;
        self.cache.insert(path.to_string(), value.clone());
        Ok(value)
    }

    fn value_at(&mut self, path: &str) -> SyncResult<Option<String>> {
        if let Some(entry) = self.entries.get(&EntryKey::Option(path.to_string())) {
            return Ok(entry.new_value.clone());
        }
        self.committed_value(path)
    }

    /// The option's value as this run will leave it, excluding buffered
    /// appends.
    pub fn value(&mut self, section: &str, option: &str) -> SyncResult<Option<String>> {
        self.value_at(&cfg_path(&[section, option]))
    }

    /// Sub-sections of `section` as this run will leave them: committed
    /// sections minus removed ones, plus sections created by staged writes.
    pub fn sections(&mut self, section: &str) -> SyncResult<Vec<String>> {
        let base = cfg_path(&[section]);
        let mut names: BTreeSet<String> = if self.is_removed(&base) {
            BTreeSet::new()
        } else {
            self.store
                .get_sections(&base)?
                .into_iter()
                .filter(|name| !self.is_removed(&cfg_path(&[&base, name])))
                .collect()
        };
        let staged = self.entries.iter().filter_map(|(key, entry)| match key {
            EntryKey::Option(path) if entry.new_value.is_some() => Some(path.as_str()),
            _ => None,
        });
        let buffered = self
            .unique_appends
            .keys()
            .chain(self.ordered_appends.keys())
            .map(String::as_str);
        let (created, _) = crate::store::children(staged.chain(buffered), &base);
        names.extend(created);
        Ok(names.into_iter().collect())
    }

    /// Overwrite an option. A no-op when the value is already current.
    pub fn add(
        &mut self,
        section: &str,
        option: &str,
        value: impl Into<CsValue>,
    ) -> SyncResult<bool> {
        let value = value.into();
        self.stage(section, option, &value, ChangeKind::Set)
    }

    fn stage(
        &mut self,
        section: &str,
        option: &str,
        value: &CsValue,
        kind: ChangeKind,
    ) -> SyncResult<bool> {
        let path = cfg_path(&[section, option]);
        let new = value.render();
        let as_set = value.is_set();

        let current = self.value_at(&path)?;
        if unchanged(current.as_deref(), &new, as_set) || (current.is_none() && new.is_empty()) {
            return Ok(false);
        }

        let key = EntryKey::Option(path.clone());
        let base = self.committed_value(&path)?;
        if unchanged(base.as_deref(), &new, as_set) {
            if self.entries.shift_remove(&key).is_some() {
                debug!("{path} reverted to its committed value");
            }
            return Ok(false);
        }

        match (&base, kind) {
            (_, ChangeKind::RemoveValue) => info!("Removing value from {path}: now {new:?}"),
            (None, _) => info!("Setting {path} = {new:?}"),
            (Some(old), _) => info!("Modifying {path}: {old:?} -> {new:?}"),
        }
        let (section, option) = split_path(&path);
        self.entries.shift_remove(&key);
        self.entries.insert(
            key,
            ChangeEntry {
                kind,
                section,
                option: Some(option),
                old_value: base,
                new_value: Some(new),
            },
        );
        Ok(true)
    }

    /// Add `value` to a set-valued option. Resolved at commit.
    pub fn append_unique(&mut self, section: &str, option: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        self.unique_appends
            .entry(cfg_path(&[section, option]))
            .or_default()
            .insert(value.to_string());
    }

    /// Add `value` to the end of an ordered option. Duplicates are kept.
    /// Resolved at commit.
    pub fn append(&mut self, section: &str, option: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        self.ordered_appends
            .entry(cfg_path(&[section, option]))
            .or_default()
            .push(value.to_string());
    }

    /// Remove a whole section, a whole option, or one value of an option.
    pub fn remove(
        &mut self,
        section: &str,
        option: Option<&str>,
        value: Option<&str>,
    ) -> SyncResult<bool> {
        match (option, value) {
            (None, _) => self.remove_section(section),
            (Some(option), None) => self.remove_option(section, option),
            (Some(option), Some(value)) => self.remove_value(section, option, value),
        }
    }

    pub fn remove_section(&mut self, section: &str) -> SyncResult<bool> {
        let path = cfg_path(&[section]);
        if self.is_removed(&path) {
            return Ok(false);
        }

        let staged_below: Vec<EntryKey> = self
            .entries
            .keys()
            .filter(|key| match key {
                EntryKey::Option(p) | EntryKey::Section(p) => is_within(p, &path),
            })
            .cloned()
            .collect();
        for key in &staged_below {
            self.entries.shift_remove(key);
        }
        self.unique_appends.retain(|p, _| !is_within(p, &path));
        self.ordered_appends.retain(|p, _| !is_within(p, &path));

        let exists = !self.store.get_options(&path)?.is_empty()
            || !self.store.get_sections(&path)?.is_empty();
        if !exists {
            return Ok(!staged_below.is_empty());
        }

        info!("Removing section {path}");
        self.removed_sections.push(path.clone());
        self.entries.insert(
            EntryKey::Section(path.clone()),
            ChangeEntry {
                kind: ChangeKind::RemoveSection,
                section: path,
                option: None,
                old_value: None,
                new_value: None,
            },
        );
        Ok(true)
    }

    pub fn remove_option(&mut self, section: &str, option: &str) -> SyncResult<bool> {
        let path = cfg_path(&[section, option]);
        self.unique_appends.shift_remove(&path);
        self.ordered_appends.shift_remove(&path);

        let key = EntryKey::Option(path.clone());
        let Some(old) = self.committed_value(&path)? else {
            return Ok(self.entries.shift_remove(&key).is_some());
        };
        if self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.new_value.is_none())
        {
            return Ok(false);
        }

        info!("Removing option {path}");
        let (section, option) = split_path(&path);
        self.entries.shift_remove(&key);
        self.entries.insert(
            key,
            ChangeEntry {
                kind: ChangeKind::RemoveOption,
                section,
                option: Some(option),
                old_value: Some(old),
                new_value: None,
            },
        );
        Ok(true)
    }

    /// Drop one member of a comma separated option. Removing the last member
    /// removes the option.
    pub fn remove_value(&mut self, section: &str, option: &str, value: &str) -> SyncResult<bool> {
        let value = value.trim();
        let path = cfg_path(&[section, option]);
        let mut purged = false;
        if let Some(buffer) = self.unique_appends.get_mut(&path) {
            purged |= buffer.remove(value);
        }
        if let Some(buffer) = self.ordered_appends.get_mut(&path) {
            let before = buffer.len();
            buffer.retain(|v| v != value);
            purged |= buffer.len() != before;
        }

        let Some(current) = self.value_at(&path)? else {
            return Ok(purged);
        };
        let items: Vec<String> = split_list(&current).collect();
        if !items.iter().any(|item| item == value) {
            return Ok(purged);
        }
        let remaining: Vec<String> = items.into_iter().filter(|item| item != value).collect();
        if remaining.is_empty() {
            return self.remove_option(section, option);
        }
        self.stage(section, option, &CsValue::List(remaining), ChangeKind::RemoveValue)
    }

    /// Fold every buffered append into one staged write per option, reading
    /// the option's current value once.
    pub fn flush_appends(&mut self) -> SyncResult<()> {
        let unique = std::mem::take(&mut self.unique_appends);
        for (path, values) in unique {
            let (section, option) = split_path(&path);
            let mut merged: BTreeSet<String> = self
                .value_at(&path)?
                .map(|v| split_list(&v).collect())
                .unwrap_or_default();
            merged.extend(values);
            self.stage(&section, &option, &CsValue::Set(merged), ChangeKind::AppendUnique)?;
        }

        let ordered = std::mem::take(&mut self.ordered_appends);
        for (path, values) in ordered {
            let (section, option) = split_path(&path);
            let mut items: Vec<String> = self
                .value_at(&path)?
                .map(|v| split_list(&v).collect())
                .unwrap_or_default();
            items.extend(values);
            self.stage(&section, &option, &CsValue::List(items), ChangeKind::Append)?;
        }
        Ok(())
    }

    /// Flush appends, push every entry to the store and commit it atomically.
    ///
    /// On any store error the staged store mutations are discarded and the
    /// whole batch is reported as failed.
    pub fn commit(mut self) -> SyncResult<CommitOutcome> {
        self.flush_appends()?;
        if self.entries.is_empty() {
            info!("No changes to commit to the CS");
            return Ok(CommitOutcome::NoChanges);
        }

        let entries: Vec<ChangeEntry> = self.entries.into_values().collect();
        let count = entries.len();
        let applied = (|| -> SyncResult<()> {
            for entry in &entries {
                let path = entry.path();
                match (&entry.option, &entry.new_value) {
                    (None, _) => self.store.delete_section(&path)?,
                    (Some(_), None) => self.store.delete_option(&path)?,
                    (Some(_), Some(value)) if entry.old_value.is_none() => {
                        self.store.set_option(&path, value)?
                    }
                    (Some(_), Some(value)) => self.store.modify_value(&path, value)?,
                }
            }
            self.store.commit()
        })();

        match applied {
            Ok(()) => {
                info!("Committed {count} changes to the CS");
                Ok(CommitOutcome::Committed(entries))
            }
            Err(e) => {
                self.store.discard();
                warn!("CS commit of {count} changes failed: {e}");
                Err(SyncError::Commit(format!("{count} staged changes not applied: {e}")))
            }
        }
    }
}
