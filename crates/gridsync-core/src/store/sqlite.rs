//! SQLite-backed configuration store.
//!
//! Staged mutations are applied inside one transaction per commit, so a
//! rejected mutation leaves the database exactly as it was.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, warn};

use crate::errors::SyncResult;
use crate::store::{cfg_path, children, missing_option, schema, split_path, ConfigStore, Mutation};

pub struct SqliteConfigStore {
    conn: Connection,
    pending: Vec<Mutation>,
}

impl SqliteConfigStore {
    /// Open (creating if needed) a store at `path`. Parent directories are
    /// created.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SyncResult<Self> {
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            pending: Vec::new(),
        })
    }

    /// Number of commits recorded in `commit_history`.
    pub fn commit_count(&self) -> SyncResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM commit_history;", [], |row| row.get(0))?)
    }

    fn paths_under(&self, section: &str) -> SyncResult<Vec<String>> {
        let prefix = format!("{}/", cfg_path(&[section]).trim_end_matches('/'));
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM cs_options WHERE substr(path, 1, ?1) = ?2;")?;
        let rows = stmt.query_map(params![prefix.len() as i64, prefix], |row| {
            row.get::<_, String>(0)
        })?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }
}

fn apply(tx: &Transaction<'_>, mutation: &Mutation) -> SyncResult<()> {
    match mutation {
        Mutation::Set { path, value } => {
            let (section, _) = split_path(path);
            tx.execute(
                "INSERT INTO cs_options(path, section, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(path) DO UPDATE SET value = excluded.value, \
                 updated_at = CURRENT_TIMESTAMP;",
                params![path, section, value],
            )?;
        }
        Mutation::Modify { path, value } => {
            let changed = tx.execute(
                "UPDATE cs_options SET value = ?2, updated_at = CURRENT_TIMESTAMP \
                 WHERE path = ?1;",
                params![path, value],
            )?;
            if changed == 0 {
                return Err(missing_option(path));
            }
        }
        Mutation::DeleteOption { path } => {
            tx.execute("DELETE FROM cs_options WHERE path = ?1;", params![path])?;
        }
        Mutation::DeleteSection { path } => {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            tx.execute(
                "DELETE FROM cs_options WHERE path = ?1 OR substr(path, 1, ?2) = ?3;",
                params![path, prefix.len() as i64, prefix],
            )?;
        }
    }
    Ok(())
}

impl ConfigStore for SqliteConfigStore {
    fn get_value(&self, path: &str) -> SyncResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM cs_options WHERE path = ?1;",
                params![cfg_path(&[path])],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn get_sections(&self, path: &str) -> SyncResult<Vec<String>> {
        let paths = self.paths_under(path)?;
        Ok(children(paths.iter().map(String::as_str), path).0)
    }

    fn get_options(&self, path: &str) -> SyncResult<Vec<String>> {
        let paths = self.paths_under(path)?;
        Ok(children(paths.iter().map(String::as_str), path).1)
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
        let pending = std::mem::take(&mut self.pending);
        let tx = self.conn.transaction()?;
        for mutation in &pending {
            if let Err(e) = apply(&tx, mutation) {
                warn!("rolling back CS commit at {}: {e}", mutation.path());
                return Err(e);
            }
        }
        tx.execute(
            "INSERT INTO commit_history(mutation_count) VALUES (?1);",
            params![pending.len() as i64],
        )?;
        tx.commit()?;
        debug!("sqlite store committed {} mutations", pending.len());
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }
}
