//! gridsync core library: reconciles grid resource information published in
//! BDII (GLUE1/GLUE2 over LDAP) and GOCDB into a hierarchical configuration
//! store.
//!
//! A run fetches upstream records through the [`source`] collaborators,
//! turns them into canonical records ([`normalize`]), merges duplicates
//! ([`aggregate`]), gives each resource a stable configuration name
//! ([`naming`]), stages the resulting writes in a [`changeset::ChangeSet`]
//! ([`writer`]), removes resources no longer published ([`reaper`]) and
//! commits everything at once. [`driver::ReconciliationDriver`] runs those
//! stages in order.

pub mod aggregate;
pub mod changeset;
pub mod config;
pub mod driver;
pub mod errors;
pub mod models;
pub mod naming;
pub mod normalize;
pub mod reaper;
pub mod source;
pub mod store;
pub mod writer;

pub use changeset::{ChangeEntry, ChangeKind, ChangeSet, CommitOutcome};
pub use config::SyncConfig;
pub use driver::{ReconciliationDriver, RunOutcome, RunReport, RunStage};
pub use errors::{SyncError, SyncResult};
pub use source::{GocdbClient, LdapSearch, LdifDirectory, StaticGocdb};
pub use store::{ConfigStore, MemoryConfigStore, SqliteConfigStore};
