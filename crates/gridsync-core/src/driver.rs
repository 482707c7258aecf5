//! One reconciliation run, start to commit.
//!
//! Stages run in a fixed order and the report records the last one reached.
//! Upstream, snapshot, store and commit errors end the run with nothing
//! committed; naming and normalization problems only skip the resource
//! they concern.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::aggregate::{aggregate_sites, aggregate_storage};
use crate::changeset::{ChangeEntry, ChangeSet, CommitOutcome};
use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::models::{RegistryHost, ResourceKind, Site, SkippedResource, StorageElement};
use crate::naming::NamingResolver;
use crate::normalize::{fetch_all, Normalized};
use crate::reaper::{StaleResource, StalenessReaper};
use crate::source::{GocdbClient, LdapSearch};
use crate::store::{ConfigStore, CsSnapshot};
use crate::writer::{write_host, write_se, write_site};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    FetchUpstream,
    Normalize,
    Aggregate,
    ResolveNames,
    Write,
    ReapStale,
    Commit,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Start => "start",
            RunStage::FetchUpstream => "fetch-upstream",
            RunStage::Normalize => "normalize",
            RunStage::Aggregate => "aggregate",
            RunStage::ResolveNames => "resolve-names",
            RunStage::Write => "write",
            RunStage::ReapStale => "reap-stale",
            RunStage::Commit => "commit",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Committed,
    NoChanges,
    Failed { reason: String },
}

/// What a run did, for the caller and for notification collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Last stage entered; for a failed run, the stage that failed.
    pub stage: RunStage,
    pub changes: usize,
    pub additions: usize,
    pub removals: usize,
    pub skipped: Vec<SkippedResource>,
    pub stale: Vec<StaleResource>,
    pub entries: Vec<ChangeEntry>,
    /// SHA-256 of the committed entries; `None` when nothing was committed.
    pub digest: Option<String>,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn new() -> Self {
        Self {
            outcome: RunOutcome::NoChanges,
            stage: RunStage::Start,
            changes: 0,
            additions: 0,
            removals: 0,
            skipped: Vec::new(),
            stale: Vec::new(),
            entries: Vec::new(),
            digest: None,
            elapsed_ms: 0,
        }
    }

    fn enter(&mut self, stage: RunStage) {
        debug!("run stage: {stage}");
        self.stage = stage;
    }

    fn skip(&mut self, kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) {
        let skipped = SkippedResource::new(kind, id, reason);
        warn!(kind = ?skipped.kind, id = %skipped.id, "Skipping: {}", skipped.reason);
        self.skipped.push(skipped);
    }

    fn record(&mut self, entries: Vec<ChangeEntry>) {
        self.removals = entries.iter().filter(|e| e.kind.is_removal()).count();
        self.additions = entries.len() - self.removals;
        self.changes = entries.len();
        self.digest = Some(digest_entries(&entries));
        self.entries = entries;
        self.outcome = RunOutcome::Committed;
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }

    /// One line for logs and notification subjects.
    pub fn summary(&self) -> String {
        let status = match &self.outcome {
            RunOutcome::Committed => format!(
                "committed {} changes ({} additions, {} removals)",
                self.changes, self.additions, self.removals
            ),
            RunOutcome::NoChanges => "no changes".to_string(),
            RunOutcome::Failed { reason } => format!("failed at {}: {reason}", self.stage),
        };
        format!(
            "{status}; {} skipped, {} stale, {} ms",
            self.skipped.len(),
            self.stale.len(),
            self.elapsed_ms
        )
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Order-sensitive hash of materialized entries. Two runs with the same
/// effect on the CS share a digest.
pub fn digest_entries(entries: &[ChangeEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(format!("{:?}", entry.kind).as_bytes());
        hasher.update(b"\t");
        hasher.update(entry.path().as_bytes());
        hasher.update(b"\t");
        hasher.update(entry.new_value.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct ReconciliationDriver<'a> {
    config: &'a SyncConfig,
    ldap: &'a dyn LdapSearch,
    gocdb: Option<&'a dyn GocdbClient>,
    today: NaiveDate,
}

impl<'a> ReconciliationDriver<'a> {
    pub fn new(config: &'a SyncConfig, ldap: &'a dyn LdapSearch) -> Self {
        Self {
            config,
            ldap,
            gocdb: None,
            today: chrono::Local::now().date_naive(),
        }
    }

    pub fn with_gocdb(mut self, client: &'a dyn GocdbClient) -> Self {
        self.gocdb = Some(client);
        self
    }

    /// Date written as `LastSeen` and used for staleness.
    pub fn at(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Run every stage against `store`. Never panics on bad data; the
    /// outcome says whether anything was committed.
    pub fn run(&self, store: &mut dyn ConfigStore) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new();
        match self.execute(store, &mut report) {
            Ok(()) => report.enter(RunStage::Done),
            Err(e) => {
                error!("Reconciliation failed at {}: {e}", report.stage);
                report.outcome = RunOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!("Reconciliation {}", report.summary());
        report
    }

    fn execute(&self, store: &mut dyn ConfigStore, report: &mut RunReport) -> SyncResult<()> {
        self.config.validate()?;

        report.enter(RunStage::FetchUpstream);
        let batches = fetch_all(self.ldap, self.gocdb, self.config)?;

        report.enter(RunStage::Normalize);
        let mut normalized = Normalized::default();
        for batch in &batches {
            let part = batch.normalize(self.config, self.today);
            debug!(
                "{}: {} sites, {} SEs, {} hosts, {} skipped",
                batch.label(),
                part.sites.len(),
                part.storage.len(),
                part.hosts.len(),
                part.skipped.len()
            );
            normalized.extend(part);
        }
        report.skipped.append(&mut normalized.skipped);

        report.enter(RunStage::Aggregate);
        let sites = aggregate_sites(normalized.sites);
        let storage = aggregate_storage(normalized.storage);

        report.enter(RunStage::ResolveNames);
        let snapshot = CsSnapshot::capture(&*store, self.config)?;
        let mut resolver = NamingResolver::new(self.config, &snapshot);

        let mut named_ses: Vec<StorageElement> = Vec::new();
        for record in storage {
            let id = format!("{} ({})", record.host, record.latency);
            match resolver.storage_element(record, self.today) {
                Ok((se, skipped)) => {
                    report.skipped.extend(skipped);
                    named_ses.push(se);
                }
                Err(e) if !e.is_fatal() => {
                    report.skip(ResourceKind::StorageElement, id, e.to_string())
                }
                Err(e) => return Err(e),
            }
        }

        let mut named_sites: Vec<(Site, BTreeSet<String>)> = Vec::new();
        for record in sites {
            let id = format!("{}/{}", record.root, record.site_id);
            let (site, skipped) = match resolver.resolve_site(record) {
                Ok(resolved) => resolved,
                Err(e) if !e.is_fatal() => {
                    report.skip(ResourceKind::Site, id, e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };
            report.skipped.extend(skipped);
            let mut ses = site.record.storage_elements.clone();
            if site.record.root == self.config.domain {
                ses.extend(
                    snapshot
                        .ses_for_site(&site.record.site_id)
                        .into_iter()
                        .map(str::to_string),
                );
                ses.extend(resolver.assigned_ses_for(&site.record.site_id));
            }
            named_sites.push((site, ses));
        }

        let hosts: BTreeMap<String, RegistryHost> = normalized
            .hosts
            .into_iter()
            .map(|host| (host.cn.clone(), host))
            .collect();

        report.enter(RunStage::Write);
        let mut changes = ChangeSet::new(store);
        for (site, ses) in &named_sites {
            write_site(&mut changes, site, ses)?;
        }
        for se in &named_ses {
            write_se(&mut changes, se)?;
        }
        for host in hosts.values() {
            write_host(&mut changes, host)?;
        }

        report.enter(RunStage::ReapStale);
        if self.config.remove_stale {
            report.stale = StalenessReaper::new(self.config, self.today).reap(&mut changes)?;
        }

        report.enter(RunStage::Commit);
        match changes.commit()? {
            CommitOutcome::Committed(entries) => report.record(entries),
            CommitOutcome::NoChanges => report.outcome = RunOutcome::NoChanges,
        }
        Ok(())
    }
}
