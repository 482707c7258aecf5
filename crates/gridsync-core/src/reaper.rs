//! Removal of CEs, SEs and registry hosts that upstream stopped publishing.
//!
//! Runs after the writer on the same [`ChangeSet`], so anything refreshed
//! this run already carries today's `LastSeen` and survives. A resource
//! whose `LastSeen` is missing or unreadable is kept: it was probably
//! added by hand.

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::changeset::ChangeSet;
use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::models::{parse_last_seen, ResourceKind, CLOUD_ROOT, VAC_ROOT};
use crate::store::snapshot::site_roots;
use crate::store::{cfg_path, HOSTS_ROOT, SITES_ROOT, STORAGE_ROOT};

/// A resource removed from the CS this run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StaleResource {
    pub kind: ResourceKind,
    pub path: String,
    /// `None` when the resource was removed for being banned.
    pub last_seen: Option<NaiveDate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Keep,
    Stale(Option<NaiveDate>),
}

pub struct StalenessReaper<'a> {
    config: &'a SyncConfig,
    today: NaiveDate,
}

impl<'a> StalenessReaper<'a> {
    pub fn new(config: &'a SyncConfig, today: NaiveDate) -> Self {
        Self { config, today }
    }

    /// Oldest `LastSeen` that is still fresh.
    pub fn cutoff(&self) -> NaiveDate {
        self.today
            .checked_sub_days(Days::new(u64::from(self.config.retention_threshold_days)))
            .unwrap_or(NaiveDate::MIN)
    }

    fn verdict(
        &self,
        changes: &mut ChangeSet<'_>,
        section: &str,
        banned: bool,
    ) -> SyncResult<Verdict> {
        if banned {
            return Ok(Verdict::Stale(None));
        }
        let Some(raw) = changes.value(section, "LastSeen")? else {
            warn!("No LastSeen for {section}, keeping it");
            return Ok(Verdict::Keep);
        };
        let Some(last_seen) = parse_last_seen(&raw) else {
            warn!("Unreadable LastSeen {raw:?} for {section}, keeping it");
            return Ok(Verdict::Keep);
        };
        if last_seen < self.cutoff() {
            let days = (self.today - last_seen).num_days();
            warn!("{section} last seen {days} days ago, removing");
            return Ok(Verdict::Stale(Some(last_seen)));
        }
        Ok(Verdict::Keep)
    }

    /// Site roots whose CEs were refreshed by this run's enabled stages.
    fn ce_roots(&self) -> Vec<String> {
        site_roots(self.config)
            .into_iter()
            .filter(|root| {
                if root == VAC_ROOT || root == CLOUD_ROOT {
                    self.config.process_vac
                } else {
                    self.config.process_ces
                }
            })
            .collect()
    }

    /// Stage the removal of every stale resource and report what went. Only
    /// resource kinds refreshed by an enabled stage are considered.
    pub fn reap(&self, changes: &mut ChangeSet<'_>) -> SyncResult<Vec<StaleResource>> {
        let mut stale = self.reap_ces(changes)?;
        if self.config.process_ses {
            stale.extend(self.reap_ses(changes)?);
        }
        if self.config.process_vac {
            stale.extend(self.reap_hosts(changes)?);
        }
        if !stale.is_empty() {
            info!("{} stale resources staged for removal", stale.len());
        }
        Ok(stale)
    }

    fn reap_ces(&self, changes: &mut ChangeSet<'_>) -> SyncResult<Vec<StaleResource>> {
        let mut stale = Vec::new();
        for root in self.ce_roots() {
            let root_path = cfg_path(&[SITES_ROOT, &root]);
            for site in changes.sections(&root_path)? {
                let site_path = cfg_path(&[&root_path, &site]);
                for host in changes.sections(&cfg_path(&[&site_path, "CEs"]))? {
                    let ce_path = cfg_path(&[&site_path, "CEs", &host]);
                    let banned = self.config.is_banned_ce(&host);
                    if let Verdict::Stale(last_seen) = self.verdict(changes, &ce_path, banned)? {
                        changes.remove_section(&ce_path)?;
                        changes.remove_value(&site_path, "CE", &host)?;
                        stale.push(StaleResource {
                            kind: ResourceKind::ComputeElement,
                            path: ce_path,
                            last_seen,
                        });
                    }
                }
            }
        }
        Ok(stale)
    }

    fn reap_ses(&self, changes: &mut ChangeSet<'_>) -> SyncResult<Vec<StaleResource>> {
        let mut removed = Vec::new();
        for name in changes.sections(STORAGE_ROOT)? {
            let se_path = cfg_path(&[STORAGE_ROOT, &name]);
            // Sections without a Host are shared settings, not SEs.
            let Some(host) = changes.value(&se_path, "Host")? else {
                continue;
            };
            let banned = self.config.is_banned_se(&name) || self.config.is_banned_se(host.trim());
            if let Verdict::Stale(last_seen) = self.verdict(changes, &se_path, banned)? {
                changes.remove_section(&se_path)?;
                removed.push((
                    name,
                    StaleResource {
                        kind: ResourceKind::StorageElement,
                        path: se_path,
                        last_seen,
                    },
                ));
            }
        }
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        for root in site_roots(self.config) {
            let root_path = cfg_path(&[SITES_ROOT, &root]);
            for site in changes.sections(&root_path)? {
                let site_path = cfg_path(&[&root_path, &site]);
                for (name, _) in &removed {
                    changes.remove_value(&site_path, "SE", name)?;
                }
            }
        }
        Ok(removed.into_iter().map(|(_, stale)| stale).collect())
    }

    fn reap_hosts(&self, changes: &mut ChangeSet<'_>) -> SyncResult<Vec<StaleResource>> {
        let mut stale = Vec::new();
        for cn in changes.sections(HOSTS_ROOT)? {
            let host_path = cfg_path(&[HOSTS_ROOT, &cn]);
            if let Verdict::Stale(last_seen) = self.verdict(changes, &host_path, false)? {
                changes.remove_section(&host_path)?;
                stale.push(StaleResource {
                    kind: ResourceKind::Host,
                    path: host_path,
                    last_seen,
                });
            }
        }
        Ok(stale)
    }
}
