//! One-time read of the CS state a run needs for naming and staleness.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{split_list, SyncConfig};
use crate::errors::SyncResult;
use crate::models::{Latency, Protocol, CLOUD_ROOT, VAC_ROOT};
use crate::store::{cfg_path, ConfigStore, HOSTS_ROOT, SITES_ROOT, STORAGE_ROOT};

/// A site section as it exists in the CS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotSite {
    /// Members of the site's `CE` option.
    pub ce_list: BTreeSet<String>,
    /// Members of the site's `SE` option.
    pub se_list: BTreeSet<String>,
    /// Sub-sections of `CEs`.
    pub ce_sections: BTreeSet<String>,
}

/// An SE section as it exists in the CS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotSe {
    pub host: String,
    pub latency: Option<Latency>,
    /// Protocol -> `AccessProtocol.N` index already in use.
    pub protocol_indices: BTreeMap<Protocol, u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsSnapshot {
    /// Root (`LCG`, `VAC`, ...) -> site name -> site.
    pub sites: BTreeMap<String, BTreeMap<String, SnapshotSite>>,
    /// SE name -> SE. Sections without a `Host` option are not SEs.
    pub storage: BTreeMap<String, SnapshotSe>,
    pub hosts: BTreeSet<String>,
}

impl CsSnapshot {
    /// Read the sections this run may touch. Any store error is returned to
    /// the caller, which treats it as fatal.
    pub fn capture(store: &dyn ConfigStore, config: &SyncConfig) -> SyncResult<Self> {
        let mut snapshot = CsSnapshot::default();

        for root in site_roots(config) {
            let root_path = cfg_path(&[SITES_ROOT, &root]);
            let mut sites = BTreeMap::new();
            for site in store.get_sections(&root_path)? {
                let site_path = cfg_path(&[&root_path, &site]);
                let entry = SnapshotSite {
                    ce_list: read_list(store, &cfg_path(&[&site_path, "CE"]))?,
                    se_list: read_list(store, &cfg_path(&[&site_path, "SE"]))?,
                    ce_sections: store
                        .get_sections(&cfg_path(&[&site_path, "CEs"]))?
                        .into_iter()
                        .collect(),
                };
                sites.insert(site, entry);
            }
            snapshot.sites.insert(root, sites);
        }

        for name in store.get_sections(STORAGE_ROOT)? {
            let se_path = cfg_path(&[STORAGE_ROOT, &name]);
            let Some(host) = store.get_value(&cfg_path(&[&se_path, "Host"]))? else {
                continue;
            };
            let mut protocol_indices = BTreeMap::new();
            for section in store.get_sections(&se_path)? {
                let Some(index) = section
                    .strip_prefix("AccessProtocol.")
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let raw = store.get_value(&cfg_path(&[&se_path, &section, "Protocol"]))?;
                if let Some(protocol) = raw.as_deref().and_then(Protocol::parse) {
                    protocol_indices.entry(protocol).or_insert(index);
                }
            }
            snapshot.storage.insert(
                name.clone(),
                SnapshotSe {
                    host: host.trim().to_string(),
                    latency: Latency::from_name(&name),
                    protocol_indices,
                },
            );
        }

        snapshot.hosts = store.get_sections(HOSTS_ROOT)?.into_iter().collect();

        debug!(
            "captured CS snapshot: {} site roots, {} SEs, {} hosts",
            snapshot.sites.len(),
            snapshot.storage.len(),
            snapshot.hosts.len()
        );
        Ok(snapshot)
    }

    /// Existing site section for an upstream identifier under `root`.
    /// Site names look like `<root>.<site_id>.<cc>`.
    pub fn existing_site(&self, root: &str, site_id: &str) -> Option<&str> {
        let prefix = format!("{root}.");
        let mut matches = self.sites.get(root)?.keys().filter(|name| {
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.rsplit_once('.'))
                .is_some_and(|(id, _)| id == site_id)
        });
        let first = matches.next()?;
        if let Some(other) = matches.next() {
            warn!("site id {site_id} maps to several sections ({first}, {other}); using {first}");
        }
        Some(first.as_str())
    }

    /// Site section currently listing `host` as a CE.
    pub fn site_of_ce(&self, root: &str, host: &str) -> Option<&str> {
        self.sites.get(root)?.iter().find_map(|(name, site)| {
            (site.ce_sections.contains(host) || site.ce_list.contains(host))
                .then_some(name.as_str())
        })
    }

    /// Existing DIRAC name for an SE host at a given latency. When several
    /// sections claim the same pair, the first in name order wins.
    pub fn se_name_for(&self, host: &str, latency: Latency) -> Option<&str> {
        self.storage
            .iter()
            .find(|(_, se)| se.host == host && se.latency == Some(latency))
            .map(|(name, _)| name.as_str())
    }

    pub fn protocol_index(&self, se_name: &str, protocol: Protocol) -> Option<u32> {
        self.storage
            .get(se_name)?
            .protocol_indices
            .get(&protocol)
            .copied()
    }

    /// SE names following the `<site_id>[n]-<latency>` convention.
    pub fn ses_for_site(&self, site_id: &str) -> Vec<&str> {
        let Ok(pattern) = Regex::new(&format!(r"^{}\d*-(?:disk|tape)$", regex::escape(site_id)))
        else {
            return Vec::new();
        };
        self.storage
            .keys()
            .filter(|name| pattern.is_match(name))
            .map(String::as_str)
            .collect()
    }
}

/// Roots under `/Resources/Sites` this engine manages.
pub fn site_roots(config: &SyncConfig) -> Vec<String> {
    let mut roots = vec![config.domain.clone()];
    for extra in [VAC_ROOT, CLOUD_ROOT] {
        if !roots.iter().any(|r| r == extra) {
            roots.push(extra.to_string());
        }
    }
    roots
}

fn read_list(store: &dyn ConfigStore, path: &str) -> SyncResult<BTreeSet<String>> {
    Ok(store
        .get_value(path)?
        .map(|v| split_list(&v).collect())
        .unwrap_or_default())
}
