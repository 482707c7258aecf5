//! Merge partial views of the same resource before naming.
//!
//! A CE answering several VO-scoped queries arrives once per VO; an SE
//! host may be reported by several storage areas. Folding these together
//! first means the written VO and queue lists do not depend on which query
//! ran last.

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::{Latency, SeRecord, SiteRecord, UNKNOWN};

/// One record per `(root, site_id)`, merged in source-label order. Lists
/// are unioned; each scalar keeps the first non-empty value.
pub fn aggregate_sites(records: Vec<SiteRecord>) -> Vec<SiteRecord> {
    let mut groups: BTreeMap<(String, String), Vec<SiteRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.root.clone(), record.site_id.clone()))
            .or_default()
            .push(record);
    }

    groups
        .into_values()
        .filter_map(|mut parts| {
            parts.sort_by(|a, b| a.source.cmp(&b.source));
            let count = parts.len();
            let mut parts = parts.into_iter();
            let mut merged = parts.next()?;
            for part in parts {
                merge_site(&mut merged, part);
            }
            if count > 1 {
                debug!(site = %merged.site_id, "merged {count} views of site");
            }
            Some(merged)
        })
        .collect()
}

fn merge_site(target: &mut SiteRecord, other: SiteRecord) {
    fill(&mut target.display_name, other.display_name);
    fill(&mut target.description, other.description);
    fill(&mut target.coordinates, other.coordinates);
    fill(&mut target.contact_mail, other.contact_mail);
    for ce in other.compute_elements.into_values() {
        target.add_ce(ce);
    }
    target.storage_elements.extend(other.storage_elements);
}

/// One record per `(host, latency)`. VOs, paths and ports are unioned; the
/// first SRM endpoint and the first known size and backend are kept.
pub fn aggregate_storage(records: Vec<SeRecord>) -> Vec<SeRecord> {
    let mut merged: BTreeMap<(String, Latency), SeRecord> = BTreeMap::new();
    for record in records {
        let key = (record.host.clone(), record.latency);
        match merged.get_mut(&key) {
            None => {
                merged.insert(key, record);
            }
            Some(existing) => merge_se(existing, record),
        }
    }
    merged.into_values().collect()
}

fn merge_se(target: &mut SeRecord, other: SeRecord) {
    if target.site_id.is_empty() {
        target.site_id = other.site_id;
    }
    fill_known(&mut target.backend_type, other.backend_type);
    fill_known(&mut target.total_size, other.total_size);
    fill(&mut target.description, other.description);
    target.allowed_vos.extend(other.allowed_vos);
    for (vo, paths) in other.vo_paths {
        target.vo_paths.entry(vo).or_default().extend(paths);
    }
    if target.srm.is_none() {
        target.srm = other.srm;
    }
    target.xrootd_ports.extend(other.xrootd_ports);
}

fn fill(target: &mut String, candidate: String) {
    if target.is_empty() && !candidate.is_empty() {
        *target = candidate;
    }
}

fn fill_known(target: &mut String, candidate: String) {
    if (target.is_empty() || target == UNKNOWN) && !candidate.is_empty() && candidate != UNKNOWN {
        *target = candidate;
    }
}
