//! Canonical names for sites and storage elements.
//!
//! Names are derived once and then kept: anything already present in the
//! CS snapshot wins over a freshly derived name, so re-running never renames
//! a resource. New SE names take the next free number for their site and
//! latency across both the snapshot and the names handed out this run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{host_matches_suffix, CountryMapping, SyncConfig};
use crate::errors::{SyncError, SyncResult};
use crate::models::{
    Latency, Protocol, ProtocolOutcome, ResourceKind, SeRecord, Site, SiteRecord,
    SkippedResource, StorageElement,
};
use crate::store::CsSnapshot;

// ---------------------------------------------------------------------------
// Country codes
// ---------------------------------------------------------------------------

/// Country code for a hostname: configured suffix exceptions first, then a
/// two-letter TLD. `None` when neither applies.
pub fn country_code(host: &str, mappings: &[CountryMapping]) -> Option<String> {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    if host.is_empty() {
        return None;
    }
    if let Some(mapping) = mappings
        .iter()
        .filter(|m| host_matches_suffix(&host, &m.suffix))
        .max_by_key(|m| m.suffix.len())
    {
        return Some(mapping.code.to_lowercase());
    }
    let (_, tld) = host.rsplit_once('.')?;
    (tld.len() == 2 && tld.chars().all(|c| c.is_ascii_alphabetic())).then(|| tld.to_string())
}

/// [`country_code`] with a fallback.
pub fn extract_country_code(host: &str, mappings: &[CountryMapping], default: &str) -> String {
    country_code(host, mappings).unwrap_or_else(|| default.to_string())
}

fn valid_identifier(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.chars().any(char::is_whitespace)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Hands out names for one run.
pub struct NamingResolver<'a> {
    config: &'a SyncConfig,
    snapshot: &'a CsSnapshot,
    /// Canonical site name -> `(root, site_id)` that claimed it this run.
    site_names: BTreeMap<String, (String, String)>,
    /// SE name -> `(host, latency)` that claimed it this run.
    se_names: BTreeMap<String, (String, Latency)>,
    /// `(root, ce host)` -> canonical site name.
    ce_owner: BTreeMap<(String, String), String>,
    /// Upstream site id -> SE names assigned this run.
    assigned_ses: BTreeMap<String, BTreeSet<String>>,
}

impl<'a> NamingResolver<'a> {
    pub fn new(config: &'a SyncConfig, snapshot: &'a CsSnapshot) -> Self {
        Self {
            config,
            snapshot,
            site_names: BTreeMap::new(),
            se_names: BTreeMap::new(),
            ce_owner: BTreeMap::new(),
            assigned_ses: BTreeMap::new(),
        }
    }

    /// `<root>.<site_id>.<cc>`, or the existing section for this site id.
    pub fn site_name(&mut self, record: &SiteRecord) -> SyncResult<String> {
        if !valid_identifier(&record.site_id) {
            return Err(SyncError::Naming(format!(
                "site identifier {:?} cannot form a section name",
                record.site_id
            )));
        }

        let name = match self.snapshot.existing_site(&record.root, &record.site_id) {
            Some(existing) => existing.to_string(),
            None => {
                let code = record
                    .compute_elements
                    .keys()
                    .find_map(|host| country_code(host, &self.config.country_mappings))
                    .unwrap_or_else(|| self.config.country_default.clone());
                format!("{}.{}.{}", record.root, record.site_id, code)
            }
        };

        let claimant = (record.root.clone(), record.site_id.clone());
        match self.site_names.get(&name) {
            Some(other) if *other != claimant => Err(SyncError::Naming(format!(
                "site name {name} already taken by {} in this run, cannot assign it to {}",
                other.1, record.site_id
            ))),
            Some(_) => Ok(name),
            None => {
                self.site_names.insert(name.clone(), claimant);
                Ok(name)
            }
        }
    }

    /// Name a site and drop the CEs another site already claimed this run.
    pub fn resolve_site(
        &mut self,
        mut record: SiteRecord,
    ) -> SyncResult<(Site, Vec<SkippedResource>)> {
        let name = self.site_name(&record)?;
        let mut skipped = Vec::new();

        let hosts: Vec<String> = record.compute_elements.keys().cloned().collect();
        for host in hosts {
            let key = (record.root.clone(), host.clone());
            match self.ce_owner.get(&key) {
                Some(owner) if *owner != name => {
                    warn!(site = %name, ce = %host, "CE already claimed by {owner}, skipping");
                    record.compute_elements.remove(&host);
                    skipped.push(SkippedResource::new(
                        ResourceKind::ComputeElement,
                        host,
                        format!("naming conflict: claimed by both {owner} and {name}"),
                    ));
                }
                Some(_) => {}
                None => {
                    if let Some(listed) = self.snapshot.site_of_ce(&record.root, &host) {
                        if listed != name {
                            debug!(ce = %host, "CE moves from {listed} to {name}");
                        }
                    }
                    self.ce_owner.insert(key, name.clone());
                }
            }
        }

        Ok((
            Site {
                canonical_name: name,
                record,
            },
            skipped,
        ))
    }

    /// DIRAC name for an SE host at a latency.
    pub fn se_name(&mut self, site_id: &str, host: &str, latency: Latency) -> SyncResult<String> {
        if let Some(existing) = self.snapshot.se_name_for(host, latency) {
            let existing = existing.to_string();
            self.claim_se(site_id, &existing, host, latency)?;
            return Ok(existing);
        }
        if let Some((name, _)) = self
            .se_names
            .iter()
            .find(|(_, (h, l))| h == host && *l == latency)
        {
            return Ok(name.clone());
        }
        if !valid_identifier(site_id) {
            return Err(SyncError::Naming(format!(
                "site identifier {site_id:?} cannot form an SE name for {host}"
            )));
        }

        let pattern = Regex::new(&format!(
            r"^{}(\d*)-{}$",
            regex::escape(site_id),
            latency.suffix()
        ))
        .map_err(|e| SyncError::Naming(format!("bad SE name pattern for {site_id}: {e}")))?;

        let highest = self
            .snapshot
            .storage
            .keys()
            .chain(self.se_names.keys())
            .filter_map(|name| pattern.captures(name))
            .filter_map(|caps| match &caps[1] {
                "" => Some(0),
                digits => digits.parse::<u32>().ok(),
            })
            .max();
        let name = match highest {
            None => format!("{site_id}-{latency}"),
            Some(n) => {
                let next = n.checked_add(1).ok_or_else(|| {
                    SyncError::Naming(format!("no free SE index after {site_id}{n}-{latency}"))
                })?;
                format!("{site_id}{next}-{latency}")
            }
        };
        debug!(se = %name, "new SE name for {host} ({latency})");
        self.claim_se(site_id, &name, host, latency)?;
        Ok(name)
    }

    fn claim_se(
        &mut self,
        site_id: &str,
        name: &str,
        host: &str,
        latency: Latency,
    ) -> SyncResult<()> {
        if let Some((other_host, other_latency)) = self.se_names.get(name) {
            if other_host != host || *other_latency != latency {
                return Err(SyncError::Naming(format!(
                    "SE name {name} already assigned to {other_host} ({other_latency}), \
                     cannot reuse it for {host} ({latency})"
                )));
            }
        }
        self.se_names
            .insert(name.to_string(), (host.to_string(), latency));
        self.assigned_ses
            .entry(site_id.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    /// Name an SE and build its access protocols. Protocol indices already
    /// in the CS are kept; a new protocol takes the slot after the other one.
    pub fn storage_element(
        &mut self,
        record: SeRecord,
        today: NaiveDate,
    ) -> SyncResult<(StorageElement, Vec<SkippedResource>)> {
        let name = self.se_name(&record.site_id, &record.host, record.latency)?;
        let existing_srm = self.snapshot.protocol_index(&name, Protocol::Srm);
        let existing_root = self.snapshot.protocol_index(&name, Protocol::Root);

        let mut access_protocols = Vec::new();
        let mut skipped = Vec::new();

        let srm_index = existing_srm.unwrap_or_else(|| existing_root.map_or(1, |i| i + 1));
        let mut written_srm = existing_srm;
        match record.access_protocol(Protocol::Srm, srm_index) {
            ProtocolOutcome::Included(ap) => {
                written_srm = Some(ap.index);
                access_protocols.push(ap);
            }
            ProtocolOutcome::Skipped(reason) => {
                debug!(se = %name, "{reason}");
                skipped.push(SkippedResource::new(
                    ResourceKind::AccessProtocol,
                    format!("{name}/srm"),
                    reason,
                ));
            }
        }

        let root_index = existing_root.unwrap_or_else(|| written_srm.map_or(1, |i| i + 1));
        match record.access_protocol(Protocol::Root, root_index) {
            ProtocolOutcome::Included(ap) => access_protocols.push(ap),
            ProtocolOutcome::Skipped(reason) => {
                debug!(se = %name, "{reason}");
                skipped.push(SkippedResource::new(
                    ResourceKind::AccessProtocol,
                    format!("{name}/root"),
                    reason,
                ));
            }
        }

        Ok((
            StorageElement {
                name,
                record,
                access_protocols,
                last_seen: today,
            },
            skipped,
        ))
    }

    /// SE names handed out (or confirmed) this run for an upstream site id.
    pub fn assigned_ses_for(&self, site_id: &str) -> BTreeSet<String> {
        self.assigned_ses.get(site_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComputeElement, CeType, SrmEndpoint};
    use crate::store::MemoryConfigStore;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig {
            vos: vec!["lhcb".into()],
            ..SyncConfig::default()
        }
    }

    fn snapshot(options: &[(&str, &str)]) -> CsSnapshot {
        let store = MemoryConfigStore::with_options(options.iter().copied());
        CsSnapshot::capture(&store, &config()).unwrap()
    }

    fn site(id: &str, hosts: &[&str]) -> SiteRecord {
        let mut record = SiteRecord::new(id, "LCG", "glue1:lhcb");
        for host in hosts {
            record.add_ce(ComputeElement::new(*host, CeType::Arc, today()));
        }
        record
    }

    #[test]
    fn test_country_code_derivation() {
        let mappings = config().country_mappings;
        assert_eq!(extract_country_code("foo.bar.gov", &mappings, "xx"), "us");
        assert_eq!(extract_country_code("foo.bar.ac.uk", &mappings, "xx"), "uk");
        assert_eq!(extract_country_code("foo.bar.xyz", &mappings, "xx"), "xx");
        assert_eq!(extract_country_code("CE.EXAMPLE.DE", &mappings, "xx"), "de");
        assert_eq!(extract_country_code("jet.efda.org", &mappings, "xx"), "uk");
        assert_eq!(extract_country_code("notefda.org", &mappings, "xx"), "xx");
        assert_eq!(extract_country_code("", &mappings, "zz"), "zz");
    }

    #[test]
    fn test_first_determinable_host_sets_site_country() {
        let config = config();
        let snap = CsSnapshot::default();
        let mut resolver = NamingResolver::new(&config, &snap);
        let record = site("UKI-X", &["a.example.com", "b.example.ac.uk", "c.example.de"]);
        assert_eq!(resolver.site_name(&record).unwrap(), "LCG.UKI-X.uk");

        let bare = site("NOWHERE", &[]);
        assert_eq!(resolver.site_name(&bare).unwrap(), "LCG.NOWHERE.xx");
    }

    #[test]
    fn test_existing_site_name_is_kept() {
        let config = config();
        let snap = snapshot(&[("/Resources/Sites/LCG/LCG.UKI-X.gb/Name", "UKI-X")]);
        let mut resolver = NamingResolver::new(&config, &snap);
        let record = site("UKI-X", &["ce.x.ac.uk"]);
        assert_eq!(resolver.site_name(&record).unwrap(), "LCG.UKI-X.gb");
    }

    #[test]
    fn test_invalid_site_id_is_a_naming_error() {
        let config = config();
        let snap = CsSnapshot::default();
        let mut resolver = NamingResolver::new(&config, &snap);
        let err = resolver.site_name(&site("bad id", &[])).unwrap_err();
        assert!(matches!(err, SyncError::Naming(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_ce_claimed_twice_is_skipped() {
        let config = config();
        let snap = CsSnapshot::default();
        let mut resolver = NamingResolver::new(&config, &snap);
        let (_, skipped) = resolver.resolve_site(site("UKI-A", &["ce.shared.ac.uk"])).unwrap();
        assert!(skipped.is_empty());
        let (b, skipped) = resolver
            .resolve_site(site("UKI-B", &["ce.shared.ac.uk", "ce.b.ac.uk"]))
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].id, "ce.shared.ac.uk");
        assert_eq!(b.record.compute_elements.len(), 1);
    }

    #[test]
    fn test_se_numbering_follows_existing_names() {
        let config = config();
        let snap = snapshot(&[
            ("/Resources/StorageElements/UKI-X-disk/Host", "old.x.ac.uk"),
            ("/Resources/StorageElements/UKI-X2-disk/Host", "older.x.ac.uk"),
        ]);
        let mut resolver = NamingResolver::new(&config, &snap);
        assert_eq!(
            resolver.se_name("UKI-X", "old.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X-disk"
        );
        assert_eq!(
            resolver.se_name("UKI-X", "new.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X3-disk"
        );
        assert_eq!(
            resolver.se_name("UKI-X", "newer.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X4-disk"
        );
        assert_eq!(
            resolver.se_name("UKI-X", "new.x.ac.uk", Latency::Tape).unwrap(),
            "UKI-X-tape"
        );
        // Asking again returns the name already handed out.
        assert_eq!(
            resolver.se_name("UKI-X", "new.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X3-disk"
        );
        assert_eq!(
            resolver.assigned_ses_for("UKI-X"),
            BTreeSet::from([
                "UKI-X-disk".to_string(),
                "UKI-X3-disk".to_string(),
                "UKI-X4-disk".to_string(),
                "UKI-X-tape".to_string(),
            ])
        );
    }

    #[test]
    fn test_se_numbering_ignores_oversized_indices() {
        let config = config();
        let snap = snapshot(&[
            ("/Resources/StorageElements/UKI-X2-disk/Host", "old.x.ac.uk"),
            ("/Resources/StorageElements/UKI-X99999999999-disk/Host", "odd.x.ac.uk"),
        ]);
        let mut resolver = NamingResolver::new(&config, &snap);
        assert_eq!(
            resolver.se_name("UKI-X", "new.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X3-disk"
        );
    }

    #[test]
    fn test_se_numbering_exhausted_is_a_naming_error() {
        let config = config();
        let snap = snapshot(&[(
            "/Resources/StorageElements/UKI-X4294967295-disk/Host",
            "old.x.ac.uk",
        )]);
        let mut resolver = NamingResolver::new(&config, &snap);
        let err = resolver
            .se_name("UKI-X", "new.x.ac.uk", Latency::Disk)
            .unwrap_err();
        assert!(matches!(err, SyncError::Naming(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_similar_site_ids_do_not_share_numbering() {
        let config = config();
        let snap = snapshot(&[("/Resources/StorageElements/UKI-XY-disk/Host", "se.xy.ac.uk")]);
        let mut resolver = NamingResolver::new(&config, &snap);
        assert_eq!(
            resolver.se_name("UKI-X", "se.x.ac.uk", Latency::Disk).unwrap(),
            "UKI-X-disk"
        );
    }

    fn se_record() -> SeRecord {
        let mut record = SeRecord::new("UKI-X", "se.x.ac.uk", Latency::Disk);
        record
            .vo_paths
            .insert("lhcb".into(), BTreeSet::from(["/dpm/x.ac.uk/home/lhcb".to_string()]));
        record.srm = Some(SrmEndpoint {
            port: Some(8446),
            version: "2.2.0".into(),
        });
        record.xrootd_ports.insert(1094);
        record
    }

    #[test]
    fn test_protocol_indices_for_new_se() {
        let config = config();
        let snap = CsSnapshot::default();
        let mut resolver = NamingResolver::new(&config, &snap);
        let (se, skipped) = resolver.storage_element(se_record(), today()).unwrap();
        assert!(skipped.is_empty());
        let indices: Vec<(Protocol, u32)> =
            se.access_protocols.iter().map(|ap| (ap.protocol, ap.index)).collect();
        assert_eq!(indices, vec![(Protocol::Srm, 1), (Protocol::Root, 2)]);
    }

    #[test]
    fn test_protocol_indices_keep_existing_slots() {
        let config = config();
        let snap = snapshot(&[
            ("/Resources/StorageElements/UKI-X-disk/Host", "se.x.ac.uk"),
            ("/Resources/StorageElements/UKI-X-disk/AccessProtocol.1/Protocol", "root"),
        ]);
        let mut resolver = NamingResolver::new(&config, &snap);
        let (se, _) = resolver.storage_element(se_record(), today()).unwrap();
        assert_eq!(se.name, "UKI-X-disk");
        let indices: Vec<(Protocol, u32)> =
            se.access_protocols.iter().map(|ap| (ap.protocol, ap.index)).collect();
        assert_eq!(indices, vec![(Protocol::Srm, 2), (Protocol::Root, 1)]);
    }

    #[test]
    fn test_skipped_srm_leaves_first_slot_to_xroot() {
        let config = config();
        let snap = CsSnapshot::default();
        let mut resolver = NamingResolver::new(&config, &snap);
        let mut record = se_record();
        record.srm = None;
        let (se, skipped) = resolver.storage_element(record, today()).unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kind, ResourceKind::AccessProtocol);
        assert_eq!(se.access_protocols.len(), 1);
        assert_eq!(se.access_protocols[0].index, 1);
    }
}
