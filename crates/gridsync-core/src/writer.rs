//! Serialization of named resources into CS options.
//!
//! Nothing here touches the store directly: every value goes through the
//! run's [`ChangeSet`], which drops writes that would not change anything.
//! Empty scalars are never written, so an upstream that stops publishing a
//! field leaves the last known value in place.

use std::collections::BTreeSet;

use tracing::debug;

use crate::changeset::{ChangeSet, CsValue};
use crate::errors::SyncResult;
use crate::models::{
    format_last_seen, AccessProtocol, ComputeElement, Queue, RegistryHost, Site, StorageElement,
};
use crate::store::{cfg_path, HOSTS_ROOT, SITES_ROOT, STORAGE_ROOT};

/// Access mode written for every generated access protocol.
pub const REMOTE_ACCESS: &str = "remote";

pub fn site_path(root: &str, canonical_name: &str) -> String {
    cfg_path(&[SITES_ROOT, root, canonical_name])
}

pub fn ce_path(site_path: &str, host: &str) -> String {
    cfg_path(&[site_path, "CEs", host])
}

pub fn se_path(name: &str) -> String {
    cfg_path(&[STORAGE_ROOT, name])
}

pub fn host_path(cn: &str) -> String {
    cfg_path(&[HOSTS_ROOT, cn])
}

/// Write a scalar unless it is empty.
fn put(changes: &mut ChangeSet<'_>, section: &str, option: &str, value: &str) -> SyncResult<()> {
    let value = value.trim();
    if !value.is_empty() {
        changes.add(section, option, value)?;
    }
    Ok(())
}

fn put_some<T: Into<CsValue>>(
    changes: &mut ChangeSet<'_>,
    section: &str,
    option: &str,
    value: Option<T>,
) -> SyncResult<()> {
    if let Some(value) = value {
        changes.add(section, option, value)?;
    }
    Ok(())
}

fn put_set(
    changes: &mut ChangeSet<'_>,
    section: &str,
    option: &str,
    values: &BTreeSet<String>,
) -> SyncResult<()> {
    if !values.is_empty() {
        changes.add(section, option, values)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sites, CEs and queues
// ---------------------------------------------------------------------------

/// Write a site with its CEs. `ses` is every SE name the site should list;
/// existing list members are kept.
pub fn write_site(
    changes: &mut ChangeSet<'_>,
    site: &Site,
    ses: &BTreeSet<String>,
) -> SyncResult<()> {
    let record = &site.record;
    let path = site_path(&record.root, &site.canonical_name);

    let name = if record.display_name.is_empty() {
        &record.site_id
    } else {
        &record.display_name
    };
    put(changes, &path, "Name", name)?;
    put(changes, &path, "Description", &record.description)?;
    put(changes, &path, "Coordinates", &record.coordinates)?;
    put(changes, &path, "Mail", &record.contact_mail)?;

    for ce in record.compute_elements.values() {
        changes.append_unique(&path, "CE", &ce.host);
        write_ce(changes, &path, ce)?;
    }
    for se in ses {
        changes.append_unique(&path, "SE", se);
    }
    debug!(
        site = %site.canonical_name,
        "staged {} CEs and {} SE references",
        record.compute_elements.len(),
        ses.len()
    );
    Ok(())
}

pub fn write_ce(
    changes: &mut ChangeSet<'_>,
    site_path: &str,
    ce: &ComputeElement,
) -> SyncResult<()> {
    let path = ce_path(site_path, &ce.host);
    put(changes, &path, "CEType", ce.ce_type.as_str())?;
    put(changes, &path, "architecture", &ce.architecture)?;
    put(changes, &path, "OS", &ce.os)?;
    put(changes, &path, "SI00", &ce.si00)?;
    put(changes, &path, "HostRAM", &ce.host_ram)?;
    put_some(changes, &path, "MaxProcessors", ce.max_processors)?;
    put_some(changes, &path, "SubmissionMode", ce.submission_mode.as_ref())?;
    put_some(changes, &path, "JobListFile", ce.job_list_file.as_ref())?;
    changes.add(&path, "LastSeen", format_last_seen(ce.last_seen))?;
    for (option, value) in &ce.extra_options {
        put(changes, &path, option, value)?;
    }

    for queue in ce.queues.values() {
        write_queue(changes, &path, queue)?;
    }
    Ok(())
}

pub fn write_queue(changes: &mut ChangeSet<'_>, ce_path: &str, queue: &Queue) -> SyncResult<()> {
    let path = cfg_path(&[ce_path, "Queues", &queue.name]);
    put_set(changes, &path, "VO", &queue.allowed_vos)?;
    put(changes, &path, "SI00", &queue.si00)?;
    changes.add(&path, "maxCPUTime", queue.max_cpu_time)?;
    put_some(changes, &path, "MaxTotalJobs", queue.max_total_jobs)?;
    put_some(changes, &path, "MaxWaitingJobs", queue.max_waiting_jobs)?;
    put_some(changes, &path, "NumberOfProcessors", queue.number_of_processors)?;
    put_set(changes, &path, "Tag", &queue.tags)?;
    put_set(changes, &path, "RequiredTag", &queue.required_tags)?;
    put_some(changes, &path, "LocalCEType", queue.local_ce_type.as_ref())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub fn write_se(changes: &mut ChangeSet<'_>, se: &StorageElement) -> SyncResult<()> {
    let path = se_path(&se.name);
    let record = &se.record;
    put(changes, &path, "Host", &record.host)?;
    put(changes, &path, "BackendType", &record.backend_type)?;
    put(changes, &path, "Description", &record.description)?;
    put(changes, &path, "TotalSize", &record.total_size)?;
    put_set(changes, &path, "VO", &record.allowed_vos)?;
    changes.add(&path, "LastSeen", format_last_seen(se.last_seen))?;
    for protocol in &se.access_protocols {
        write_access_protocol(changes, &path, protocol)?;
    }
    Ok(())
}

pub fn write_access_protocol(
    changes: &mut ChangeSet<'_>,
    se_path: &str,
    ap: &AccessProtocol,
) -> SyncResult<()> {
    let path = cfg_path(&[se_path, &format!("AccessProtocol.{}", ap.index)]);
    changes.add(&path, "Access", REMOTE_ACCESS)?;
    put(changes, &path, "Host", &ap.host)?;
    put(changes, &path, "Path", &ap.path)?;
    changes.add(&path, "PluginName", ap.protocol.plugin_name())?;
    changes.add(&path, "Port", ap.port)?;
    changes.add(&path, "Protocol", ap.protocol.as_str())?;
    put(changes, &path, "SpaceToken", &ap.space_token)?;
    put(changes, &path, "WSUrl", &ap.ws_url)?;
    let vo_path = cfg_path(&[&path, "VOPath"]);
    for (vo, dir) in &ap.vo_path {
        put(changes, &vo_path, vo, dir)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry hosts
// ---------------------------------------------------------------------------

pub fn write_host(changes: &mut ChangeSet<'_>, host: &RegistryHost) -> SyncResult<()> {
    let path = host_path(&host.cn);
    put(changes, &path, "DN", &host.dn)?;
    changes.add(&path, "LastSeen", format_last_seen(host.last_seen))?;
    put_set(changes, &path, "Properties", &host.properties)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use crate::changeset::CommitOutcome;
    use crate::models::{CeType, Latency, Protocol, SeRecord, SiteRecord};
    use crate::store::{ConfigStore, MemoryConfigStore};

    const SITE: &str = "/Resources/Sites/LCG/LCG.UKI-X.uk";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn site() -> Site {
        let mut record = SiteRecord::new("UKI-X", "LCG", "glue1:lhcb");
        record.display_name = "UKI-X".into();
        record.description = "X University".into();
        let mut ce = ComputeElement::new("ce.x.ac.uk", CeType::Arc, today());
        ce.os = "EL9".into();
        ce.max_processors = Some(8);
        let mut queue = Queue::new("grid", 2880);
        queue.allowed_vos = BTreeSet::from(["lhcb".to_string(), "atlas".to_string()]);
        queue.max_total_jobs = Some(30);
        queue.max_waiting_jobs = Some(10);
        ce.add_queue(queue);
        record.add_ce(ce);
        Site {
            canonical_name: "LCG.UKI-X.uk".into(),
            record,
        }
    }

    fn value(store: &MemoryConfigStore, path: &str) -> Option<String> {
        store.get_value(path).unwrap()
    }

    #[test]
    fn test_site_ce_and_queue_options() {
        let mut store = MemoryConfigStore::new();
        let mut changes = ChangeSet::new(&mut store);
        let ses = BTreeSet::from(["UKI-X-disk".to_string()]);
        write_site(&mut changes, &site(), &ses).unwrap();
        assert!(matches!(changes.commit().unwrap(), CommitOutcome::Committed(_)));

        assert_eq!(value(&store, &format!("{SITE}/Name")).as_deref(), Some("UKI-X"));
        assert_eq!(value(&store, &format!("{SITE}/CE")).as_deref(), Some("ce.x.ac.uk"));
        assert_eq!(value(&store, &format!("{SITE}/SE")).as_deref(), Some("UKI-X-disk"));
        assert_eq!(value(&store, &format!("{SITE}/Coordinates")), None);

        let ce = format!("{SITE}/CEs/ce.x.ac.uk");
        assert_eq!(value(&store, &format!("{ce}/CEType")).as_deref(), Some("ARC"));
        assert_eq!(value(&store, &format!("{ce}/SubmissionMode")).as_deref(), Some("Direct"));
        assert_eq!(value(&store, &format!("{ce}/MaxProcessors")).as_deref(), Some("8"));
        assert_eq!(value(&store, &format!("{ce}/LastSeen")).as_deref(), Some("18/10/2026"));
        assert_eq!(
            value(&store, &format!("{ce}/JobListFile")).as_deref(),
            Some("ce.x.ac.uk-jobs.xml")
        );

        let queue = format!("{ce}/Queues/grid");
        assert_eq!(value(&store, &format!("{queue}/VO")).as_deref(), Some("atlas, lhcb"));
        assert_eq!(value(&store, &format!("{queue}/maxCPUTime")).as_deref(), Some("2880"));
        assert_eq!(value(&store, &format!("{queue}/MaxTotalJobs")).as_deref(), Some("30"));
        assert_eq!(value(&store, &format!("{queue}/Tag")), None);
    }

    #[test]
    fn test_rewrite_is_a_noop() {
        let mut store = MemoryConfigStore::new();
        let ses = BTreeSet::new();
        let mut changes = ChangeSet::new(&mut store);
        write_site(&mut changes, &site(), &ses).unwrap();
        changes.commit().unwrap();

        let mut changes = ChangeSet::new(&mut store);
        write_site(&mut changes, &site(), &ses).unwrap();
        assert_eq!(changes.commit().unwrap(), CommitOutcome::NoChanges);
    }

    #[test]
    fn test_empty_field_keeps_existing_value() {
        let mut store = MemoryConfigStore::with_options([(format!("{SITE}/Mail"), "ops@x.ac.uk")]);
        let mut changes = ChangeSet::new(&mut store);
        write_site(&mut changes, &site(), &BTreeSet::new()).unwrap();
        changes.commit().unwrap();
        assert_eq!(value(&store, &format!("{SITE}/Mail")).as_deref(), Some("ops@x.ac.uk"));
    }

    #[test]
    fn test_existing_list_members_are_kept() {
        let mut store = MemoryConfigStore::with_options([(format!("{SITE}/CE"), "old.x.ac.uk")]);
        let mut changes = ChangeSet::new(&mut store);
        write_site(&mut changes, &site(), &BTreeSet::new()).unwrap();
        changes.commit().unwrap();
        assert_eq!(
            value(&store, &format!("{SITE}/CE")).as_deref(),
            Some("ce.x.ac.uk, old.x.ac.uk")
        );
    }

    #[test]
    fn test_storage_element_and_protocols() {
        let mut record = SeRecord::new("UKI-X", "se.x.ac.uk", Latency::Disk);
        record.backend_type = "DPM".into();
        record.allowed_vos.insert("lhcb".into());
        let se = StorageElement {
            name: "UKI-X-disk".into(),
            record,
            access_protocols: vec![AccessProtocol {
                index: 1,
                protocol: Protocol::Srm,
                host: "se.x.ac.uk".into(),
                port: 8446,
                path: "/dpm/x.ac.uk/home".into(),
                vo_path: BTreeMap::from([(
                    "lhcb".to_string(),
                    "/dpm/x.ac.uk/home/lhcb".to_string(),
                )]),
                space_token: String::new(),
                ws_url: "/srm/managerv2?SFN=".into(),
            }],
            last_seen: today(),
        };
        let mut store = MemoryConfigStore::new();
        let mut changes = ChangeSet::new(&mut store);
        write_se(&mut changes, &se).unwrap();
        changes.commit().unwrap();

        let path = "/Resources/StorageElements/UKI-X-disk";
        assert_eq!(value(&store, &format!("{path}/Host")).as_deref(), Some("se.x.ac.uk"));
        assert_eq!(value(&store, &format!("{path}/TotalSize")).as_deref(), Some("Unknown"));
        let ap = format!("{path}/AccessProtocol.1");
        assert_eq!(value(&store, &format!("{ap}/Access")).as_deref(), Some("remote"));
        assert_eq!(value(&store, &format!("{ap}/PluginName")).as_deref(), Some("GFAL2_SRM2"));
        assert_eq!(value(&store, &format!("{ap}/Port")).as_deref(), Some("8446"));
        assert_eq!(value(&store, &format!("{ap}/SpaceToken")), None);
        assert_eq!(
            value(&store, &format!("{ap}/VOPath/lhcb")).as_deref(),
            Some("/dpm/x.ac.uk/home/lhcb")
        );
    }

    #[test]
    fn test_registry_host() {
        let host = RegistryHost {
            cn: "vac01.x.ac.uk".into(),
            dn: "/C=UK/CN=vac01.x.ac.uk".into(),
            properties: BTreeSet::from([
                "LimitedDelegation".to_string(),
                "GenericPilot".to_string(),
            ]),
            last_seen: today(),
        };
        let mut store = MemoryConfigStore::new();
        let mut changes = ChangeSet::new(&mut store);
        write_host(&mut changes, &host).unwrap();
        changes.commit().unwrap();
        assert_eq!(
            value(&store, "/Registry/Hosts/vac01.x.ac.uk/Properties").as_deref(),
            Some("GenericPilot, LimitedDelegation")
        );
    }
}
