//! GLUE2 compute: ARC (`org.nordugrid.arex`) services and HTCondorCEs.
//!
//! Both are keyed by the `(GLUE2DomainID, GLUE2ServiceID)` pair found in
//! every DN below the service, and every follow-up query is restricted to
//! the pairs found by the first one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::models::{CeType, ComputeElement, Queue, ResourceKind, SiteRecord};
use crate::normalize::{parse_count, tidy_cpu_time, wanted_vo, Normalized};
use crate::source::filter::chunked_tuples;
use crate::source::{LdapRecord, LdapSearch};

/// Host part of a service id such as `urn:ogf:ComputingService:ce.x.ac.uk:arex`
/// or `ce.x.ac.uk_ComputingElement`.
static SERVICE_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:urn:ogf:ComputingService:)?([^,:_]+)(?:_(?:ES)?ComputingElement|:arex|:\d+)?")
        .unwrap()
});

static ENDPOINT_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:condor|https)://([^:]+):\d+/?$").unwrap());

static POLICY_VO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:vo:|VO:)?([^:]*)$").unwrap());

const ARC_SERVICE_FILTER: &str =
    "(&(objectClass=GLUE2ComputingService)(GLUE2ServiceType=org.nordugrid.arex))";
const CONDOR_MANAGER_FILTER: &str =
    "(&(objectClass=GLUE2ComputingManager)(GLUE2ManagerProductName=HTCondor))";

const PAIR_ATTRS: [&str; 2] = ["GLUE2DomainID:dn:", "GLUE2ServiceID:dn:"];
const SHARE_ATTRS: [&str; 3] = ["GLUE2DomainID:dn:", "GLUE2ServiceID:dn:", "GLUE2ShareID:dn:"];

/// Written for GLUE2 CEs, which rarely publish a usable benchmark.
const DEFAULT_SI00: &str = "3100";
const DEFAULT_HOST_RAM: &str = "4096";

type ServiceKey = (String, String);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Glue2ComputeRecords {
    pub arc_services: Vec<LdapRecord>,
    pub arc_managers: Vec<LdapRecord>,
    pub arc_shares: Vec<LdapRecord>,
    pub arc_policies: Vec<LdapRecord>,
    pub condor_managers: Vec<LdapRecord>,
    pub condor_endpoints: Vec<LdapRecord>,
    pub condor_policies: Vec<LdapRecord>,
    pub environments: Vec<LdapRecord>,
}

fn service_key(record: &LdapRecord) -> Option<ServiceKey> {
    let domain = record.dn_value("GLUE2DomainID").filter(|d| !d.is_empty())?;
    let service = record.dn_value("GLUE2ServiceID").filter(|s| !s.is_empty())?;
    Some((domain, service))
}

fn share_key(record: &LdapRecord) -> Option<(String, String, String)> {
    let (domain, service) = service_key(record)?;
    let share = record.dn_value("GLUE2ShareID").filter(|s| !s.is_empty())?;
    Some((domain, service, share))
}

fn pair_rows(records: &[LdapRecord]) -> Vec<Vec<String>> {
    records
        .iter()
        .filter_map(service_key)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(domain, service)| vec![domain, service])
        .collect()
}

/// Search `object_class` entries under the given rows, 300 rows per query.
fn search_rows(
    ldap: &dyn LdapSearch,
    base: &str,
    object_class: &str,
    attrs: &[&str],
    rows: &[Vec<String>],
    required: &str,
) -> SyncResult<Vec<LdapRecord>> {
    let mut out = Vec::new();
    for clause in chunked_tuples(attrs, rows) {
        let filter = format!("(&(objectClass={object_class}){clause}{required})");
        out.extend(ldap.search(base, &filter)?);
    }
    Ok(out)
}

pub fn fetch(ldap: &dyn LdapSearch, config: &SyncConfig) -> SyncResult<Glue2ComputeRecords> {
    let base = config.glue2_base.as_str();
    let mut records = Glue2ComputeRecords {
        arc_services: ldap.search(base, ARC_SERVICE_FILTER)?,
        condor_managers: ldap.search(base, CONDOR_MANAGER_FILTER)?,
        ..Glue2ComputeRecords::default()
    };

    let arc_pairs = pair_rows(&records.arc_services);
    records.arc_managers = search_rows(
        ldap,
        base,
        "GLUE2ComputingManager",
        &PAIR_ATTRS,
        &arc_pairs,
        "(GLUE2ManagerProductName=*)",
    )?;
    records.arc_shares = search_rows(
        ldap,
        base,
        "GLUE2ComputingShare",
        &PAIR_ATTRS,
        &arc_pairs,
        "(GLUE2ShareID=*)(GLUE2ComputingShareMappingQueue=*)",
    )?;
    let share_rows: Vec<Vec<String>> = records
        .arc_shares
        .iter()
        .filter_map(share_key)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(domain, service, share)| vec![domain, service, share])
        .collect();
    records.arc_policies = search_rows(
        ldap,
        base,
        "GLUE2MappingPolicy",
        &SHARE_ATTRS,
        &share_rows,
        "(GLUE2PolicyRule=*)",
    )?;

    let condor_pairs = pair_rows(&records.condor_managers);
    records.condor_endpoints = search_rows(
        ldap,
        base,
        "GLUE2ComputingEndpoint",
        &PAIR_ATTRS,
        &condor_pairs,
        "(GLUE2EndpointURL=*)",
    )?;
    records.condor_policies = search_rows(
        ldap,
        base,
        "GLUE2MappingPolicy",
        &PAIR_ATTRS,
        &condor_pairs,
        "(GLUE2PolicyRule=*)",
    )?;

    let all_pairs: Vec<Vec<String>> = arc_pairs
        .into_iter()
        .chain(condor_pairs)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    records.environments = search_rows(
        ldap,
        base,
        "GLUE2ExecutionEnvironment",
        &PAIR_ATTRS,
        &all_pairs,
        "(GLUE2ExecutionEnvironmentOSName=*)(GLUE2ExecutionEnvironmentPlatform=*)",
    )?;

    debug!(
        "GLUE2: {} ARC services, {} HTCondor managers, {} shares",
        records.arc_services.len(),
        records.condor_managers.len(),
        records.arc_shares.len()
    );
    Ok(records)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

pub fn service_host(service_id: &str) -> Option<String> {
    SERVICE_HOST_RE
        .captures(service_id.trim())
        .map(|caps| caps[1].trim().to_lowercase())
        .filter(|host| !host.is_empty())
}

fn endpoint_host(url: &str) -> Option<String> {
    ENDPOINT_HOST_RE
        .captures(url.trim())
        .map(|caps| caps[1].to_lowercase())
}

fn policy_vos(policy: &LdapRecord) -> BTreeSet<String> {
    policy
        .values("GLUE2PolicyRule")
        .iter()
        .filter_map(|rule| POLICY_VO_RE.captures(rule.trim()))
        .map(|caps| caps[1].trim().to_string())
        .filter(|vo| !vo.is_empty())
        .collect()
}

fn sorted(records: &[LdapRecord]) -> Vec<&LdapRecord> {
    let mut out: Vec<&LdapRecord> = records.iter().collect();
    out.sort_by(|a, b| a.dn.cmp(&b.dn));
    out
}

/// Total CPUs published by a computing manager.
fn manager_slots(manager: &LdapRecord) -> u64 {
    match parse_count(manager.text("GLUE2ComputingManagerTotalPhysicalCPUs")) {
        0 => parse_count(manager.text("GLUE2ComputingManagerTotalLogicalCPUs")),
        n => n,
    }
}

fn new_ce(host: &str, ce_type: CeType, config: &SyncConfig, today: NaiveDate) -> ComputeElement {
    let mut ce = ComputeElement::new(host, ce_type, today);
    ce.si00 = DEFAULT_SI00.to_string();
    ce.host_ram = DEFAULT_HOST_RAM.to_string();
    ce.os = config.default_os.clone();
    let cores = config.max_processors_override.unwrap_or(if config.multicore.enabled {
        config.multicore.processors
    } else {
        1
    });
    ce.max_processors = (cores > 1).then_some(cores);
    ce.extra_options = config.extra_options_for(host);
    ce
}

fn new_queue(name: String, max_cpu_time: u64, slots: u64, config: &SyncConfig) -> Queue {
    let mut queue = Queue::new(name, max_cpu_time);
    queue.si00 = DEFAULT_SI00.to_string();
    let (total, waiting) = config.job_limits.limits(slots);
    queue.max_total_jobs = Some(total);
    queue.max_waiting_jobs = Some(waiting);
    queue
}

/// CEs discovered per service, before VO filtering.
type Discovered = BTreeMap<ServiceKey, BTreeMap<String, ComputeElement>>;

fn arc_ces(
    records: &Glue2ComputeRecords,
    config: &SyncConfig,
    today: NaiveDate,
    out: &mut Normalized,
) -> Discovered {
    let mut ces: Discovered = BTreeMap::new();
    for service in sorted(&records.arc_services) {
        let Some(key) = service_key(service) else {
            out.skip(ResourceKind::ComputeElement, &service.dn, "DN carries no domain/service id");
            continue;
        };
        let Some(host) = service_host(&key.1) else {
            out.skip(ResourceKind::ComputeElement, &key.1, "service id names no host");
            continue;
        };
        if config.is_banned_ce(&host) {
            continue;
        }
        let ce = new_ce(&host, CeType::Arc, config, today);
        ces.entry(key).or_default().insert(host, ce);
    }

    let mut prefixes: BTreeMap<ServiceKey, String> = BTreeMap::new();
    let mut slots: BTreeMap<ServiceKey, u64> = BTreeMap::new();
    for manager in sorted(&records.arc_managers) {
        let Some(key) = service_key(manager) else { continue };
        let product = match manager.text("GLUE2ManagerProductName") {
            "" => "unknown",
            p => p,
        };
        prefixes
            .entry(key.clone())
            .or_insert_with(|| format!("nordugrid-{product}"));
        slots.entry(key).or_insert_with(|| manager_slots(manager));
    }

    // (domain, service, share) -> (ce host, queue name)
    let mut share_queues: BTreeMap<(String, String, String), (String, String)> = BTreeMap::new();
    for share in sorted(&records.arc_shares) {
        let Some((domain, service, share_id)) = share_key(share) else { continue };
        let key = (domain, service);
        let Some(host) = service_host(&key.1) else { continue };
        let Some(ce) = ces.get_mut(&key).and_then(|m| m.get_mut(&host)) else {
            continue;
        };
        let prefix = prefixes
            .get(&key)
            .map(String::as_str)
            .unwrap_or("nordugrid-unknown");
        let queue_name = format!("{prefix}-{}", share.text("GLUE2ComputingShareMappingQueue"));
        let published = match parse_count(share.text("GLUE2ComputingShareMaxCPUTime")) {
            0 => config.cpu_time.glue2_default,
            n => tidy_cpu_time(n),
        };
        let max_cpu_time = config.cpu_time.override_for(&host).unwrap_or(published);
        let queue = new_queue(
            queue_name.clone(),
            max_cpu_time,
            slots.get(&key).copied().unwrap_or(0),
            config,
        );
        ce.add_queue(queue);
        share_queues.insert((key.0, key.1, share_id), (host, queue_name));
    }

    for policy in sorted(&records.arc_policies) {
        let Some(share) = share_key(policy) else { continue };
        let Some((host, queue_name)) = share_queues.get(&share) else {
            continue;
        };
        let vos = policy_vos(policy);
        if let Some(queue) = ces
            .get_mut(&(share.0.clone(), share.1.clone()))
            .and_then(|m| m.get_mut(host))
            .and_then(|ce| ce.queues.get_mut(queue_name))
        {
            queue.allowed_vos.extend(vos);
        }
    }
    ces
}

fn condor_ces(
    records: &Glue2ComputeRecords,
    config: &SyncConfig,
    today: NaiveDate,
    out: &mut Normalized,
) -> Discovered {
    let mut slots: BTreeMap<ServiceKey, u64> = BTreeMap::new();
    for manager in sorted(&records.condor_managers) {
        match service_key(manager) {
            Some(key) => {
                slots.entry(key).or_insert_with(|| manager_slots(manager));
            }
            None => out.skip(
                ResourceKind::ComputeElement,
                &manager.dn,
                "DN carries no domain/service id",
            ),
        }
    }

    let mut ces: Discovered = BTreeMap::new();
    for endpoint in sorted(&records.condor_endpoints) {
        let Some(key) = service_key(endpoint) else { continue };
        let Some(&total) = slots.get(&key) else { continue };
        let url = endpoint.text("GLUE2EndpointURL");
        let Some(host) = endpoint_host(url) else {
            debug!("HTCondor endpoint URL {url:?} has no host");
            continue;
        };
        if config.is_banned_ce(&host) {
            continue;
        }
        let by_host = ces.entry(key).or_default();
        if by_host.contains_key(&host) {
            continue;
        }
        let mut ce = new_ce(&host, CeType::HtCondorCe, config, today);
        let max_cpu_time = config
            .cpu_time
            .override_for(&host)
            .unwrap_or(config.cpu_time.htcondor_default);
        ce.add_queue(new_queue(format!("{host}-condor"), max_cpu_time, total, config));
        by_host.insert(host, ce);
    }

    for policy in sorted(&records.condor_policies) {
        let Some(key) = service_key(policy) else { continue };
        let vos = policy_vos(policy);
        for ce in ces.get_mut(&key).into_iter().flat_map(|m| m.values_mut()) {
            for queue in ce.queues.values_mut() {
                queue.allowed_vos.extend(vos.iter().cloned());
            }
        }
    }
    ces
}

fn apply_environments(records: &Glue2ComputeRecords, ces: &mut Discovered) {
    for env in sorted(&records.environments) {
        let Some(key) = service_key(env) else { continue };
        let platform = env.text("GLUE2ExecutionEnvironmentPlatform").to_lowercase();
        let architecture = match platform.as_str() {
            "amd64" | "x86_64" | "" => "x86_64".to_string(),
            other => other.to_string(),
        };
        for ce in ces.get_mut(&key).into_iter().flat_map(|m| m.values_mut()) {
            if ce.architecture.is_empty() {
                ce.architecture = architecture.clone();
            }
        }
    }
}

/// Name of the multicore sibling of an ARC queue: `nordugrid-torque-grid`
/// becomes `nordugrid-multimtorque-grid`.
fn arc_multicore_name(queue: &str) -> String {
    match queue.split_once('-') {
        Some((head, tail)) => format!("{head}-multim{tail}"),
        None => format!("{queue}-multi"),
    }
}

fn add_multicore_queues(ce: &mut ComputeElement, config: &SyncConfig) {
    if !config.multicore.enabled {
        return;
    }
    let originals: Vec<Queue> = ce.queues.values().cloned().collect();
    for original in originals {
        let name = match ce.ce_type {
            CeType::Arc => arc_multicore_name(&original.name),
            _ => format!("{}-multi", original.name),
        };
        let gpu = original.name.to_lowercase().contains("gpu");
        let mut multi = original.clone();
        multi.name = name.clone();
        multi.number_of_processors = Some(config.multicore.processors);
        multi.tags.insert("MultiProcessor".to_string());
        multi.required_tags.insert("MultiProcessor".to_string());
        if gpu {
            multi.tags.insert("GPU".to_string());
            multi.required_tags.insert("GPU".to_string());
        }
        multi.local_ce_type = Some("Pool".to_string());

        if let Some(single) = ce.queues.get_mut(&original.name) {
            single.number_of_processors = Some(1);
            if gpu {
                single.tags.insert("GPU".to_string());
                single.required_tags.insert("GPU".to_string());
            }
        }
        ce.queues.insert(name, multi);
    }
}

fn emit(ces: Discovered, source: &str, config: &SyncConfig, out: &mut Normalized) {
    let mut sites: BTreeMap<String, SiteRecord> = BTreeMap::new();
    for ((domain, _), by_host) in ces {
        for (host, mut ce) in by_host {
            for queue in ce.queues.values_mut() {
                queue.allowed_vos.retain(|vo| wanted_vo(config, vo));
            }
            ce.queues.retain(|_, q| !q.allowed_vos.is_empty());
            if ce.queues.is_empty() {
                info!(ce = %host, "no queues support the configured VOs, not adding CE");
                continue;
            }
            add_multicore_queues(&mut ce, config);
            sites
                .entry(domain.clone())
                .or_insert_with(|| {
                    let mut site = SiteRecord::new(domain.clone(), config.domain.clone(), source);
                    site.display_name = domain.clone();
                    site
                })
                .add_ce(ce);
        }
    }
    out.sites.extend(sites.into_values());
}

pub fn normalize(
    records: &Glue2ComputeRecords,
    config: &SyncConfig,
    today: NaiveDate,
) -> Normalized {
    let mut out = Normalized::default();
    let mut arc = arc_ces(records, config, today, &mut out);
    let mut condor = condor_ces(records, config, today, &mut out);
    apply_environments(records, &mut arc);
    apply_environments(records, &mut condor);
    emit(arc, "glue2:arc", config, &mut out);
    emit(condor, "glue2:htcondor", config, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LdifDirectory;

    const LDIF: &str = "\
dn: GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingService
GLUE2ServiceID: urn:ogf:ComputingService:arc.x.ac.uk:arex
GLUE2ServiceType: org.nordugrid.arex

dn: GLUE2ManagerID=urn:ogf:ComputingManager:arc.x.ac.uk:torque,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingManager
GLUE2ManagerProductName: torque
GLUE2ComputingManagerTotalLogicalCPUs: 200

dn: GLUE2ShareID=urn:ogf:ComputingShare:arc.x.ac.uk:grid,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingShare
GLUE2ShareID: urn:ogf:ComputingShare:arc.x.ac.uk:grid
GLUE2ComputingShareMappingQueue: grid
GLUE2ComputingShareMaxCPUTime: 72

dn: GLUE2ShareID=urn:ogf:ComputingShare:arc.x.ac.uk:gpu,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingShare
GLUE2ShareID: urn:ogf:ComputingShare:arc.x.ac.uk:gpu
GLUE2ComputingShareMappingQueue: gpu

dn: GLUE2PolicyID=urn:ogf:AccessPolicy:arc.x.ac.uk:grid,GLUE2ShareID=urn:ogf:ComputingShare:arc.x.ac.uk:grid,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2MappingPolicy
GLUE2PolicyRule: vo:lhcb
GLUE2PolicyRule: vo:dteam

dn: GLUE2PolicyID=urn:ogf:AccessPolicy:arc.x.ac.uk:gpu,GLUE2ShareID=urn:ogf:ComputingShare:arc.x.ac.uk:gpu,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2MappingPolicy
GLUE2PolicyRule: VO:atlas

dn: GLUE2ResourceID=env,GLUE2ServiceID=urn:ogf:ComputingService:arc.x.ac.uk:arex,GLUE2GroupID=services,GLUE2DomainID=UKI-X,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ExecutionEnvironment
GLUE2ExecutionEnvironmentOSName: centos
GLUE2ExecutionEnvironmentOSVersion: 7
GLUE2ExecutionEnvironmentPlatform: amd64

dn: GLUE2ManagerID=condor.y.ac.uk_Manager,GLUE2ServiceID=condor.y.ac.uk_ComputingElement,GLUE2GroupID=resource,GLUE2DomainID=UKI-Y,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingManager
GLUE2ManagerProductName: HTCondor
GLUE2ComputingManagerTotalPhysicalCPUs: 50

dn: GLUE2EndpointID=condor.y.ac.uk_HTCondorCE,GLUE2ServiceID=condor.y.ac.uk_ComputingElement,GLUE2GroupID=resource,GLUE2DomainID=UKI-Y,GLUE2GroupID=grid,o=glue
objectClass: GLUE2ComputingEndpoint
GLUE2EndpointURL: condor://condor.y.ac.uk:9619

dn: GLUE2PolicyID=condor.y.ac.uk_Policy,GLUE2ShareID=condor.y.ac.uk_Share,GLUE2ServiceID=condor.y.ac.uk_ComputingElement,GLUE2GroupID=resource,GLUE2DomainID=UKI-Y,GLUE2GroupID=grid,o=glue
objectClass: GLUE2MappingPolicy
GLUE2PolicyRule: VO:lhcb
";

    fn config() -> SyncConfig {
        SyncConfig {
            vos: vec!["lhcb".into(), "atlas".into()],
            ..SyncConfig::default()
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn normalized(config: &SyncConfig) -> Normalized {
        let dir = LdifDirectory::from_ldif(LDIF).unwrap();
        normalize(&fetch(&dir, config).unwrap(), config, today())
    }

    #[test]
    fn test_service_host_forms() {
        assert_eq!(
            service_host("urn:ogf:ComputingService:arc.x.ac.uk:arex").as_deref(),
            Some("arc.x.ac.uk")
        );
        assert_eq!(
            service_host("condor.y.ac.uk_ComputingElement").as_deref(),
            Some("condor.y.ac.uk")
        );
        assert_eq!(service_host("ce.z.ac.uk:2811").as_deref(), Some("ce.z.ac.uk"));
        assert_eq!(endpoint_host("https://ce.z.ac.uk:9619/").as_deref(), Some("ce.z.ac.uk"));
        assert_eq!(endpoint_host("gsiftp://ce.z.ac.uk:2811"), None);
    }

    #[test]
    fn test_fetch_restricts_follow_up_queries() {
        let dir = LdifDirectory::from_ldif(LDIF).unwrap();
        let records = fetch(&dir, &config()).unwrap();
        assert_eq!(records.arc_services.len(), 1);
        assert_eq!(records.arc_managers.len(), 1);
        assert_eq!(records.arc_shares.len(), 2);
        assert_eq!(records.arc_policies.len(), 2);
        assert_eq!(records.condor_managers.len(), 1);
        assert_eq!(records.condor_endpoints.len(), 1);
        assert_eq!(records.condor_policies.len(), 1);
        assert_eq!(records.environments.len(), 1);
    }

    #[test]
    fn test_arc_ce_queues() {
        let out = normalized(&config());
        assert!(out.skipped.is_empty());
        let site = out.sites.iter().find(|s| s.site_id == "UKI-X").unwrap();
        assert_eq!(site.source, "glue2:arc");
        let ce = &site.compute_elements["arc.x.ac.uk"];
        assert_eq!(ce.ce_type.as_str(), "ARC");
        assert_eq!(ce.os, "EL7");
        assert_eq!(ce.architecture, "x86_64");

        let grid = &ce.queues["nordugrid-torque-grid"];
        assert_eq!(grid.max_cpu_time, 4320);
        assert_eq!(grid.allowed_vos, BTreeSet::from(["lhcb".to_string()]));
        assert_eq!(grid.max_total_jobs, Some(600));
        assert_eq!(grid.number_of_processors, Some(1));

        let multi = &ce.queues["nordugrid-multimtorque-grid"];
        assert_eq!(multi.number_of_processors, Some(8));
        assert!(multi.tags.contains("MultiProcessor"));
        assert_eq!(multi.local_ce_type.as_deref(), Some("Pool"));

        let gpu = &ce.queues["nordugrid-torque-gpu"];
        assert_eq!(gpu.max_cpu_time, 2940);
        assert!(gpu.required_tags.contains("GPU"));
        let gpu_multi = &ce.queues["nordugrid-multimtorque-gpu"];
        assert!(gpu_multi.tags.contains("GPU") && gpu_multi.tags.contains("MultiProcessor"));
    }

    #[test]
    fn test_htcondor_ce() {
        let out = normalized(&config());
        let site = out.sites.iter().find(|s| s.site_id == "UKI-Y").unwrap();
        let ce = &site.compute_elements["condor.y.ac.uk"];
        assert_eq!(ce.ce_type, CeType::HtCondorCe);
        let queue = &ce.queues["condor.y.ac.uk-condor"];
        assert_eq!(queue.max_cpu_time, 2881);
        assert_eq!(queue.max_total_jobs, Some(150));
        assert!(ce.queues.contains_key("condor.y.ac.uk-condor-multi"));
    }

    #[test]
    fn test_ce_without_wanted_vos_is_dropped() {
        let config = SyncConfig {
            vos: vec!["atlas".into()],
            ..SyncConfig::default()
        };
        let out = normalized(&config);
        assert!(out.sites.iter().all(|s| s.site_id != "UKI-Y"));
        let site = out.sites.iter().find(|s| s.site_id == "UKI-X").unwrap();
        let ce = &site.compute_elements["arc.x.ac.uk"];
        assert_eq!(ce.queues.len(), 2);
        assert!(ce.queues.contains_key("nordugrid-torque-gpu"));
    }

    #[test]
    fn test_cpu_time_override_and_no_multicore() {
        let mut config = config();
        config.cpu_time.host_overrides.insert("y.ac.uk".into(), 4320);
        config.multicore.enabled = false;
        let out = normalized(&config);
        let site = out.sites.iter().find(|s| s.site_id == "UKI-Y").unwrap();
        let ce = &site.compute_elements["condor.y.ac.uk"];
        assert_eq!(ce.queues.len(), 1);
        assert_eq!(ce.queues["condor.y.ac.uk-condor"].max_cpu_time, 4320);
        assert!(ce.max_processors.is_none());
    }
}
