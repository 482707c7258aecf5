//! GLUE1 compute: `GlueCE` queues per VO plus the cluster, sub-cluster and
//! site records they point at.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tracing::debug;

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};
use crate::models::{CeType, ComputeElement, Queue, ResourceKind, SiteRecord};
use crate::normalize::{normalize_cpu_time, os_from_release, parse_count, vo_from_rule, Normalized};
use crate::source::filter::{escape_value, in_values, FILTER_CHUNK_SIZE};
use crate::source::{LdapRecord, LdapSearch};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Glue1ComputeRecords {
    /// VO -> `GlueCE` entries whose access rules grant it.
    pub queues: BTreeMap<String, Vec<LdapRecord>>,
    pub clusters: Vec<LdapRecord>,
    pub sub_clusters: Vec<LdapRecord>,
    pub sites: Vec<LdapRecord>,
}

fn vo_filter(vo: &str) -> String {
    let vo = escape_value(vo);
    format!(
        "(&(objectClass=GlueCE)(|(GlueCEAccessControlBaseRule=VO:{vo})\
         (GlueCEAccessControlBaseRule=VOMS:/{vo}/*)))"
    )
}

fn cluster_of(queue: &LdapRecord) -> Option<String> {
    queue
        .keyed_value("GlueForeignKey", "GlueClusterUniqueID")
        .or_else(|| Some(queue.text("GlueCEHostingCluster").to_string()))
        .filter(|id| !id.is_empty())
}

fn chunked_search(
    ldap: &dyn LdapSearch,
    base: &str,
    object_class: &str,
    attr: &str,
    values: &[String],
) -> SyncResult<Vec<LdapRecord>> {
    let mut out = Vec::new();
    for chunk in values.chunks(FILTER_CHUNK_SIZE) {
        let filter = format!("(&(objectClass={object_class}){})", in_values(attr, chunk));
        out.extend(ldap.search(base, &filter)?);
    }
    Ok(out)
}

pub fn fetch(ldap: &dyn LdapSearch, config: &SyncConfig) -> SyncResult<Glue1ComputeRecords> {
    let base = config.glue1_base.as_str();
    let mut records = Glue1ComputeRecords::default();

    let mut cluster_ids = BTreeSet::new();
    for vo in &config.vos {
        let found = ldap.search(base, &vo_filter(vo))?;
        debug!("GLUE1: {} queues for VO {vo}", found.len());
        cluster_ids.extend(found.iter().filter_map(cluster_of));
        records.queues.insert(vo.clone(), found);
    }

    let cluster_ids: Vec<String> = cluster_ids.into_iter().collect();
    records.clusters =
        chunked_search(ldap, base, "GlueCluster", "GlueClusterUniqueID", &cluster_ids)?;

    let chunk_keys: Vec<String> = cluster_ids
        .iter()
        .map(|id| format!("GlueClusterUniqueID={id}"))
        .collect();
    records.sub_clusters =
        chunked_search(ldap, base, "GlueSubCluster", "GlueChunkKey", &chunk_keys)?;

    let site_ids: Vec<String> = records
        .clusters
        .iter()
        .filter_map(|c| c.keyed_value("GlueForeignKey", "GlueSiteUniqueID"))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    records.sites = chunked_search(ldap, base, "GlueSite", "GlueSiteUniqueID", &site_ids)?;
    Ok(records)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// `ce.example.ac.uk:8443/cream-pbs-grid` -> (`ce.example.ac.uk`, `cream-pbs-grid`).
/// `(host, queue)` from a `GlueCEUniqueID` such as `ce.x.ac.uk:8443/cream-pbs-grid`.
fn split_unique_id(unique_id: &str) -> SyncResult<(String, String)> {
    let malformed = || {
        SyncError::Normalization(format!("GlueCEUniqueID {unique_id:?} has no host/queue form"))
    };
    let (endpoint, queue) = unique_id.trim().split_once('/').ok_or_else(malformed)?;
    let host = endpoint.split(':').next().unwrap_or("").trim();
    let queue = queue.trim();
    if host.is_empty() || queue.is_empty() {
        return Err(malformed());
    }
    Ok((host.to_lowercase(), queue.to_string()))
}

fn queue_si00(queue: &LdapRecord) -> Option<String> {
    queue
        .values("GlueCECapability")
        .iter()
        .find(|cap| cap.contains("CPUScalingReferenceSI00"))
        .and_then(|cap| cap.rsplit('=').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn queue_vos(queue: &LdapRecord) -> BTreeSet<String> {
    if !queue.text("GlueCEStateStatus").eq_ignore_ascii_case("production") {
        return BTreeSet::new();
    }
    queue
        .values("GlueCEAccessControlBaseRule")
        .iter()
        .filter_map(|rule| vo_from_rule(rule))
        .collect()
}

fn build_ce(
    host: &str,
    queue_name: &str,
    queue: &LdapRecord,
    sub_cluster: Option<&LdapRecord>,
    config: &SyncConfig,
    today: NaiveDate,
) -> ComputeElement {
    let ce_type = CeType::parse(queue.text("GlueCEImplementationName"));
    let mut ce = ComputeElement::new(host, ce_type, today);
    let mut logical_cpus = 0;

    if let Some(sub) = sub_cluster {
        ce.architecture = sub.text("GlueHostArchitecturePlatformType").to_string();
        ce.si00 = sub.text("GlueHostBenchmarkSI00").to_string();
        ce.host_ram = sub.text("GlueHostMainMemoryRAMSize").to_string();
        ce.os = os_from_release(sub.text("GlueHostOperatingSystemRelease"));
        logical_cpus = parse_count(sub.text("GlueSubClusterLogicalCPUs"));
        let smp = sub.text("GlueHostArchitectureSMPSize").parse::<u32>().unwrap_or(1);
        let cores = config.max_processors_override.unwrap_or(smp);
        ce.max_processors = (cores > 1).then_some(cores);
    } else if let Some(cores) = config.max_processors_override.filter(|c| *c > 1) {
        ce.max_processors = Some(cores);
    }
    ce.extra_options = config.extra_options_for(host);

    let mut q = Queue::new(
        queue_name,
        normalize_cpu_time(queue.longest("GlueCEPolicyMaxCPUTime"), &config.cpu_time),
    );
    q.allowed_vos = queue_vos(queue);
    q.si00 = queue_si00(queue).unwrap_or_else(|| ce.si00.clone());
    let slots = match parse_count(queue.text("GlueCEInfoTotalCPUs")) {
        0 => logical_cpus,
        n => n,
    };
    let (total, waiting) = config.job_limits.limits(slots);
    q.max_total_jobs = Some(total);
    q.max_waiting_jobs = Some(waiting);
    ce.add_queue(q);
    ce
}

fn site_details(record: &mut SiteRecord, site: &LdapRecord) {
    record.description = site.text("GlueSiteDescription").to_string();
    let (lon, lat) = (site.text("GlueSiteLongitude"), site.text("GlueSiteLatitude"));
    if !lon.is_empty() && !lat.is_empty() {
        record.coordinates = format!("{lon}:{lat}");
    }
    let mail = [
        "GlueSiteSysAdminContact",
        "GlueSiteUserSupportContact",
        "GlueSiteSecurityContact",
    ]
    .iter()
    .map(|attr| site.text(attr))
    .find(|v| !v.is_empty())
    .unwrap_or("");
    record.contact_mail = mail.trim_start_matches("mailto:").trim().to_string();
}

pub fn normalize(
    records: &Glue1ComputeRecords,
    config: &SyncConfig,
    today: NaiveDate,
) -> Normalized {
    let mut out = Normalized::default();

    let cluster_site: BTreeMap<String, String> = records
        .clusters
        .iter()
        .filter_map(|c| {
            let id = c.text("GlueClusterUniqueID").to_string();
            let site = c.keyed_value("GlueForeignKey", "GlueSiteUniqueID")?;
            Some((id, site))
        })
        .collect();

    let mut sub_clusters: BTreeMap<String, &LdapRecord> = BTreeMap::new();
    let mut sorted_subs: Vec<&LdapRecord> = records.sub_clusters.iter().collect();
    sorted_subs.sort_by(|a, b| a.dn.cmp(&b.dn));
    for sub in sorted_subs {
        if let Some(cluster) = sub.keyed_value("GlueChunkKey", "GlueClusterUniqueID") {
            sub_clusters.entry(cluster).or_insert(sub);
        }
    }

    let sites: BTreeMap<&str, &LdapRecord> = records
        .sites
        .iter()
        .map(|s| (s.text("GlueSiteUniqueID"), s))
        .collect();

    // (site id, vo) -> partial site view
    let mut views: BTreeMap<(String, String), SiteRecord> = BTreeMap::new();
    for (vo, queues) in &records.queues {
        let mut queues: Vec<&LdapRecord> = queues.iter().collect();
        queues.sort_by(|a, b| a.dn.cmp(&b.dn));
        for queue in queues {
            let unique_id = queue.text("GlueCEUniqueID");
            let (host, queue_name) = match split_unique_id(unique_id) {
                Ok(parts) => parts,
                Err(e) => {
                    out.reject(ResourceKind::Queue, unique_id, e);
                    continue;
                }
            };
            if config.is_banned_ce(&host) {
                debug!(ce = %host, "banned CE ignored");
                continue;
            }
            let Some(cluster) = cluster_of(queue) else {
                out.skip(ResourceKind::ComputeElement, &host, "queue names no GlueCluster");
                continue;
            };
            let Some(site_id) = cluster_site.get(&cluster) else {
                out.skip(
                    ResourceKind::ComputeElement,
                    &host,
                    format!("cluster {cluster} is not linked to a site"),
                );
                continue;
            };

            let sub_cluster = sub_clusters.get(&cluster).copied();
            let ce = build_ce(&host, &queue_name, queue, sub_cluster, config, today);
            views
                .entry((site_id.clone(), vo.clone()))
                .or_insert_with(|| {
                    SiteRecord::new(site_id.clone(), config.domain.clone(), format!("glue1:{vo}"))
                })
                .add_ce(ce);
        }
    }

    let mut rejected: BTreeSet<String> = BTreeSet::new();
    for ((site_id, _), mut record) in views {
        if rejected.contains(&site_id) {
            continue;
        }
        let site = sites.get(site_id.as_str()).copied();
        let name = site.map(|s| s.text("GlueSiteName")).unwrap_or("");
        let Some(site) = site.filter(|_| !name.is_empty()) else {
            out.skip(ResourceKind::Site, &site_id, "GlueSite record has no GlueSiteName");
            rejected.insert(site_id);
            continue;
        };
        record.display_name = name.to_string();
        site_details(&mut record, site);
        out.sites.push(record);
    }
    out
}
