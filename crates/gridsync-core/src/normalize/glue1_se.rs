//! GLUE1 storage: storage areas, SRM services, XRootD access protocols and
//! VO paths, folded into one record per (SE host, latency).

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use url::Url;

use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::models::{Latency, ResourceKind, SeRecord, SrmEndpoint, UNKNOWN};
use crate::normalize::{vo_from_rule, Normalized};
use crate::source::{dn_components, LdapRecord, LdapSearch};

const SA_FILTER: &str = "(&(objectClass=GlueSA)(GlueChunkKey=*))";
const SRM_FILTER: &str =
    "(&(objectClass=GlueService)(GlueServiceType=SRM)(GlueServiceEndpoint=*)(GlueForeignKey=*))";
const SE_FILTER: &str = "(&(objectClass=GlueSE)(GlueSEUniqueID=*))";
const XROOT_FILTER: &str = "(&(objectClass=GlueSEAccessProtocol)(GlueChunkKey=*)\
     (GlueSEAccessProtocolEndpoint=*)(GlueSEAccessProtocolType=Root))";
const VOINFO_FILTER: &str = "(&(objectClass=GlueVOInfo)(GlueChunkKey=*)\
     (GlueVOInfoAccessControlBaseRule=*)(GlueVOInfoPath=*))";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Glue1StorageRecords {
    pub storage_areas: Vec<LdapRecord>,
    pub srm_services: Vec<LdapRecord>,
    pub storage_elements: Vec<LdapRecord>,
    pub xrootd_protocols: Vec<LdapRecord>,
    pub vo_infos: Vec<LdapRecord>,
}

pub fn fetch(ldap: &dyn LdapSearch, config: &SyncConfig) -> SyncResult<Glue1StorageRecords> {
    let base = config.glue1_base.as_str();
    let records = Glue1StorageRecords {
        storage_areas: ldap.search(base, SA_FILTER)?,
        srm_services: ldap.search(base, SRM_FILTER)?,
        storage_elements: ldap.search(base, SE_FILTER)?,
        xrootd_protocols: ldap.search(base, XROOT_FILTER)?,
        vo_infos: ldap.search(base, VOINFO_FILTER)?,
    };
    debug!(
        "GLUE1 storage: {} SAs, {} SRMs, {} SEs",
        records.storage_areas.len(),
        records.srm_services.len(),
        records.storage_elements.len()
    );
    Ok(records)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Whether a DN was published by the site's own resource BDII rather than
/// relayed by another one.
fn published_by_site(dn: &str, site: &str) -> bool {
    dn_components(dn)
        .iter()
        .any(|(key, value)| key.eq_ignore_ascii_case("Mds-Vo-name") && value == site)
}

fn se_of_chunk(record: &LdapRecord) -> Option<String> {
    record
        .keyed_value("GlueChunkKey", "GlueSEUniqueID")
        .filter(|host| !host.is_empty())
}

fn endpoint_host_port(endpoint: &str) -> Option<(String, Option<u16>)> {
    let url = Url::parse(endpoint.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some((host, url.port()))
}

struct SrmService {
    endpoint: SrmEndpoint,
    vos: BTreeSet<String>,
}

pub fn normalize(records: &Glue1StorageRecords, config: &SyncConfig) -> Normalized {
    let mut out = Normalized::default();

    // host -> latency -> VOs from the storage areas
    let mut areas: BTreeMap<String, BTreeMap<Latency, BTreeSet<String>>> = BTreeMap::new();
    for sa in &records.storage_areas {
        let Some(host) = se_of_chunk(sa) else { continue };
        let latency = Latency::from_glue(sa.text("GlueSAAccessLatency"));
        let vos = sa
            .values("GlueSAAccessControlBaseRule")
            .iter()
            .filter_map(|rule| vo_from_rule(rule));
        areas
            .entry(host)
            .or_default()
            .entry(latency)
            .or_default()
            .extend(vos);
    }

    let mut srms: BTreeMap<String, SrmService> = BTreeMap::new();
    let mut sorted_srms: Vec<&LdapRecord> = records.srm_services.iter().collect();
    sorted_srms.sort_by(|a, b| a.dn.cmp(&b.dn));
    for srm in sorted_srms {
        let site = srm
            .keyed_value("GlueForeignKey", "GlueSiteUniqueID")
            .unwrap_or_default();
        if !published_by_site(&srm.dn, &site) {
            continue;
        }
        let Some((host, port)) = endpoint_host_port(srm.text("GlueServiceEndpoint")) else {
            debug!("unparsable SRM endpoint in {}", srm.dn);
            continue;
        };
        if srms.contains_key(&host) {
            debug!(se = %host, "SRM already recorded, ignoring {}", srm.dn);
            continue;
        }
        let vos = srm
            .values("GlueServiceAccessControlBaseRule")
            .iter()
            .filter_map(|rule| vo_from_rule(rule))
            .collect();
        srms.insert(
            host,
            SrmService {
                endpoint: SrmEndpoint {
                    port,
                    version: srm.text("GlueServiceVersion").to_string(),
                },
                vos,
            },
        );
    }

    let mut xrootd_ports: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
    for protocol in &records.xrootd_protocols {
        let Some(host) = se_of_chunk(protocol) else { continue };
        let endpoint = protocol.text("GlueSEAccessProtocolEndpoint");
        if let Some((_, Some(port))) = endpoint_host_port(endpoint) {
            xrootd_ports.entry(host).or_default().insert(port);
        }
    }

    let mut vo_paths: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for info in &records.vo_infos {
        let Some(host) = se_of_chunk(info) else { continue };
        let path = info.text("GlueVOInfoPath");
        if path.is_empty() {
            continue;
        }
        for vo in info
            .values("GlueVOInfoAccessControlBaseRule")
            .iter()
            .filter_map(|rule| vo_from_rule(rule))
        {
            vo_paths
                .entry(host.clone())
                .or_default()
                .entry(vo)
                .or_default()
                .insert(path.to_string());
        }
    }

    let mut ses: Vec<&LdapRecord> = records.storage_elements.iter().collect();
    ses.sort_by(|a, b| a.dn.cmp(&b.dn));
    let mut seen = BTreeSet::new();
    for se in ses {
        let Some(site) = se.keyed_value("GlueForeignKey", "GlueSiteUniqueID") else {
            out.skip(ResourceKind::StorageElement, &se.dn, "GlueSE names no site");
            continue;
        };
        if !published_by_site(&se.dn, &site) {
            continue;
        }
        let host = se.text("GlueSEUniqueID").to_lowercase();
        if !host.contains('.') || !seen.insert(host.clone()) {
            continue;
        }
        if config.is_banned_se(&host) {
            debug!(se = %host, "banned SE ignored");
            continue;
        }
        let Some(latencies) = areas.get(&host) else {
            out.skip(ResourceKind::StorageElement, &host, "no storage areas published");
            continue;
        };
        let srm = srms.get(&host);

        for (latency, sa_vos) in latencies {
            let mut record = SeRecord::new(site.clone(), host.clone(), *latency);
            let backend = se.text("GlueSEImplementationName");
            if !backend.is_empty() {
                record.backend_type = backend.to_string();
            }
            record.description = se.text("GlueSEName").to_string();
            let size = se.text("GlueSETotalOnlineSize");
            record.total_size = if size.is_empty() {
                UNKNOWN.to_string()
            } else {
                size.to_string()
            };
            record.allowed_vos = if sa_vos.is_empty() {
                srm.map(|s| s.vos.clone()).unwrap_or_default()
            } else {
                sa_vos.clone()
            };
            record.vo_paths = vo_paths.get(&host).cloned().unwrap_or_default();
            record.srm = srm.map(|s| s.endpoint.clone());
            record.xrootd_ports = xrootd_ports.get(&host).cloned().unwrap_or_default();

            if config.filter_ses_by_vo
                && !config.vos.is_empty()
                && !record.allowed_vos.iter().any(|vo| config.vos.contains(vo))
            {
                debug!(se = %host, "no configured VO on {latency} SE");
                continue;
            }
            out.storage.push(record);
        }
    }
    out
}
