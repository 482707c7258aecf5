//! VAC and vcycle resources registered in GOCDB.
//!
//! Each service endpoint becomes a single-queue CE under the `VAC` or
//! `CLOUD` root. `PILOT_SE_<vokey>` extensions attach SEs to the site and
//! `PILOT_DN_<vokey>` extensions register the pilot host certificate.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::models::{
    CeType, ComputeElement, Queue, RegistryHost, ResourceKind, SiteRecord, CLOUD_ROOT, VAC_ROOT,
};
use crate::normalize::Normalized;
use crate::source::{GocdbClient, ServiceRecord};

pub const VAC_SERVICE_TYPE: &str = "uk.ac.gridpp.vac";
pub const CLOUD_SERVICE_TYPE: &str = "uk.ac.gridpp.vcycle";

/// Queue written for every VAC/vcycle CE.
pub const DEFAULT_QUEUE: &str = "default";

/// Properties granted to registered pilot hosts.
pub const PILOT_HOST_PROPERTIES: [&str; 2] = ["GenericPilot", "LimitedDelegation"];

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PILOT_(SE|DN)_(.*)$").unwrap());

static CN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CN=([^/]*)").unwrap());

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GocdbRecords {
    pub vac: Vec<ServiceRecord>,
    pub cloud: Vec<ServiceRecord>,
}

pub fn fetch(client: &dyn GocdbClient) -> SyncResult<GocdbRecords> {
    let vac = client.get_service_endpoint_info("service_type", VAC_SERVICE_TYPE)?;
    let cloud = client.get_service_endpoint_info("service_type", CLOUD_SERVICE_TYPE)?;
    debug!("GOCDB: {} VAC and {} vcycle endpoints", vac.len(), cloud.len());
    Ok(GocdbRecords { vac, cloud })
}

/// Longest `CN=` component of a slash-separated DN.
pub fn common_name(dn: &str) -> Option<String> {
    CN_RE
        .captures_iter(dn)
        .map(|caps| caps[1].to_string())
        .max_by_key(|cn| cn.len())
        .filter(|cn| !cn.is_empty())
}

pub fn normalize(records: &GocdbRecords, config: &SyncConfig, today: NaiveDate) -> Normalized {
    let mut out = Normalized::default();
    for (root, services) in [(VAC_ROOT, &records.vac), (CLOUD_ROOT, &records.cloud)] {
        for service in services {
            normalize_service(service, root, config, today, &mut out);
        }
    }
    out
}

fn normalize_service(
    service: &ServiceRecord,
    root: &str,
    config: &SyncConfig,
    today: NaiveDate,
    out: &mut Normalized,
) {
    let site_name = service.site_name.as_deref().map(str::trim).unwrap_or("");
    let hostname = service.hostname.as_deref().map(str::trim).unwrap_or("");
    if site_name.is_empty() || hostname.is_empty() {
        let id = if hostname.is_empty() { site_name } else { hostname };
        out.skip(
            ResourceKind::ComputeElement,
            if id.is_empty() { "<unnamed>" } else { id },
            format!("{root} service is missing its site name or hostname"),
        );
        return;
    }
    let hostname = hostname.to_lowercase();
    if config.is_banned_ce(&hostname) {
        return;
    }

    let ce_type = if root == VAC_ROOT { CeType::Vac } else { CeType::Cloud };
    let mut ce = ComputeElement::new(hostname.clone(), ce_type, today);
    ce.architecture = config.vac.architecture.clone();
    ce.os = config.vac.os.clone();
    let max_cpu_time = config
        .vac
        .max_cpu_time
        .get(root)
        .copied()
        .unwrap_or(config.cpu_time.broken_default);
    ce.add_queue(Queue::new(DEFAULT_QUEUE, max_cpu_time));

    let mut site = SiteRecord::new(site_name, root, format!("gocdb:{}", root.to_lowercase()));
    site.display_name = site_name.to_string();
    site.add_ce(ce);

    for extension in &service.extensions {
        let Some(caps) = EXTENSION_RE.captures(extension.key.trim()) else {
            continue;
        };
        let (kind, vokey) = (&caps[1], &caps[2]);
        if !config.vac.vo_keys.contains(vokey) {
            warn!(
                site = %site_name,
                "extension {} uses vokey {vokey:?}, not one of {:?}",
                extension.key, config.vac.vo_keys
            );
            continue;
        }
        let value = extension.value.as_deref().map(str::trim).unwrap_or("");
        match kind {
            "SE" => {
                if value.is_empty() {
                    warn!(site = %site_name, "no SE value for extension {}", extension.key);
                    continue;
                }
                site.storage_elements.insert(value.to_string());
            }
            _ => {
                let cn = if value.contains("CN=") { common_name(value) } else { None };
                let Some(cn) = cn else {
                    out.skip(
                        ResourceKind::Host,
                        value,
                        format!("{}: no CN component in DN", extension.key),
                    );
                    continue;
                };
                out.hosts.push(RegistryHost {
                    cn,
                    dn: value.to_string(),
                    properties: PILOT_HOST_PROPERTIES
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<BTreeSet<_>>(),
                    last_seen: today,
                });
            }
        }
    }
    out.sites.push(site);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ServiceExtension, StaticGocdb};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn extension(key: &str, value: Option<&str>) -> ServiceExtension {
        ServiceExtension {
            key: key.to_string(),
            value: value.map(str::to_string),
        }
    }

    fn vac_service() -> ServiceRecord {
        ServiceRecord {
            site_name: Some("UKI-X".into()),
            hostname: Some("VAC01.x.ac.uk".into()),
            service_type: Some(VAC_SERVICE_TYPE.into()),
            extensions: vec![
                extension("PILOT_SE_GridPP", Some("UKI-X-disk")),
                extension("PILOT_DN_GridPP", Some("/C=UK/O=eScience/OU=X/L=PP/CN=vac01.x.ac.uk")),
                extension("PILOT_SE_Other", Some("UKI-Z-disk")),
                extension("CONTACT", Some("ops@x.ac.uk")),
            ],
        }
    }

    #[test]
    fn test_common_name_prefers_longest() {
        assert_eq!(
            common_name("/C=UK/CN=host/CN=vac01.x.ac.uk").as_deref(),
            Some("vac01.x.ac.uk")
        );
        assert_eq!(common_name("/C=UK/O=eScience"), None);
    }

    #[test]
    fn test_fetch_queries_both_service_types() {
        let mut cloud = vac_service();
        cloud.service_type = Some(CLOUD_SERVICE_TYPE.into());
        cloud.hostname = Some("vcycle.y.ac.uk".into());
        let client = StaticGocdb::new(vec![vac_service(), cloud]);
        let records = fetch(&client).unwrap();
        assert_eq!(records.vac.len(), 1);
        assert_eq!(records.cloud.len(), 1);
    }

    #[test]
    fn test_vac_service_normalizes_site_ce_and_host() {
        let records = GocdbRecords {
            vac: vec![vac_service()],
            cloud: Vec::new(),
        };
        let out = normalize(&records, &SyncConfig::default(), today());
        assert!(out.skipped.is_empty());
        assert_eq!(out.sites.len(), 1);
        let site = &out.sites[0];
        assert_eq!(site.root, "VAC");
        assert_eq!(site.display_name, "UKI-X");
        assert_eq!(site.storage_elements, BTreeSet::from(["UKI-X-disk".to_string()]));
        let ce = &site.compute_elements["vac01.x.ac.uk"];
        assert_eq!(ce.ce_type.as_str(), "Vac");
        assert_eq!(ce.os, "EL6");
        assert_eq!(ce.queues["default"].max_cpu_time, 400_000);

        assert_eq!(out.hosts.len(), 1);
        assert_eq!(out.hosts[0].cn, "vac01.x.ac.uk");
        assert!(out.hosts[0].properties.contains("GenericPilot"));
    }

    #[test]
    fn test_cloud_uses_cloud_root_and_cpu_time() {
        let records = GocdbRecords {
            vac: Vec::new(),
            cloud: vec![vac_service()],
        };
        let out = normalize(&records, &SyncConfig::default(), today());
        let site = &out.sites[0];
        assert_eq!(site.root, "CLOUD");
        assert_eq!(site.source, "gocdb:cloud");
        let ce = &site.compute_elements["vac01.x.ac.uk"];
        assert_eq!(ce.ce_type, CeType::Cloud);
        assert_eq!(ce.queues["default"].max_cpu_time, 24_000_000);
    }

    #[test]
    fn test_missing_site_name_is_skipped() {
        let mut service = vac_service();
        service.site_name = None;
        let records = GocdbRecords {
            vac: vec![service],
            cloud: Vec::new(),
        };
        let out = normalize(&records, &SyncConfig::default(), today());
        assert!(out.sites.is_empty());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].id, "VAC01.x.ac.uk");
    }

    #[test]
    fn test_dn_without_cn_is_skipped() {
        let mut service = vac_service();
        service.extensions = vec![extension("PILOT_DN_GridPP", Some("/C=UK/O=eScience"))];
        let records = GocdbRecords {
            vac: vec![service],
            cloud: Vec::new(),
        };
        let out = normalize(&records, &SyncConfig::default(), today());
        assert!(out.hosts.is_empty());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].kind, ResourceKind::Host);
        assert_eq!(out.sites.len(), 1);
    }
}
