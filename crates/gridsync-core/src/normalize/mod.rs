//! Projection of upstream records onto the canonical resource model.
//!
//! Each upstream schema has its own module with a `fetch` step (all the
//! queries, nothing else) and a pure `normalize` step. Fetch errors are
//! returned to the caller; problems with a single record end up in
//! [`Normalized::skipped`] and never stop the batch.

pub mod glue1_ce;
pub mod glue1_se;
pub mod glue2_ce;
pub mod gocdb;

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::warn;

use crate::config::{CpuTimePolicy, SyncConfig};
use crate::errors::{SyncError, SyncResult};
use crate::models::{RegistryHost, ResourceKind, SeRecord, SiteRecord, SkippedResource};
use crate::source::{GocdbClient, LdapSearch};

pub use glue1_ce::Glue1ComputeRecords;
pub use glue1_se::Glue1StorageRecords;
pub use glue2_ce::Glue2ComputeRecords;
pub use gocdb::GocdbRecords;

/// `VO:lhcb` style access-control rules.
static VO_RULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^VO:\s*([\w.-]+)").unwrap());

/// Upstream values that mean "no limit configured" rather than a real
/// CPU time.
pub const CPU_TIME_SENTINELS: [&str; 2] = ["0", "2147483647"];

// ---------------------------------------------------------------------------
// Upstream batches
// ---------------------------------------------------------------------------

/// Raw records from one upstream schema, as fetched.
#[derive(Clone, Debug)]
pub enum UpstreamBatch {
    Glue1Compute(Glue1ComputeRecords),
    Glue2Compute(Glue2ComputeRecords),
    Glue1Storage(Glue1StorageRecords),
    Gocdb(GocdbRecords),
}

impl UpstreamBatch {
    pub fn label(&self) -> &'static str {
        match self {
            UpstreamBatch::Glue1Compute(_) => "glue1-compute",
            UpstreamBatch::Glue2Compute(_) => "glue2-compute",
            UpstreamBatch::Glue1Storage(_) => "glue1-storage",
            UpstreamBatch::Gocdb(_) => "gocdb",
        }
    }

    pub fn normalize(&self, config: &SyncConfig, today: NaiveDate) -> Normalized {
        match self {
            UpstreamBatch::Glue1Compute(records) => glue1_ce::normalize(records, config, today),
            UpstreamBatch::Glue2Compute(records) => glue2_ce::normalize(records, config, today),
            UpstreamBatch::Glue1Storage(records) => glue1_se::normalize(records, config),
            UpstreamBatch::Gocdb(records) => gocdb::normalize(records, config, today),
        }
    }
}

/// Run every enabled upstream query. Any error here is a fetch failure.
pub fn fetch_all(
    ldap: &dyn LdapSearch,
    gocdb_client: Option<&dyn GocdbClient>,
    config: &SyncConfig,
) -> SyncResult<Vec<UpstreamBatch>> {
    let mut batches = Vec::new();
    if config.process_ses {
        batches.push(UpstreamBatch::Glue1Storage(glue1_se::fetch(ldap, config)?));
    }
    if config.process_ces {
        batches.push(UpstreamBatch::Glue1Compute(glue1_ce::fetch(ldap, config)?));
        if config.process_glue2 {
            batches.push(UpstreamBatch::Glue2Compute(glue2_ce::fetch(ldap, config)?));
        }
    }
    if config.process_vac {
        match gocdb_client {
            Some(client) => batches.push(UpstreamBatch::Gocdb(gocdb::fetch(client)?)),
            None => warn!("VAC processing enabled but no GOCDB client configured"),
        }
    }
    Ok(batches)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Canonical records produced by one or more normalizers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Normalized {
    pub sites: Vec<SiteRecord>,
    pub storage: Vec<SeRecord>,
    pub hosts: Vec<RegistryHost>,
    pub skipped: Vec<SkippedResource>,
}

impl Normalized {
    pub fn extend(&mut self, other: Normalized) {
        self.sites.extend(other.sites);
        self.storage.extend(other.storage);
        self.hosts.extend(other.hosts);
        self.skipped.extend(other.skipped);
    }

    /// Record a resource left out of this run.
    pub fn skip(&mut self, kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) {
        let skipped = SkippedResource::new(kind, id, reason);
        warn!(kind = ?skipped.kind, id = %skipped.id, "Skipping: {}", skipped.reason);
        self.skipped.push(skipped);
    }

    /// Record a resource left out because of a record-level error.
    pub fn reject(&mut self, kind: ResourceKind, id: impl Into<String>, err: SyncError) {
        debug_assert!(!err.is_fatal(), "fatal error reported as a skip: {err}");
        self.skip(kind, id, err.to_string());
    }
}

// ---------------------------------------------------------------------------
// Shared field policies
// ---------------------------------------------------------------------------

/// `maxCPUTime` in minutes. Sentinels and absent values become the
/// broken-batch-system default; other numbers pass through.
pub fn normalize_cpu_time(raw: Option<&str>, policy: &CpuTimePolicy) -> u64 {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return policy.broken_default;
    };
    if CPU_TIME_SENTINELS.contains(&raw) {
        return policy.broken_default;
    }
    match raw.parse::<u64>() {
        Ok(minutes) => minutes,
        Err(_) => {
            warn!("unparsable maxCPUTime {raw:?}, using {}", policy.broken_default);
            policy.broken_default
        }
    }
}

/// GLUE2 shares publish CPU time in whatever unit the site chose. Small
/// values are taken as hours and large ones as seconds.
pub fn tidy_cpu_time(value: u64) -> u64 {
    if value < 500 {
        value * 60
    } else if value > 25_000 {
        value / 60
    } else {
        value
    }
}

/// `EL<major>` from an OS release such as `7.9.2009`. Empty when unknown.
pub fn os_from_release(release: &str) -> String {
    let major = release.trim().split('.').next().unwrap_or("").trim();
    if major.is_empty() {
        String::new()
    } else {
        format!("EL{major}")
    }
}

/// VO named by a `VO:<name>` rule.
pub fn vo_from_rule(rule: &str) -> Option<String> {
    VO_RULE_RE
        .captures(rule.trim())
        .map(|caps| caps[1].to_string())
}

/// Whether `vo` is one of the configured VOs. No configured VOs means all.
pub fn wanted_vo(config: &SyncConfig, vo: &str) -> bool {
    config.vos.is_empty() || config.vos.iter().any(|v| v == vo)
}

pub(crate) fn parse_count(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_time_sentinels_use_broken_default() {
        let policy = CpuTimePolicy::default();
        assert_eq!(normalize_cpu_time(Some("0"), &policy), 2880);
        assert_eq!(normalize_cpu_time(Some("2147483647"), &policy), 2880);
        assert_eq!(normalize_cpu_time(Some("4320"), &policy), 4320);
        assert_eq!(normalize_cpu_time(Some(" 60 "), &policy), 60);
        assert_eq!(normalize_cpu_time(None, &policy), 2880);
        assert_eq!(normalize_cpu_time(Some("forever"), &policy), 2880);
    }

    #[test]
    fn test_sentinel_default_is_configurable() {
        let policy = CpuTimePolicy {
            broken_default: 1440,
            ..CpuTimePolicy::default()
        };
        assert_eq!(normalize_cpu_time(Some("0"), &policy), 1440);
    }

    #[test]
    fn test_tidy_cpu_time_units() {
        assert_eq!(tidy_cpu_time(72), 4320);
        assert_eq!(tidy_cpu_time(2880), 2880);
        assert_eq!(tidy_cpu_time(259_200), 4320);
    }

    #[test]
    fn test_os_from_release() {
        assert_eq!(os_from_release("7.9.2009"), "EL7");
        assert_eq!(os_from_release(" 9 "), "EL9");
        assert_eq!(os_from_release(""), "");
    }

    #[test]
    fn test_vo_rules() {
        assert_eq!(vo_from_rule("VO:lhcb").as_deref(), Some("lhcb"));
        assert_eq!(vo_from_rule("VO: vo.northgrid.ac.uk").as_deref(), Some("vo.northgrid.ac.uk"));
        assert_eq!(vo_from_rule("VOMS:/lhcb/Role=pilot"), None);
    }
}
