//! Run configuration: JSON file plus `GRIDSYNC_*` environment overrides.
//!
//! Every numeric policy the engine applies (job-limit multipliers, CPU-time
//! defaults, country-code exceptions) lives here rather than in code because
//! operators tune them in response to site complaints.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{SyncError, SyncResult};
use crate::source::{GLUE1_BASE, GLUE2_BASE};

/// Hostname suffix mapped to a country code ahead of the TLD rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryMapping {
    pub suffix: String,
    pub code: String,
}

/// Derivation of `MaxTotalJobs` / `MaxWaitingJobs` from a CE's CPU count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLimitPolicy {
    #[serde(default = "default_total_multiplier")]
    pub total_multiplier: u64,
    #[serde(default = "default_waiting_multiplier")]
    pub waiting_multiplier: u64,
    /// Used for both limits when the CPU count is unknown or zero. Chosen so
    /// it stands out from any computed value.
    #[serde(default = "default_unknown_slots")]
    pub unknown_slots_default: u64,
}

impl JobLimitPolicy {
    /// `(max_total_jobs, max_waiting_jobs)` for `slots` CPUs.
    pub fn limits(&self, slots: u64) -> (u64, u64) {
        if slots == 0 {
            return (self.unknown_slots_default, self.unknown_slots_default);
        }
        (
            self.total_multiplier.saturating_mul(slots),
            self.waiting_multiplier.saturating_mul(slots),
        )
    }
}

impl Default for JobLimitPolicy {
    fn default() -> Self {
        Self {
            total_multiplier: default_total_multiplier(),
            waiting_multiplier: default_waiting_multiplier(),
            unknown_slots_default: default_unknown_slots(),
        }
    }
}

/// Queue `maxCPUTime` policy, in minutes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimePolicy {
    /// Replaces the upstream sentinels `0` and `2147483647`.
    #[serde(default = "default_broken_cpu_time")]
    pub broken_default: u64,
    /// GLUE2 shares that publish no `GLUE2ComputingShareMaxCPUTime`.
    #[serde(default = "default_glue2_cpu_time")]
    pub glue2_default: u64,
    /// HTCondorCEs publish no CPU time at all.
    #[serde(default = "default_htcondor_cpu_time")]
    pub htcondor_default: u64,
    /// Hostname suffix -> minutes, for CEs known to differ from the defaults.
    #[serde(default)]
    pub host_overrides: BTreeMap<String, u64>,
}

impl CpuTimePolicy {
    pub fn override_for(&self, host: &str) -> Option<u64> {
        longest_suffix_match(&self.host_overrides, host).copied()
    }
}

impl Default for CpuTimePolicy {
    fn default() -> Self {
        Self {
            broken_default: default_broken_cpu_time(),
            glue2_default: default_glue2_cpu_time(),
            htcondor_default: default_htcondor_cpu_time(),
            host_overrides: BTreeMap::new(),
        }
    }
}

/// Sibling multicore queues generated for GLUE2 CEs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticorePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_multicore_processors")]
    pub processors: u32,
}

impl Default for MulticorePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            processors: default_multicore_processors(),
        }
    }
}

/// Extra CE options for hosts whose published information is incomplete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeOptionOverride {
    pub host_suffix: String,
    pub options: BTreeMap<String, String>,
}

/// VAC / vcycle resources registered in GOCDB.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacPolicy {
    #[serde(default = "default_vo_keys")]
    pub vo_keys: BTreeSet<String>,
    /// Site root (`VAC`, `CLOUD`) -> queue maxCPUTime.
    #[serde(default = "default_vac_cpu_time")]
    pub max_cpu_time: BTreeMap<String, u64>,
    #[serde(default = "default_vac_os")]
    pub os: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

impl Default for VacPolicy {
    fn default() -> Self {
        Self {
            vo_keys: default_vo_keys(),
            max_cpu_time: default_vac_cpu_time(),
            os: default_vac_os(),
            architecture: default_architecture(),
        }
    }
}

/// Configuration for one reconciliation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Namespace root for site names, e.g. `LCG`.
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_country")]
    pub country_default: String,
    #[serde(default = "default_country_mappings")]
    pub country_mappings: Vec<CountryMapping>,
    #[serde(default = "default_retention_days")]
    pub retention_threshold_days: u32,
    #[serde(default)]
    pub banned_ces: BTreeSet<String>,
    #[serde(default)]
    pub banned_ses: BTreeSet<String>,
    #[serde(default)]
    pub max_processors_override: Option<u32>,
    /// VOs to discover resources for. Each GLUE1 CE query is scoped to one VO.
    #[serde(default)]
    pub vos: Vec<String>,
    #[serde(default = "default_glue1_base")]
    pub glue1_base: String,
    #[serde(default = "default_glue2_base")]
    pub glue2_base: String,
    #[serde(default = "default_true")]
    pub process_ces: bool,
    #[serde(default = "default_true")]
    pub process_ses: bool,
    #[serde(default = "default_true")]
    pub process_glue2: bool,
    #[serde(default)]
    pub process_vac: bool,
    #[serde(default = "default_true")]
    pub remove_stale: bool,
    /// Only keep SEs serving at least one configured VO.
    #[serde(default = "default_true")]
    pub filter_ses_by_vo: bool,
    #[serde(default)]
    pub job_limits: JobLimitPolicy,
    #[serde(default)]
    pub cpu_time: CpuTimePolicy,
    #[serde(default)]
    pub multicore: MulticorePolicy,
    #[serde(default)]
    pub ce_extra_options: Vec<CeOptionOverride>,
    /// OS written for GLUE2 CEs whose execution environment is unrecognised.
    #[serde(default = "default_os")]
    pub default_os: String,
    #[serde(default)]
    pub vac: VacPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            country_default: default_country(),
            country_mappings: default_country_mappings(),
            retention_threshold_days: default_retention_days(),
            banned_ces: BTreeSet::new(),
            banned_ses: BTreeSet::new(),
            max_processors_override: None,
            vos: Vec::new(),
            glue1_base: default_glue1_base(),
            glue2_base: default_glue2_base(),
            process_ces: true,
            process_ses: true,
            process_glue2: true,
            process_vac: false,
            remove_stale: true,
            filter_ses_by_vo: true,
            job_limits: JobLimitPolicy::default(),
            cpu_time: CpuTimePolicy::default(),
            multicore: MulticorePolicy::default(),
            ce_extra_options: Vec::new(),
            default_os: default_os(),
            vac: VacPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(text: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `GRIDSYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> SyncResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> SyncResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GRIDSYNC_DOMAIN") {
            self.domain = v.trim().to_string();
        }
        if let Some(v) = lookup("GRIDSYNC_COUNTRY_DEFAULT") {
            self.country_default = v.trim().to_lowercase();
        }
        if let Some(v) = lookup("GRIDSYNC_RETENTION_DAYS") {
            self.retention_threshold_days = v.trim().parse().map_err(|_| {
                SyncError::Config(format!("GRIDSYNC_RETENTION_DAYS is not a number: {v:?}"))
            })?;
        }
        if let Some(v) = lookup("GRIDSYNC_MAX_PROCESSORS") {
            let v = v.trim();
            self.max_processors_override = if v.is_empty() {
                None
            } else {
                Some(v.parse().map_err(|_| {
                    SyncError::Config(format!("GRIDSYNC_MAX_PROCESSORS is not a number: {v:?}"))
                })?)
            };
        }
        if let Some(v) = lookup("GRIDSYNC_BANNED_CES") {
            self.banned_ces = split_list(&v).collect();
        }
        if let Some(v) = lookup("GRIDSYNC_BANNED_SES") {
            self.banned_ses = split_list(&v).collect();
        }
        if let Some(v) = lookup("GRIDSYNC_VOS") {
            self.vos = split_list(&v).collect();
        }
        if let Some(v) = lookup("GRIDSYNC_REMOVE_STALE") {
            self.remove_stale = flag_enabled(&v);
        }
        if let Some(v) = lookup("GRIDSYNC_PROCESS_VAC") {
            self.process_vac = flag_enabled(&v);
        }
        self.validate()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.domain.trim().is_empty() || self.domain.contains(['/', '.']) {
            return Err(SyncError::Config(format!(
                "domain must be a non-empty single path component, got {:?}",
                self.domain
            )));
        }
        if self.country_default.len() != 2
            || !self.country_default.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(SyncError::Config(format!(
                "country_default must be two letters, got {:?}",
                self.country_default
            )));
        }
        if self.retention_threshold_days == 0 {
            return Err(SyncError::Config(
                "retention_threshold_days must be at least 1".into(),
            ));
        }
        if self.job_limits.total_multiplier == 0 || self.job_limits.waiting_multiplier == 0 {
            return Err(SyncError::Config("job limit multipliers must be non-zero".into()));
        }
        if self.process_ces && self.vos.is_empty() {
            return Err(SyncError::Config(
                "at least one VO is required to discover CEs".into(),
            ));
        }
        Ok(())
    }

    pub fn is_banned_ce(&self, host: &str) -> bool {
        self.banned_ces.contains(host)
    }

    pub fn is_banned_se(&self, name_or_host: &str) -> bool {
        self.banned_ses.contains(name_or_host)
    }

    /// Extra options configured for `host`, merged over all matching suffixes.
    pub fn extra_options_for(&self, host: &str) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for item in &self.ce_extra_options {
            if host_matches_suffix(host, &item.host_suffix) {
                merged.extend(item.options.clone());
            }
        }
        merged
    }
}

/// Split a comma separated list, dropping blanks.
pub fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn flag_enabled(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

/// Whether `host` is `suffix` or lies under it as a domain. A leading dot on
/// the suffix is optional; `x.efda.org` matches `efda.org`, `notefda.org`
/// does not.
pub fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
    if suffix.is_empty() {
        return false;
    }
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

fn longest_suffix_match<'a, V>(table: &'a BTreeMap<String, V>, host: &str) -> Option<&'a V> {
    table
        .iter()
        .filter(|(suffix, _)| host_matches_suffix(host, suffix))
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(_, v)| v)
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "LCG".to_string()
}

fn default_country() -> String {
    "xx".to_string()
}

fn default_country_mappings() -> Vec<CountryMapping> {
    [
        (".gov", "us"),
        (".edu", "us"),
        ("efda.org", "uk"),
        ("atlas-swt2.org", "us"),
    ]
    .into_iter()
    .map(|(suffix, code)| CountryMapping {
        suffix: suffix.to_string(),
        code: code.to_string(),
    })
    .collect()
}

fn default_retention_days() -> u32 {
    5
}

fn default_glue1_base() -> String {
    GLUE1_BASE.to_string()
}

fn default_glue2_base() -> String {
    GLUE2_BASE.to_string()
}

fn default_total_multiplier() -> u64 {
    3
}

fn default_waiting_multiplier() -> u64 {
    1
}

fn default_unknown_slots() -> u64 {
    2222
}

fn default_broken_cpu_time() -> u64 {
    2880
}

fn default_glue2_cpu_time() -> u64 {
    2940
}

fn default_htcondor_cpu_time() -> u64 {
    2881
}

fn default_multicore_processors() -> u32 {
    8
}

fn default_os() -> String {
    "EL7".to_string()
}

fn default_vo_keys() -> BTreeSet<String> {
    BTreeSet::from(["GridPP".to_string()])
}

fn default_vac_cpu_time() -> BTreeMap<String, u64> {
    BTreeMap::from([("VAC".to_string(), 400_000), ("CLOUD".to_string(), 24_000_000)])
}

fn default_vac_os() -> String {
    "EL6".to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SyncConfig {
        SyncConfig {
            vos: vec!["gridpp".into()],
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_json_defaults_fill_missing_fields() {
        let config = SyncConfig::from_json_str(r#"{"vos": ["lhcb"], "domain": "EGI"}"#).unwrap();
        assert_eq!(config.domain, "EGI");
        assert_eq!(config.country_default, "xx");
        assert_eq!(config.retention_threshold_days, 5);
        assert_eq!(config.job_limits.limits(10), (30, 10));
        assert_eq!(config.cpu_time.broken_default, 2880);
        assert!(config.process_ces && !config.process_vac);
    }

    #[test]
    fn test_unknown_slots_use_default() {
        assert_eq!(JobLimitPolicy::default().limits(0), (2222, 2222));
    }

    #[test]
    fn test_validate_rejects_bad_country_default() {
        let config = SyncConfig {
            country_default: "xyz".into(),
            ..base()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_requires_vos_for_ce_discovery() {
        assert!(SyncConfig::default().validate().is_err());
        let config = SyncConfig {
            process_ces: false,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: BTreeMap<&str, &str> = BTreeMap::from([
            ("GRIDSYNC_DOMAIN", "EGI"),
            ("GRIDSYNC_RETENTION_DAYS", "9"),
            ("GRIDSYNC_BANNED_CES", "a.example.org, b.example.org,"),
            ("GRIDSYNC_REMOVE_STALE", "off"),
            ("GRIDSYNC_MAX_PROCESSORS", "16"),
        ]);
        let mut config = base();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.domain, "EGI");
        assert_eq!(config.retention_threshold_days, 9);
        assert_eq!(config.banned_ces.len(), 2);
        assert!(config.is_banned_ce("b.example.org"));
        assert!(!config.remove_stale);
        assert_eq!(config.max_processors_override, Some(16));
    }

    #[test]
    fn test_env_override_rejects_garbage_number() {
        let mut config = base();
        let result = config.apply_overrides(|k| {
            (k == "GRIDSYNC_RETENTION_DAYS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_cpu_time_override_picks_longest_suffix() {
        let policy = CpuTimePolicy {
            host_overrides: BTreeMap::from([
                ("rl.ac.uk".to_string(), 100),
                ("pp.rl.ac.uk".to_string(), 4320),
            ]),
            ..CpuTimePolicy::default()
        };
        assert_eq!(policy.override_for("heplnx.pp.rl.ac.uk"), Some(4320));
        assert_eq!(policy.override_for("lcgce.gridpp.rl.ac.uk"), Some(100));
        assert_eq!(policy.override_for("ce.bris.ac.uk"), None);
    }

    #[test]
    fn test_extra_options_merge() {
        let config = SyncConfig {
            ce_extra_options: vec![CeOptionOverride {
                host_suffix: ".ca".into(),
                options: BTreeMap::from([(
                    "XRSLExtraString".to_string(),
                    "(wallTime=\"1440\")".to_string(),
                )]),
            }],
            ..base()
        };
        assert_eq!(config.extra_options_for("ce.triumf.ca").len(), 1);
        assert!(config.extra_options_for("ce.x.ac.uk").is_empty());
    }

    #[test]
    fn test_suffix_match_respects_label_boundary() {
        assert!(host_matches_suffix("jet.efda.org", "efda.org"));
        assert!(host_matches_suffix("efda.org", "efda.org"));
        assert!(host_matches_suffix("CE.Lab.GOV", ".gov"));
        assert!(!host_matches_suffix("notefda.org", "efda.org"));
        assert!(!host_matches_suffix("ce.x.ac.uk", ""));

        let policy = CpuTimePolicy {
            host_overrides: BTreeMap::from([("rl.ac.uk".to_string(), 100)]),
            ..CpuTimePolicy::default()
        };
        assert_eq!(policy.override_for("ce.carl.ac.uk"), None);
    }
}
