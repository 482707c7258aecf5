//! Canonical resource records shared by normalization, naming and writing.
//!
//! Records are built fresh every run and never mutated after they leave the
//! stage that produced them; later stages derive new values instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// `LastSeen` is stored as a day-first date, e.g. `18/10/2026`.
pub const LAST_SEEN_FORMAT: &str = "%d/%m/%Y";

/// Substituted for absent size/backend attributes.
pub const UNKNOWN: &str = "Unknown";

/// Site roots for resources registered in GOCDB rather than the BDII.
pub const VAC_ROOT: &str = "VAC";
pub const CLOUD_ROOT: &str = "CLOUD";

pub fn format_last_seen(date: NaiveDate) -> String {
    date.format(LAST_SEEN_FORMAT).to_string()
}

/// `None` for an unparsable value; the caller decides how conservative to be.
pub fn parse_last_seen(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), LAST_SEEN_FORMAT).ok()
}

// ---------------------------------------------------------------------------
// 1. CE type
// ---------------------------------------------------------------------------

/// Middleware flavour of a compute element.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CeType {
    Arc,
    HtCondorCe,
    Cream,
    Vac,
    Cloud,
    Other(String),
}

impl CeType {
    /// Map an upstream implementation name. GLUE publishes ARC as `ARC-CE`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "arc-ce" | "arc" | "nordugrid" => CeType::Arc,
            "htcondorce" | "htcondor-ce" => CeType::HtCondorCe,
            "cream" | "cream-ce" => CeType::Cream,
            "vac" => CeType::Vac,
            "cloud" | "vcycle" => CeType::Cloud,
            _ => CeType::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CeType::Arc => "ARC",
            CeType::HtCondorCe => "HTCondorCE",
            CeType::Cream => "CREAM",
            CeType::Vac => "Vac",
            CeType::Cloud => "Cloud",
            CeType::Other(name) => name,
        }
    }

    /// Pilots are submitted directly to ARC and CREAM endpoints.
    pub fn submission_mode(&self) -> Option<&'static str> {
        matches!(self, CeType::Arc | CeType::Cream).then_some("Direct")
    }
}

impl fmt::Display for CeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 2. Queue / ComputeElement
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    /// Only populated from shares in production state.
    pub allowed_vos: BTreeSet<String>,
    pub si00: String,
    pub max_cpu_time: u64,
    pub max_total_jobs: Option<u64>,
    pub max_waiting_jobs: Option<u64>,
    pub number_of_processors: Option<u32>,
    pub tags: BTreeSet<String>,
    pub required_tags: BTreeSet<String>,
    pub local_ce_type: Option<String>,
}

impl Queue {
    pub fn new(name: impl Into<String>, max_cpu_time: u64) -> Self {
        Self {
            name: name.into(),
            max_cpu_time,
            ..Self::default()
        }
    }

    /// Union another partial view of the same queue into this one.
    pub fn merge(&mut self, other: &Queue) {
        self.allowed_vos.extend(other.allowed_vos.iter().cloned());
        self.tags.extend(other.tags.iter().cloned());
        self.required_tags.extend(other.required_tags.iter().cloned());
        fill_string(&mut self.si00, &other.si00);
        if self.max_cpu_time == 0 {
            self.max_cpu_time = other.max_cpu_time;
        }
        self.max_total_jobs = self.max_total_jobs.or(other.max_total_jobs);
        self.max_waiting_jobs = self.max_waiting_jobs.or(other.max_waiting_jobs);
        self.number_of_processors = self.number_of_processors.or(other.number_of_processors);
        if self.local_ce_type.is_none() {
            self.local_ce_type = other.local_ce_type.clone();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeElement {
    pub host: String,
    pub ce_type: CeType,
    pub queues: BTreeMap<String, Queue>,
    pub architecture: String,
    pub si00: String,
    pub host_ram: String,
    pub os: String,
    /// Omitted when the CE only offers single-core slots.
    pub max_processors: Option<u32>,
    pub submission_mode: Option<String>,
    pub job_list_file: Option<String>,
    /// Free-form options from per-host configuration, e.g. `XRSLExtraString`.
    pub extra_options: BTreeMap<String, String>,
    pub last_seen: NaiveDate,
}

impl ComputeElement {
    pub fn new(host: impl Into<String>, ce_type: CeType, last_seen: NaiveDate) -> Self {
        let host = host.into();
        let submission_mode = ce_type.submission_mode().map(str::to_string);
        let job_list_file = (ce_type == CeType::Arc).then(|| format!("{host}-jobs.xml"));
        Self {
            host,
            ce_type,
            queues: BTreeMap::new(),
            architecture: String::new(),
            si00: String::new(),
            host_ram: String::new(),
            os: String::new(),
            max_processors: None,
            submission_mode,
            job_list_file,
            extra_options: BTreeMap::new(),
            last_seen,
        }
    }

    pub fn add_queue(&mut self, queue: Queue) {
        match self.queues.get_mut(&queue.name) {
            Some(existing) => existing.merge(&queue),
            None => {
                self.queues.insert(queue.name.clone(), queue);
            }
        }
    }

    pub fn merge(&mut self, other: &ComputeElement) {
        for queue in other.queues.values() {
            self.add_queue(queue.clone());
        }
        fill_string(&mut self.architecture, &other.architecture);
        fill_string(&mut self.si00, &other.si00);
        fill_string(&mut self.host_ram, &other.host_ram);
        fill_string(&mut self.os, &other.os);
        self.max_processors = self.max_processors.or(other.max_processors);
        if self.submission_mode.is_none() {
            self.submission_mode = other.submission_mode.clone();
        }
        if self.job_list_file.is_none() {
            self.job_list_file = other.job_list_file.clone();
        }
        for (key, value) in &other.extra_options {
            self.extra_options
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.last_seen = self.last_seen.max(other.last_seen);
    }

    /// Every VO allowed on at least one queue.
    pub fn allowed_vos(&self) -> BTreeSet<String> {
        self.queues
            .values()
            .flat_map(|q| q.allowed_vos.iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// 3. Sites
// ---------------------------------------------------------------------------

/// A site as seen by one upstream query, before naming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteRecord {
    /// Upstream identifier, e.g. `UKI-LT2-IC-HEP`.
    pub site_id: String,
    /// CS root the site lives under (`LCG`, `VAC`, `CLOUD`).
    pub root: String,
    pub display_name: String,
    pub description: String,
    pub coordinates: String,
    pub contact_mail: String,
    pub compute_elements: BTreeMap<String, ComputeElement>,
    pub storage_elements: BTreeSet<String>,
    /// Which query produced the record, e.g. `glue1:lhcb`. Drives merge order.
    pub source: String,
}

impl SiteRecord {
    pub fn new(
        site_id: impl Into<String>,
        root: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            root: root.into(),
            display_name: String::new(),
            description: String::new(),
            coordinates: String::new(),
            contact_mail: String::new(),
            compute_elements: BTreeMap::new(),
            storage_elements: BTreeSet::new(),
            source: source.into(),
        }
    }

    pub fn add_ce(&mut self, ce: ComputeElement) {
        match self.compute_elements.get_mut(&ce.host) {
            Some(existing) => existing.merge(&ce),
            None => {
                self.compute_elements.insert(ce.host.clone(), ce);
            }
        }
    }
}

/// A site with its resolved canonical name, e.g. `LCG.UKI-LT2-IC-HEP.uk`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Site {
    pub canonical_name: String,
    pub record: SiteRecord,
}

// ---------------------------------------------------------------------------
// 4. Storage
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Latency {
    Disk,
    Tape,
}

impl Latency {
    /// GLUE `GlueSAAccessLatency`: `online` is disk, `nearline` tape,
    /// anything else disk.
    pub fn from_glue(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearline" => Latency::Tape,
            _ => Latency::Disk,
        }
    }

    /// Latency encoded in an SE name's final `-disk`/`-tape` component.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.rsplit_once('-').map(|(_, s)| s) {
            Some("disk") => Some(Latency::Disk),
            Some("tape") => Some(Latency::Tape),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Latency::Disk => "disk",
            Latency::Tape => "tape",
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Protocol {
    Srm,
    Root,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Srm => "srm",
            Protocol::Root => "root",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "srm" => Some(Protocol::Srm),
            "root" | "xroot" => Some(Protocol::Root),
            _ => None,
        }
    }

    pub fn plugin_name(self) -> &'static str {
        match self {
            Protocol::Srm => "GFAL2_SRM2",
            Protocol::Root => "GFAL2_XROOT",
        }
    }
}

/// SRM service endpoint published for an SE host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SrmEndpoint {
    pub port: Option<u16>,
    pub version: String,
}

/// A storage element as normalized from upstream, one per (host, latency).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeRecord {
    pub site_id: String,
    pub host: String,
    pub latency: Latency,
    pub backend_type: String,
    pub description: String,
    pub total_size: String,
    pub allowed_vos: BTreeSet<String>,
    /// VO -> every `GlueVOInfoPath` published for it.
    pub vo_paths: BTreeMap<String, BTreeSet<String>>,
    pub srm: Option<SrmEndpoint>,
    pub xrootd_ports: BTreeSet<u16>,
}

pub const XROOTD_DEFAULT_PORT: u16 = 1094;

impl SeRecord {
    pub fn new(site_id: impl Into<String>, host: impl Into<String>, latency: Latency) -> Self {
        Self {
            site_id: site_id.into(),
            host: host.into(),
            latency,
            backend_type: UNKNOWN.to_string(),
            description: String::new(),
            total_size: UNKNOWN.to_string(),
            allowed_vos: BTreeSet::new(),
            vo_paths: BTreeMap::new(),
            srm: None,
            xrootd_ports: BTreeSet::new(),
        }
    }

    /// Per VO, the shortest published path that is not all upper case.
    pub fn chosen_vo_paths(&self) -> BTreeMap<String, String> {
        self.vo_paths
            .iter()
            .filter_map(|(vo, paths)| {
                paths
                    .iter()
                    .filter(|p| !is_upper(p))
                    .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
                    .map(|p| (vo.clone(), p.clone()))
            })
            .collect()
    }

    /// Deepest directory shared by every published VO path.
    pub fn common_path(&self) -> String {
        common_directory(self.vo_paths.values().flatten().map(String::as_str))
    }

    /// Build one access protocol, or explain why it cannot be built.
    pub fn access_protocol(&self, protocol: Protocol, index: u32) -> ProtocolOutcome {
        if self.vo_paths.is_empty() {
            return ProtocolOutcome::Skipped(format!(
                "{} on {}: no VO paths published",
                protocol.as_str(),
                self.host
            ));
        }
        let (port, ws_url) = match protocol {
            Protocol::Srm => {
                let Some(srm) = &self.srm else {
                    return ProtocolOutcome::Skipped(format!(
                        "srm on {}: no SRM service",
                        self.host
                    ));
                };
                if !srm.version.trim().starts_with('2') {
                    return ProtocolOutcome::Skipped(format!(
                        "srm on {}: unsupported version {:?}",
                        self.host, srm.version
                    ));
                }
                let Some(port) = srm.port else {
                    return ProtocolOutcome::Skipped(format!(
                        "srm on {}: endpoint has no port",
                        self.host
                    ));
                };
                (port, "/srm/managerv2?SFN=".to_string())
            }
            Protocol::Root => {
                let port = if self.xrootd_ports.contains(&XROOTD_DEFAULT_PORT) {
                    XROOTD_DEFAULT_PORT
                } else {
                    match self.xrootd_ports.iter().next() {
                        Some(port) => *port,
                        None => {
                            return ProtocolOutcome::Skipped(format!(
                                "root on {}: no XRootD ports published",
                                self.host
                            ))
                        }
                    }
                };
                (port, String::new())
            }
        };
        ProtocolOutcome::Included(AccessProtocol {
            index,
            protocol,
            host: self.host.clone(),
            port,
            path: self.common_path(),
            vo_path: self.chosen_vo_paths(),
            space_token: String::new(),
            ws_url,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessProtocol {
    /// 1-based, stable per (SE, protocol) across runs.
    pub index: u32,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub vo_path: BTreeMap<String, String>,
    pub space_token: String,
    pub ws_url: String,
}

/// Outcome of building an access protocol. Missing fields skip the protocol,
/// never the SE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolOutcome {
    Included(AccessProtocol),
    Skipped(String),
}

/// A named storage element ready to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageElement {
    pub name: String,
    pub record: SeRecord,
    pub access_protocols: Vec<AccessProtocol>,
    pub last_seen: NaiveDate,
}

// ---------------------------------------------------------------------------
// 5. Registry hosts and skip reporting
// ---------------------------------------------------------------------------

/// A pilot host certificate registered under `/Registry/Hosts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryHost {
    pub cn: String,
    pub dn: String,
    pub properties: BTreeSet<String>,
    pub last_seen: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Site,
    ComputeElement,
    Queue,
    StorageElement,
    AccessProtocol,
    Host,
}

/// A resource left out of this run, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedResource {
    pub kind: ResourceKind,
    pub id: String,
    pub reason: String,
}

impl SkippedResource {
    pub fn new(kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fill_string(target: &mut String, candidate: &str) {
    if target.is_empty() && !candidate.is_empty() {
        *target = candidate.to_string();
    }
}

fn is_upper(path: &str) -> bool {
    path.chars().any(char::is_alphabetic) && !path.chars().any(char::is_lowercase)
}

/// Longest common directory of a set of paths. `""` for no paths.
pub fn common_directory<'a, I>(paths: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut common: Option<Vec<&str>> = None;
    for path in paths {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        common = Some(match common {
            None => parts,
            Some(prev) => prev
                .iter()
                .zip(parts.iter())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| *a)
                .collect(),
        });
    }
    match common {
        None => String::new(),
        Some(parts) => format!("/{}", parts.join("/")),
    }
}
