//! GOCDB service-endpoint records and a static client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::SyncResult;

/// `KEY`/`VALUE` pair attached to a GOCDB service endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceExtension {
    #[serde(rename = "KEY", default)]
    pub key: String,
    #[serde(rename = "VALUE", default)]
    pub value: Option<String>,
}

/// One service endpoint as returned by `get_service_endpoint`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(rename = "SITENAME", default)]
    pub site_name: Option<String>,
    #[serde(rename = "HOSTNAME", default)]
    pub hostname: Option<String>,
    #[serde(rename = "SERVICE_TYPE", default)]
    pub service_type: Option<String>,
    #[serde(rename = "EXTENSIONS", default)]
    pub extensions: Vec<ServiceExtension>,
}

/// GOCDB-style registry collaborator.
pub trait GocdbClient {
    fn get_service_endpoint_info(&self, key: &str, value: &str) -> SyncResult<Vec<ServiceRecord>>;
}

impl<T: GocdbClient + ?Sized> GocdbClient for &T {
    fn get_service_endpoint_info(&self, key: &str, value: &str) -> SyncResult<Vec<ServiceRecord>> {
        (**self).get_service_endpoint_info(key, value)
    }
}

/// Fixed set of service records answering `service_type` lookups.
#[derive(Clone, Debug, Default)]
pub struct StaticGocdb {
    by_type: BTreeMap<String, Vec<ServiceRecord>>,
}

impl StaticGocdb {
    pub fn new(records: Vec<ServiceRecord>) -> Self {
        let mut by_type: BTreeMap<String, Vec<ServiceRecord>> = BTreeMap::new();
        for record in records {
            let key = record.service_type.clone().unwrap_or_default();
            by_type.entry(key).or_default().push(record);
        }
        Self { by_type }
    }

    /// Load a JSON array of service records.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let records: Vec<ServiceRecord> = serde_json::from_str(text)?;
        Ok(Self::new(records))
    }
}

impl GocdbClient for StaticGocdb {
    fn get_service_endpoint_info(&self, key: &str, value: &str) -> SyncResult<Vec<ServiceRecord>> {
        if key != "service_type" {
            return Ok(Vec::new());
        }
        Ok(self.by_type.get(value).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_deserialize_from_gocdb_json() {
        let json = r#"[
            {"SITENAME": "UKI-X", "HOSTNAME": "vac01.x.ac.uk", "SERVICE_TYPE": "uk.ac.gridpp.vac",
             "EXTENSIONS": [{"KEY": "PILOT_SE_GridPP", "VALUE": "UKI-X-disk"}]},
            {"HOSTNAME": "vcycle.y.ac.uk", "SERVICE_TYPE": "uk.ac.gridpp.vcycle"}
        ]"#;
        let gocdb = StaticGocdb::from_json(json).unwrap();
        let vac = gocdb
            .get_service_endpoint_info("service_type", "uk.ac.gridpp.vac")
            .unwrap();
        assert_eq!(vac.len(), 1);
        assert_eq!(vac[0].extensions[0].key, "PILOT_SE_GridPP");
        let cloud = gocdb
            .get_service_endpoint_info("service_type", "uk.ac.gridpp.vcycle")
            .unwrap();
        assert!(cloud[0].site_name.is_none());
    }

    #[test]
    fn test_unknown_key_returns_nothing() {
        let gocdb = StaticGocdb::new(vec![ServiceRecord::default()]);
        assert!(gocdb.get_service_endpoint_info("hostname", "x").unwrap().is_empty());
    }
}
