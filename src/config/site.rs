//! Backing-service site configuration
//!
//! The client CLI stages a Hadoop-style keyed XML file next to the AM;
//! this module loads it, keeps every property for the status document
//! and derives the fields the AM itself needs (filesystem root and the
//! ZooKeeper ensemble the cluster coordinates through).

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::error::AmError;

/// File name of the staged site configuration.
pub const SITE_FILE_NAME: &str = "backing-site.xml";

const KEY_ROOT_DIR: &str = "hbase.rootdir";
const KEY_ZK_QUORUM: &str = "hbase.zookeeper.quorum";
const KEY_ZK_PORT: &str = "hbase.zookeeper.property.clientPort";
const KEY_ZK_PATH: &str = "zookeeper.znode.parent";

const DEFAULT_ZK_PATH: &str = "/hbase";

#[derive(Debug, Deserialize)]
struct SiteFile {
    #[serde(rename = "property", default)]
    properties: Vec<SiteProperty>,
}

#[derive(Debug, Deserialize)]
struct SiteProperty {
    name: String,
    #[serde(default)]
    value: String,
}

/// Parsed site configuration plus the derived fields.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Every property, in file order.
    pub properties: IndexMap<String, String>,
    pub root_path: String,
    pub zk_hosts: String,
    pub zk_port: u16,
    pub zk_path: String,
}

impl SiteConfig {
    /// Load `backing-site.xml` from the staged configuration directory.
    ///
    /// Fails with `BadConfig` when the directory or file is missing,
    /// the XML does not parse, or the ZooKeeper client port is absent
    /// or zero — a cluster without a reachable ensemble cannot come up.
    pub fn load(conf_dir: &Path) -> Result<Self, AmError> {
        if !conf_dir.is_dir() {
            return Err(AmError::BadConfig(format!(
                "configuration directory {} does not exist",
                conf_dir.display()
            )));
        }

        let site_path = conf_dir.join(SITE_FILE_NAME);
        let content = std::fs::read_to_string(&site_path).map_err(|e| {
            AmError::BadConfig(format!("cannot read {}: {e}", site_path.display()))
        })?;

        Self::parse(&content)
            .map_err(|e| AmError::BadConfig(format!("{}: {e}", site_path.display())))
    }

    /// Parse the site file body and derive the AM fields.
    pub fn parse(content: &str) -> Result<Self, AmError> {
        let file: SiteFile = quick_xml::de::from_str(content)
            .map_err(|e| AmError::BadConfig(format!("malformed site file: {e}")))?;

        let mut properties = IndexMap::new();
        for prop in file.properties {
            properties.insert(prop.name, prop.value);
        }
        debug!(count = properties.len(), "loaded site properties");

        let get = |key: &str| properties.get(key).cloned().unwrap_or_default();

        let zk_port: u16 = properties
            .get(KEY_ZK_PORT)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| AmError::BadConfig(format!("{KEY_ZK_PORT} is not a port: {v}")))
            })
            .transpose()?
            .unwrap_or(0);
        if zk_port == 0 {
            return Err(AmError::BadConfig(format!(
                "{KEY_ZK_PORT} is missing or zero; the cluster has no ZooKeeper ensemble"
            )));
        }

        let zk_path = match properties.get(KEY_ZK_PATH) {
            Some(p) if !p.is_empty() => p.clone(),
            _ => DEFAULT_ZK_PATH.to_string(),
        };

        Ok(Self {
            root_path: get(KEY_ROOT_DIR),
            zk_hosts: get(KEY_ZK_QUORUM),
            zk_port,
            zk_path,
            properties,
        })
    }
}
