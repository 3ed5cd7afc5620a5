//! Launch options and the AM container environment
//!
//! The AM is launched by the client CLI, not a human; option names are
//! part of that contract. The environment variables are set by the
//! resource manager when it starts the AM container.

use std::path::PathBuf;

use clap::Parser;

use crate::error::AmError;

/// Command-line options for the application master.
#[derive(Debug, Clone, Parser)]
#[command(name = "hoist-am")]
#[command(about = "Application master for an HBase-style cluster")]
#[command(version)]
pub struct LaunchOptions {
    /// Desired number of region-server workers
    #[arg(long = "workers", default_value_t = 0)]
    pub workers: u32,

    /// Desired number of masters (0 or 1)
    #[arg(long = "masters", default_value_t = 1)]
    pub masters: u32,

    /// Worker heap size in MB
    #[arg(long = "workerHeap", default_value_t = 256)]
    pub worker_heap: u32,

    /// Master heap size in MB
    #[arg(long = "masterHeap", default_value_t = 256)]
    pub master_heap: u32,

    /// Directory holding the staged site configuration
    #[arg(long = "generatedConfDir")]
    pub generated_conf_dir: PathBuf,

    /// Installation root of the backing service
    #[arg(long = "backingHome")]
    pub backing_home: PathBuf,

    /// Resource-manager address as host:port
    #[arg(long = "rmAddress")]
    pub rm_address: String,

    /// Test hook: replaces the master command line
    #[arg(long = "xHBaseMasterCommand")]
    pub x_master_command: Option<String>,

    /// Test mode: complete the AM right after startup
    #[arg(long = "xTest")]
    pub x_test: bool,

    /// Cluster name published in the status document
    #[arg(long, default_value = "hoist")]
    pub name: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl LaunchOptions {
    /// Reject argument combinations the AM cannot run with.
    pub fn validate(&self) -> Result<(), AmError> {
        if self.masters > 1 {
            return Err(AmError::BadArguments(format!(
                "at most one master is supported, got {}",
                self.masters
            )));
        }
        if self.rm_address.is_empty() {
            return Err(AmError::BadArguments("rmAddress must not be empty".into()));
        }
        Ok(())
    }
}

/// Environment the resource manager sets in the AM's own container.
#[derive(Debug, Clone)]
pub struct AmEnvironment {
    /// The AM's own container id.
    pub container_id: String,
    /// Host of the node manager the AM runs under.
    pub nm_host: String,
    pub nm_port: u16,
    pub nm_http_port: u16,
    pub user: String,
    /// Log directory; defaults to `/tmp/hoist-<user>` when unset.
    pub log_dir: PathBuf,
}

impl AmEnvironment {
    /// Read the contract variables from the process environment.
    pub fn from_env() -> Result<Self, AmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable
    /// lookup, so tests never touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                AmError::BadConfig(format!("environment variable {key} is not set"))
            })
        };
        let port = |key: &str| -> Result<u16, AmError> {
            required(key)?
                .parse()
                .map_err(|_| AmError::BadConfig(format!("{key} is not a valid port")))
        };

        let user = required("USER")?;
        let log_dir = lookup("LOGDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/hoist-{user}")));

        Ok(Self {
            container_id: required("CONTAINER_ID")?,
            nm_host: required("NM_HOST")?,
            nm_port: port("NM_PORT")?,
            nm_http_port: port("NM_HTTP_PORT")?,
            user,
            log_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("CONTAINER_ID", "container_01_000001"),
            ("NM_HOST", "node-7"),
            ("NM_PORT", "8041"),
            ("NM_HTTP_PORT", "8042"),
            ("USER", "hoist"),
        ])
    }

    fn lookup<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_environment_defaults_log_dir() {
        let env = AmEnvironment::from_lookup(lookup(&base_env())).unwrap();
        assert_eq!(env.nm_host, "node-7");
        assert_eq!(env.nm_port, 8041);
        assert_eq!(env.log_dir, PathBuf::from("/tmp/hoist-hoist"));
    }

    #[test]
    fn test_environment_missing_required_var() {
        let mut map = base_env();
        map.remove("CONTAINER_ID");
        let err = AmEnvironment::from_lookup(lookup(&map)).unwrap_err();
        assert!(matches!(err, AmError::BadConfig(_)));
        assert!(err.to_string().contains("CONTAINER_ID"));
    }

    #[test]
    fn test_environment_explicit_log_dir() {
        let mut map = base_env();
        map.insert("LOGDIR", "/var/log/am");
        let env = AmEnvironment::from_lookup(lookup(&map)).unwrap();
        assert_eq!(env.log_dir, PathBuf::from("/var/log/am"));
    }

    #[test]
    fn test_options_validation() {
        let opts = LaunchOptions::parse_from([
            "hoist-am",
            "--workers",
            "2",
            "--masters",
            "1",
            "--generatedConfDir",
            "/tmp/conf",
            "--backingHome",
            "/opt/hbase",
            "--rmAddress",
            "rm:8030",
        ]);
        assert!(opts.validate().is_ok());
        assert_eq!(opts.workers, 2);
        assert_eq!(opts.worker_heap, 256);

        let opts = LaunchOptions::parse_from([
            "hoist-am",
            "--masters",
            "2",
            "--generatedConfDir",
            "/tmp/conf",
            "--backingHome",
            "/opt/hbase",
            "--rmAddress",
            "rm:8030",
        ]);
        assert!(matches!(opts.validate(), Err(AmError::BadArguments(_))));
    }
}
