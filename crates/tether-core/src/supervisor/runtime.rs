//! Launch strategy for the peer-to-peer runtime ("conductor").
//!
//! A managed runtime gets a freshly written conductor configuration that
//! points at the data root's directory, the running keystore and the admin
//! port chosen by the caller. The binary is then started with `-p` (secret
//! on stdin) and `-c <config>`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use super::{LaunchSpec, OutputPatterns, ProcessRole, ReadinessMatcher, Supervisor};
use crate::error::{LauncherError, LauncherResult};
use crate::events::EventBus;
use crate::secret::Secret;

pub const DEFAULT_READY_PATTERN: &str = r"(?i)conductor ready";

/// Output meaning the admin port was taken between selection and bind.
pub const DEFAULT_PORT_IN_USE_PATTERN: &str =
    r"(?i)address already in use|addrinuse|os error (98|48|10048)";

#[derive(Debug, Serialize)]
struct ConductorConfig<'a> {
    data_root_path: &'a Path,
    keystore: KeystoreSection<'a>,
    admin_interfaces: Vec<AdminInterface>,
}

#[derive(Debug, Serialize)]
struct KeystoreSection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    connection_url: &'a str,
}

#[derive(Debug, Serialize)]
struct AdminInterface {
    driver: Driver,
}

#[derive(Debug, Serialize)]
struct Driver {
    #[serde(rename = "type")]
    kind: &'static str,
    port: u16,
}

/// Write the conductor configuration for one data root.
pub fn write_conductor_config(
    config_path: &Path,
    data_dir: &Path,
    keystore_url: &str,
    admin_port: u16,
) -> LauncherResult<()> {
    let config = ConductorConfig {
        data_root_path: data_dir,
        keystore: KeystoreSection {
            kind: "lair_server",
            connection_url: keystore_url,
        },
        admin_interfaces: vec![AdminInterface {
            driver: Driver {
                kind: "websocket",
                port: admin_port,
            },
        }],
    };
    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| LauncherError::Validation(format!("conductor config: {e}")))?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(config_path, yaml)?;
    Ok(())
}

/// Everything needed to start one managed runtime.
#[derive(Debug, Clone)]
pub struct RuntimeLaunch {
    pub binary: PathBuf,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub keystore_url: String,
    pub admin_port: u16,
    pub ready_pattern: String,
    pub port_in_use_pattern: String,
}

impl RuntimeLaunch {
    fn spec(&self) -> LauncherResult<LaunchSpec> {
        let ready = ReadinessMatcher::new(&self.ready_pattern).map_err(|e| {
            LauncherError::Validation(format!("invalid runtime ready pattern: {e}"))
        })?;
        let patterns = OutputPatterns::new(ready)
            .with_port_in_use(&self.port_in_use_pattern)
            .map_err(|e| LauncherError::Validation(format!("invalid port-in-use pattern: {e}")))?;

        let mut spec = LaunchSpec::new(ProcessRole::Runtime, &self.binary, patterns)
            .arg("-p")
            .arg("-c")
            .arg(&self.config_path);
        spec.port = Some(self.admin_port);
        spec.fallback_endpoint = Some(format!("ws://127.0.0.1:{}", self.admin_port));
        Ok(spec)
    }
}

/// Write the conductor config and start the runtime.
///
/// Resolves with the admin endpoint once the runtime reports it is ready.
pub async fn launch_runtime(
    launch: &RuntimeLaunch,
    secret: &Secret,
    bus: &EventBus,
) -> LauncherResult<(Supervisor, String)> {
    let spec = launch.spec()?;
    write_conductor_config(
        &launch.config_path,
        &launch.data_dir,
        &launch.keystore_url,
        launch.admin_port,
    )?;
    info!(
        port = launch.admin_port,
        config = %launch.config_path.display(),
        "starting runtime"
    );
    Supervisor::launch(&spec, secret, bus).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_in(dir: &Path) -> RuntimeLaunch {
        RuntimeLaunch {
            binary: PathBuf::from("/bin/conductor"),
            config_path: dir.join("conductor-config.yaml"),
            data_dir: dir.join("databases"),
            keystore_url: "unix:///ks/socket?k=abc".to_string(),
            admin_port: 4321,
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            port_in_use_pattern: DEFAULT_PORT_IN_USE_PATTERN.to_string(),
        }
    }

    #[test]
    fn conductor_config_names_dir_keystore_and_port() {
        let tmp = tempfile::tempdir().unwrap();
        let launch = launch_in(tmp.path());
        write_conductor_config(
            &launch.config_path,
            &launch.data_dir,
            &launch.keystore_url,
            launch.admin_port,
        )
        .unwrap();

        let written = std::fs::read_to_string(&launch.config_path).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        assert_eq!(
            parsed["keystore"]["connection_url"].as_str(),
            Some("unix:///ks/socket?k=abc")
        );
        assert_eq!(parsed["keystore"]["type"].as_str(), Some("lair_server"));
        assert_eq!(
            parsed["admin_interfaces"][0]["driver"]["port"].as_u64(),
            Some(4321)
        );
        assert!(launch.data_dir.is_dir());
    }

    #[test]
    fn spec_carries_port_and_fallback_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = launch_in(tmp.path()).spec().unwrap();
        assert_eq!(spec.port, Some(4321));
        assert_eq!(spec.fallback_endpoint.as_deref(), Some("ws://127.0.0.1:4321"));
        assert_eq!(spec.args[0], "-p");
        assert!(spec.patterns.is_port_in_use("Error: Os { code: 98, kind: AddrInUse }"));
    }
}
