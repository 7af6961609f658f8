//! Launch strategy for the keystore daemon.

use std::path::{Path, PathBuf};

use tracing::info;

use super::{LaunchSpec, OutputPatterns, ProcessRole, ReadinessMatcher, Supervisor};
use crate::error::{LauncherError, LauncherResult};
use crate::events::EventBus;
use crate::secret::Secret;

/// Line the keystore prints once its socket is listening.
pub const DEFAULT_READY_PATTERN: &str =
    r"#\s*lair-keystore connection_url\s*#\s*(?P<endpoint>\S+)\s*#";

/// Where and how to run the keystore binary.
#[derive(Debug, Clone)]
pub struct KeystoreConfig {
    pub binary: PathBuf,
    pub keystore_dir: PathBuf,
    pub ready_pattern: String,
}

impl KeystoreConfig {
    pub fn new(binary: impl Into<PathBuf>, keystore_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            keystore_dir: keystore_dir.into(),
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
        }
    }

    fn patterns(&self) -> LauncherResult<OutputPatterns> {
        let ready = ReadinessMatcher::new(&self.ready_pattern).map_err(|e| {
            LauncherError::Validation(format!("invalid keystore ready pattern: {e}"))
        })?;
        Ok(OutputPatterns::new(ready))
    }

    fn spec(&self, subcommand: &str) -> LauncherResult<LaunchSpec> {
        Ok(LaunchSpec::new(ProcessRole::Keystore, &self.binary, self.patterns()?)
            .args(root_args(&self.keystore_dir))
            .args([subcommand, "--piped"]))
    }
}

fn root_args(dir: &Path) -> [std::ffi::OsString; 2] {
    ["--lair-root".into(), dir.as_os_str().to_owned()]
}

/// Create a fresh keystore in `config.keystore_dir`, sealed with `secret`.
pub async fn initialize_keystore(
    config: &KeystoreConfig,
    secret: &Secret,
    bus: &EventBus,
) -> LauncherResult<()> {
    std::fs::create_dir_all(&config.keystore_dir)?;
    info!(dir = %config.keystore_dir.display(), "initializing keystore");
    Supervisor::initialize(&config.spec("init")?, secret, bus).await
}

/// Start the keystore server and wait for its connection URL.
pub async fn launch_keystore(
    config: &KeystoreConfig,
    secret: &Secret,
    bus: &EventBus,
) -> LauncherResult<(Supervisor, String)> {
    info!(dir = %config.keystore_dir.display(), "starting keystore");
    Supervisor::launch(&config.spec("server")?, secret, bus).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_spec_passes_root_and_piped_flags() {
        let config = KeystoreConfig::new("/bin/lair", "/data/keystore");
        let spec = config.spec("server").unwrap();
        let args: Vec<_> = spec.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["--lair-root", "/data/keystore", "server", "--piped"]);
        assert_eq!(spec.role, ProcessRole::Keystore);
        assert!(spec.port.is_none());
    }

    #[test]
    fn default_pattern_extracts_socket_url() {
        let config = KeystoreConfig::new("/bin/lair", "/data/keystore");
        let patterns = config.patterns().unwrap();
        let ready = patterns
            .ready
            .check("# lair-keystore connection_url # unix:///data/keystore/socket?k=Zm9v #")
            .unwrap();
        assert_eq!(
            ready.endpoint.as_deref(),
            Some("unix:///data/keystore/socket?k=Zm9v")
        );
    }

    #[test]
    fn bad_override_is_a_validation_error() {
        let mut config = KeystoreConfig::new("/bin/lair", "/data/keystore");
        config.ready_pattern = "(".to_string();
        assert!(matches!(config.spec("server"), Err(LauncherError::Validation(_))));
    }
}
