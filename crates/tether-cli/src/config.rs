//! Configuration file management for tether.
//!
//! Provides a TOML-based config file at `~/.config/tether/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use tether_core::data_root::{self, Partition, RuntimeMode};
use tether_core::launcher::{LauncherConfig, ReadinessPatterns};
use tether_core::layout::DataLayout;

pub const DEFAULT_KEYSTORE_BINARY: &str = "lair-keystore";
pub const DEFAULT_RUNTIME_BINARY: &str = "holochain";
pub const DEFAULT_RUNTIME_VERSION: &str = "0.2.3";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_PORT: u16 = 8710;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub profile: Option<String>,
    pub binaries: BinariesSection,
    pub runtime: RuntimeSection,
    pub readiness: ReadinessSection,
    pub server: ServerSection,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinariesSection {
    pub keystore: Option<PathBuf>,
    pub runtime: Option<PathBuf>,
    /// App bundle installed when an install request names no file.
    pub default_app_bundle: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSection {
    pub mode: Option<RuntimeMode>,
    pub partition: Option<Partition>,
}

/// Regex overrides for child output.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSection {
    pub keystore: Option<String>,
    pub runtime: Option<String>,
    pub port_in_use: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tether config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Root of all profiles: the platform data dir, or `~/.local/share`.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the default config file. A missing file is an empty config.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    load_config_from(&path)
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Starter config written by `tether init`.
pub fn starter_config(keystore: Option<PathBuf>, runtime: Option<PathBuf>) -> ConfigFile {
    ConfigFile {
        profile: Some(DEFAULT_PROFILE.to_string()),
        binaries: BinariesSection {
            keystore: Some(keystore.unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE_BINARY))),
            runtime: Some(runtime.unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BINARY))),
            default_app_bundle: None,
        },
        runtime: RuntimeSection {
            mode: Some(RuntimeMode::BuiltIn {
                version: DEFAULT_RUNTIME_VERSION.to_string(),
            }),
            partition: Some(Partition::Default),
        },
        readiness: ReadinessSection::default(),
        server: ServerSection {
            bind: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: Some(DEFAULT_PORT),
        },
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub profile: Option<String>,
    pub partition: Option<String>,
    pub keystore_binary: Option<PathBuf>,
    pub runtime_binary: Option<PathBuf>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct TetherConfig {
    pub profile: String,
    pub keystore_binary: PathBuf,
    pub runtime_binary: PathBuf,
    pub default_app_bundle: Option<PathBuf>,
    pub mode: RuntimeMode,
    pub partition: Partition,
    pub readiness: ReadinessPatterns,
    pub listen: SocketAddr,
    pub profile_root: PathBuf,
}

impl TetherConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config()?;
        Self::resolve_with(cli, &file, |key| std::env::var(key).ok(), &data_dir())
    }

    /// Resolution against an explicit file, environment and data dir.
    pub fn resolve_with(
        cli: &CliOverrides,
        file: &ConfigFile,
        env: impl Fn(&str) -> Option<String>,
        data_dir: &Path,
    ) -> Result<Self> {
        let profile = cli
            .profile
            .clone()
            .or_else(|| env("TETHER_PROFILE"))
            .or_else(|| file.profile.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        data_root::validate_name("profile", &profile)?;

        let keystore_binary = cli
            .keystore_binary
            .clone()
            .or_else(|| env("TETHER_KEYSTORE_BIN").map(PathBuf::from))
            .or_else(|| file.binaries.keystore.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE_BINARY));

        let runtime_binary = cli
            .runtime_binary
            .clone()
            .or_else(|| env("TETHER_RUNTIME_BIN").map(PathBuf::from))
            .or_else(|| file.binaries.runtime.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BINARY));

        let default_app_bundle = env("TETHER_DEFAULT_APP_BUNDLE")
            .map(PathBuf::from)
            .or_else(|| file.binaries.default_app_bundle.clone());

        let mode = file.runtime.mode.clone().unwrap_or_else(|| RuntimeMode::BuiltIn {
            version: DEFAULT_RUNTIME_VERSION.to_string(),
        });
        data_root::validate_mode(&mode)?;

        let partition = match cli.partition.clone().or_else(|| env("TETHER_PARTITION")) {
            Some(name) if name == data_root::DEFAULT_PARTITION => Partition::Default,
            Some(name) => Partition::Custom { name },
            None => file.runtime.partition.clone().unwrap_or_default(),
        };
        data_root::validate_partition(&partition)?;

        let port = match cli.port {
            Some(port) => port,
            None => match env("TETHER_PORT") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("TETHER_PORT is not a port number: {raw}"))?,
                None => file.server.port.unwrap_or(DEFAULT_PORT),
            },
        };
        let bind = match cli.bind {
            Some(bind) => bind,
            None => match env("TETHER_BIND") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("TETHER_BIND is not an IP address: {raw}"))?,
                None => file
                    .server
                    .bind
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            },
        };

        let defaults = ReadinessPatterns::default();
        let readiness = ReadinessPatterns {
            keystore: file.readiness.keystore.clone().unwrap_or(defaults.keystore),
            runtime: file.readiness.runtime.clone().unwrap_or(defaults.runtime),
            port_in_use: file
                .readiness
                .port_in_use
                .clone()
                .unwrap_or(defaults.port_in_use),
        };
        for (name, pattern) in [
            ("keystore", &readiness.keystore),
            ("runtime", &readiness.runtime),
            ("port_in_use", &readiness.port_in_use),
        ] {
            if let Err(e) = regex::Regex::new(pattern) {
                bail!("invalid readiness.{name} pattern: {e}");
            }
        }

        Ok(Self {
            profile_root: data_dir.join(&profile),
            profile,
            keystore_binary,
            runtime_binary,
            default_app_bundle,
            mode,
            partition,
            readiness,
            listen: SocketAddr::new(bind, port),
        })
    }

    /// Where the launcher and child output is written.
    pub fn logs_dir(&self) -> PathBuf {
        DataLayout::new(&self.profile_root).logs_dir()
    }

    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            layout: DataLayout::new(&self.profile_root),
            keystore_binary: self.keystore_binary.clone(),
            runtime_binary: self.runtime_binary.clone(),
            default_app_bundle: self.default_app_bundle.clone(),
            mode: self.mode.clone(),
            partition: self.partition.clone(),
            readiness: self.readiness.clone(),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
