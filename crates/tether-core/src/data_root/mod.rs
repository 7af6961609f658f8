//! Runtime modes, partitions and the data roots they resolve to.
//!
//! A [`DataRoot`] names one independently addressable runtime instance.
//! [`resolve`] is total over every `(RuntimeMode, Partition)` pair; invalid
//! combinations are rejected earlier by [`validate_mode`] and
//! [`validate_partition`].

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LauncherError, LauncherResult};

/// Name of the built-in default partition.
pub const DEFAULT_PARTITION: &str = "default";

/// Name given to an externally-run runtime when the partition has none.
pub const EXTERNAL_ROOT: &str = "external";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z-]+$").expect("static pattern is valid"));

/// How the runtime for a data root is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum RuntimeMode {
    /// The runtime binary shipped with the launcher.
    BuiltIn { version: String },
    /// A runtime binary at an operator-supplied path.
    CustomPath { path: PathBuf },
    /// A runtime somebody else started; no process is owned locally.
    RunningExternal {
        config_path: PathBuf,
        apps_data_dir: PathBuf,
        admin_port: u16,
    },
}

impl RuntimeMode {
    /// Whether this mode spawns and owns a local runtime process.
    pub fn is_managed(&self) -> bool {
        match self {
            Self::BuiltIn { .. } | Self::CustomPath { .. } => true,
            Self::RunningExternal { .. } => false,
        }
    }
}

/// Configuration-time selector for a data root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Partition {
    #[default]
    Default,
    Custom {
        name: String,
    },
    External {
        name: String,
        path: PathBuf,
    },
}

/// One logical runtime instance. `name` is the key into the runtime table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum DataRoot {
    Partition { name: String },
    External { name: String, path: PathBuf },
}

impl DataRoot {
    pub fn name(&self) -> &str {
        match self {
            Self::Partition { name } | Self::External { name, .. } => name,
        }
    }

    /// The partition that resolves to this data root.
    pub fn partition(&self) -> Partition {
        match self {
            Self::Partition { name } if name == DEFAULT_PARTITION => Partition::Default,
            Self::Partition { name } => Partition::Custom { name: name.clone() },
            Self::External { name, path } => Partition::External {
                name: name.clone(),
                path: path.clone(),
            },
        }
    }
}

impl std::fmt::Display for DataRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partition { name } => write!(f, "partition:{name}"),
            Self::External { name, path } => write!(f, "external:{name}@{}", path.display()),
        }
    }
}

/// Map a runtime mode and partition to the data root they address.
///
/// An externally-run runtime always resolves to its own `apps_data_dir`,
/// whatever partition was supplied; only the partition's name is kept.
pub fn resolve(mode: &RuntimeMode, partition: &Partition) -> DataRoot {
    match (mode, partition) {
        (RuntimeMode::RunningExternal { apps_data_dir, .. }, partition) => {
            let name = match partition {
                Partition::Default => EXTERNAL_ROOT.to_string(),
                Partition::Custom { name } | Partition::External { name, .. } => name.clone(),
            };
            DataRoot::External {
                name,
                path: apps_data_dir.clone(),
            }
        }
        (RuntimeMode::BuiltIn { .. } | RuntimeMode::CustomPath { .. }, Partition::Default) => {
            DataRoot::Partition {
                name: DEFAULT_PARTITION.to_string(),
            }
        }
        (RuntimeMode::BuiltIn { .. } | RuntimeMode::CustomPath { .. }, Partition::Custom { name }) => {
            DataRoot::Partition { name: name.clone() }
        }
        (
            RuntimeMode::BuiltIn { .. } | RuntimeMode::CustomPath { .. },
            Partition::External { name, path },
        ) => DataRoot::External {
            name: name.clone(),
            path: path.clone(),
        },
    }
}

/// Check a profile or partition name against the allowed pattern.
pub fn validate_name(kind: &str, name: &str) -> LauncherResult<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(LauncherError::Validation(format!(
            "{kind} '{name}' may only contain digits, letters and dashes"
        )))
    }
}

pub fn validate_partition(partition: &Partition) -> LauncherResult<()> {
    match partition {
        Partition::Default => Ok(()),
        Partition::Custom { name } => validate_name("partition", name),
        Partition::External { name, path } => {
            validate_name("partition", name)?;
            if path.as_os_str().is_empty() {
                return Err(LauncherError::Validation(
                    "external partition requires a path".to_string(),
                ));
            }
            Ok(())
        }
    }
}

pub fn validate_mode(mode: &RuntimeMode) -> LauncherResult<()> {
    match mode {
        RuntimeMode::BuiltIn { version } if version.trim().is_empty() => Err(
            LauncherError::Validation("built-in mode requires a version".to_string()),
        ),
        RuntimeMode::BuiltIn { .. } => Ok(()),
        RuntimeMode::CustomPath { path } if path.as_os_str().is_empty() => Err(
            LauncherError::Validation("custom-path mode requires a binary path".to_string()),
        ),
        RuntimeMode::CustomPath { .. } => Ok(()),
        RuntimeMode::RunningExternal {
            config_path,
            apps_data_dir,
            admin_port,
        } => {
            if *admin_port == 0 {
                return Err(LauncherError::Validation(
                    "running-external mode requires a non-zero admin port".to_string(),
                ));
            }
            if config_path.as_os_str().is_empty() || apps_data_dir.as_os_str().is_empty() {
                return Err(LauncherError::Validation(
                    "running-external mode requires configPath and appsDataDir".to_string(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_in() -> RuntimeMode {
        RuntimeMode::BuiltIn {
            version: "0.2.3".to_string(),
        }
    }

    fn custom_path() -> RuntimeMode {
        RuntimeMode::CustomPath {
            path: PathBuf::from("/opt/runtime"),
        }
    }

    fn external() -> RuntimeMode {
        RuntimeMode::RunningExternal {
            config_path: PathBuf::from("/etc/conductor.yaml"),
            apps_data_dir: PathBuf::from("/var/apps"),
            admin_port: 8000,
        }
    }

    #[test]
    fn managed_modes_with_default_partition_resolve_to_default() {
        for mode in [built_in(), custom_path()] {
            assert_eq!(
                resolve(&mode, &Partition::Default),
                DataRoot::Partition {
                    name: "default".to_string()
                }
            );
        }
    }

    #[test]
    fn named_partition_resolves_to_its_name() {
        let partition = Partition::Custom {
            name: "custom-A".to_string(),
        };
        assert_eq!(
            resolve(&custom_path(), &partition),
            DataRoot::Partition {
                name: "custom-A".to_string()
            }
        );
        assert_eq!(resolve(&built_in(), &partition).name(), "custom-A");
    }

    #[test]
    fn running_external_ignores_partition_path() {
        let partition = Partition::External {
            name: "lab".to_string(),
            path: PathBuf::from("/somewhere/else"),
        };
        assert_eq!(
            resolve(&external(), &partition),
            DataRoot::External {
                name: "lab".to_string(),
                path: PathBuf::from("/var/apps"),
            }
        );
        assert_eq!(
            resolve(&external(), &Partition::Default),
            DataRoot::External {
                name: "external".to_string(),
                path: PathBuf::from("/var/apps"),
            }
        );
    }

    #[test]
    fn resolve_is_deterministic_and_partition_round_trips() {
        let partitions = [
            Partition::Default,
            Partition::Custom {
                name: "a".to_string(),
            },
            Partition::External {
                name: "b".to_string(),
                path: PathBuf::from("/b"),
            },
        ];
        for mode in [built_in(), custom_path()] {
            for partition in &partitions {
                let root = resolve(&mode, partition);
                assert_eq!(root, resolve(&mode, partition));
                assert_eq!(&root.partition(), partition);
            }
        }
    }

    #[test]
    fn runtime_mode_wire_format() {
        let json = serde_json::to_value(external()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "running-external",
                "configPath": "/etc/conductor.yaml",
                "appsDataDir": "/var/apps",
                "adminPort": 8000
            })
        );
        let parsed: RuntimeMode =
            serde_json::from_str(r#"{"type":"built-in","version":"0.2.3"}"#).unwrap();
        assert_eq!(parsed, built_in());
    }

    #[test]
    fn running_external_without_admin_port_is_rejected_by_serde() {
        let parsed: Result<RuntimeMode, _> = serde_json::from_str(
            r#"{"type":"running-external","configPath":"/c","appsDataDir":"/a"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_mode_rejects_zero_port_and_empty_fields() {
        let zero = RuntimeMode::RunningExternal {
            config_path: PathBuf::from("/c"),
            apps_data_dir: PathBuf::from("/a"),
            admin_port: 0,
        };
        assert!(matches!(validate_mode(&zero), Err(LauncherError::Validation(_))));
        assert!(validate_mode(&RuntimeMode::BuiltIn { version: " ".to_string() }).is_err());
        assert!(validate_mode(&external()).is_ok());
        assert!(validate_mode(&custom_path()).is_ok());
    }

    #[test]
    fn validate_partition_enforces_name_pattern() {
        assert!(validate_partition(&Partition::Default).is_ok());
        assert!(
            validate_partition(&Partition::Custom {
                name: "team-2".to_string()
            })
            .is_ok()
        );
        assert!(
            validate_partition(&Partition::Custom {
                name: "../etc".to_string()
            })
            .is_err()
        );
        assert!(
            validate_partition(&Partition::External {
                name: "x".to_string(),
                path: PathBuf::new()
            })
            .is_err()
        );
    }

    #[test]
    fn data_root_display() {
        let root = DataRoot::Partition {
            name: "default".to_string(),
        };
        assert_eq!(root.to_string(), "partition:default");
    }
}
