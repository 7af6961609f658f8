//! On-disk layout of one launcher profile.
//!
//! Pure path mapping plus the two filesystem checks the launcher needs.

use std::path::{Path, PathBuf};

use crate::data_root::DataRoot;

/// File whose presence marks an initialized keystore directory.
pub const KEYSTORE_CONFIG_FILE: &str = "lair-keystore-config.yaml";

/// Directory layout rooted at a profile directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    profile_root: PathBuf,
}

impl DataLayout {
    pub fn new(profile_root: impl Into<PathBuf>) -> Self {
        Self {
            profile_root: profile_root.into(),
        }
    }

    pub fn profile_root(&self) -> &Path {
        &self.profile_root
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.profile_root.join("keystore")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.profile_root.join("runtime")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.profile_root.join("logs")
    }

    /// Directory that holds a data root's conductor state.
    ///
    /// External roots live wherever their owner put them.
    pub fn root_dir(&self, root: &DataRoot) -> PathBuf {
        match root {
            DataRoot::Partition { name } => self.runtime_dir().join(name),
            DataRoot::External { path, .. } => path.clone(),
        }
    }

    pub fn conductor_config_path(&self, root: &DataRoot) -> PathBuf {
        self.root_dir(root).join("conductor-config.yaml")
    }

    pub fn databases_dir(&self, root: &DataRoot) -> PathBuf {
        self.root_dir(root).join("databases")
    }

    pub fn app_ui_dir(&self, root: &DataRoot, app_id: &str) -> PathBuf {
        self.root_dir(root).join("apps").join(app_id).join("ui")
    }

    pub fn create_initial_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.keystore_dir())?;
        std::fs::create_dir_all(self.runtime_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    pub fn keystore_initialized(&self) -> bool {
        self.keystore_dir().join(KEYSTORE_CONFIG_FILE).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_dirs_nest_under_runtime() {
        let layout = DataLayout::new("/data/tether/default");
        let root = DataRoot::Partition {
            name: "custom-A".to_string(),
        };
        assert_eq!(
            layout.conductor_config_path(&root),
            PathBuf::from("/data/tether/default/runtime/custom-A/conductor-config.yaml")
        );
        assert_eq!(
            layout.app_ui_dir(&root, "forum"),
            PathBuf::from("/data/tether/default/runtime/custom-A/apps/forum/ui")
        );
    }

    #[test]
    fn external_root_uses_its_own_path() {
        let layout = DataLayout::new("/data/tether/default");
        let root = DataRoot::External {
            name: "lab".to_string(),
            path: PathBuf::from("/srv/lab"),
        };
        assert_eq!(layout.databases_dir(&root), PathBuf::from("/srv/lab/databases"));
    }

    #[test]
    fn keystore_initialized_follows_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path());
        layout.create_initial_directories().unwrap();
        assert!(layout.keystore_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(!layout.keystore_initialized());

        std::fs::write(layout.keystore_dir().join(KEYSTORE_CONFIG_FILE), "x").unwrap();
        assert!(layout.keystore_initialized());
    }
}
