//! Contract with a runtime's admin API.
//!
//! The admin protocol itself lives outside this crate. Implementors of
//! [`AdminConnector`] turn an endpoint captured at readiness into an
//! [`AdminApi`] client; the launcher only forwards calls to it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::authz::AgentPubKey;
use crate::data_root::{DataRoot, RuntimeMode};
use crate::error::LauncherResult;

/// One application installed in a runtime, as the admin API reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub installed_app_id: String,
    pub agent_pub_key: AgentPubKey,
    #[serde(default)]
    pub cell_info: serde_json::Value,
}

/// An installed app together with the runtime that hosts it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedAppInfo {
    #[serde(flatten)]
    pub app: InstalledApp,
    pub version: RuntimeMode,
    pub data_root: DataRoot,
}

/// Arguments of an install call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub bundle_path: PathBuf,
    pub installed_app_id: String,
    pub network_seed: Option<String>,
}

/// Client for one runtime's admin surface.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn list_apps(&self) -> LauncherResult<Vec<InstalledApp>>;

    async fn install_app(&self, request: &InstallRequest) -> LauncherResult<InstalledApp>;

    async fn uninstall_app(&self, installed_app_id: &str) -> LauncherResult<()>;
}

/// Opens admin clients for runtimes that just became ready.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Connect to the admin API at `endpoint`.
    async fn connect(&self, endpoint: &str) -> LauncherResult<Arc<dyn AdminApi>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AdminApi, _: &dyn AdminConnector) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_info_flattens_app_fields() {
        let info = ExtendedAppInfo {
            app: InstalledApp {
                installed_app_id: "forum".to_string(),
                agent_pub_key: AgentPubKey::new([1, 2]),
                cell_info: serde_json::Value::Null,
            },
            version: RuntimeMode::BuiltIn {
                version: "0.2.3".to_string(),
            },
            data_root: DataRoot::Partition {
                name: "default".to_string(),
            },
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["installedAppId"], "forum");
        assert_eq!(json["agentPubKey"], "0102");
        assert_eq!(json["version"]["type"], "built-in");
        assert_eq!(json["dataRoot"]["name"], "default");
    }
}
