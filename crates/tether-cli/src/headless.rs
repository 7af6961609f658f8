//! Collaborators used when `tether` runs without an embedding application.
//!
//! The admin API wire protocol, zome-call signing and window chrome belong
//! to the host application. Headless mode keeps the supervisor usable on
//! its own: the admin surface reports no apps, signing is refused and
//! windows are only logged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use tether_core::admin::{AdminApi, AdminConnector, InstallRequest, InstalledApp};
use tether_core::authz::WindowId;
use tether_core::launcher::Collaborators;
use tether_core::signing::{SignerConnector, SignerTarget, UnsignedZomeCall, ZomeCallSigner};
use tether_core::window::{WindowHost, WindowRequest};
use tether_core::{LauncherError, LauncherResult};

pub fn collaborators() -> Collaborators {
    Collaborators {
        admin: Arc::new(HeadlessAdminConnector),
        signer: Arc::new(HeadlessSignerConnector),
        windows: Arc::new(HeadlessWindowHost::default()),
    }
}

#[derive(Debug)]
struct HeadlessAdmin {
    endpoint: String,
}

#[async_trait]
impl AdminApi for HeadlessAdmin {
    async fn list_apps(&self) -> LauncherResult<Vec<InstalledApp>> {
        Ok(Vec::new())
    }

    async fn install_app(&self, request: &InstallRequest) -> LauncherResult<InstalledApp> {
        Err(LauncherError::Admin(format!(
            "cannot install '{}': no admin client attached for {}",
            request.installed_app_id, self.endpoint
        )))
    }

    async fn uninstall_app(&self, installed_app_id: &str) -> LauncherResult<()> {
        Err(LauncherError::Admin(format!(
            "cannot uninstall '{installed_app_id}': no admin client attached for {}",
            self.endpoint
        )))
    }
}

#[derive(Debug)]
struct HeadlessAdminConnector;

#[async_trait]
impl AdminConnector for HeadlessAdminConnector {
    async fn connect(&self, endpoint: &str) -> LauncherResult<Arc<dyn AdminApi>> {
        info!(endpoint, "admin endpoint available");
        Ok(Arc::new(HeadlessAdmin {
            endpoint: endpoint.to_string(),
        }))
    }
}

#[derive(Debug)]
struct RefusingSigner;

#[async_trait]
impl ZomeCallSigner for RefusingSigner {
    async fn sign(&self, _call: &UnsignedZomeCall) -> LauncherResult<Vec<u8>> {
        Err(LauncherError::Signing(
            "no signer attached in headless mode".to_string(),
        ))
    }
}

#[derive(Debug)]
struct HeadlessSignerConnector;

#[async_trait]
impl SignerConnector for HeadlessSignerConnector {
    async fn connect(&self, _target: SignerTarget<'_>) -> LauncherResult<Arc<dyn ZomeCallSigner>> {
        Ok(Arc::new(RefusingSigner))
    }
}

/// Window host that only logs what it would show.
#[derive(Debug, Default)]
struct HeadlessWindowHost {
    next_id: AtomicU64,
}

#[async_trait]
impl WindowHost for HeadlessWindowHost {
    async fn open(&self, request: &WindowRequest) -> LauncherResult<WindowId> {
        let id = WindowId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        info!(
            window_id = %id,
            data_root = request.data_root.name(),
            app = %request.installed_app_id,
            ui_dir = %request.ui_dir.display(),
            endpoint = %request.runtime_endpoint,
            "application window requested"
        );
        Ok(id)
    }

    async fn focus(&self, window_id: WindowId) -> LauncherResult<()> {
        info!(window_id = %window_id, "focus requested");
        Ok(())
    }

    async fn close(&self, window_id: WindowId) -> LauncherResult<()> {
        info!(window_id = %window_id, "close requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tether_core::authz::AgentPubKey;
    use tether_core::data_root::DataRoot;

    use super::*;

    #[tokio::test]
    async fn admin_lists_nothing_and_refuses_changes() {
        let c = collaborators();
        let admin = c.admin.connect("ws://127.0.0.1:1").await.unwrap();
        assert!(admin.list_apps().await.unwrap().is_empty());
        let err = admin.uninstall_app("forum").await.unwrap_err();
        assert!(matches!(err, LauncherError::Admin(_)));
    }

    #[tokio::test]
    async fn signer_refuses() {
        let c = collaborators();
        let signer = c
            .signer
            .connect(SignerTarget::External { admin_port: 8000 })
            .await
            .unwrap();
        let call = UnsignedZomeCall {
            provenance: AgentPubKey::new([1]),
            cell_id: serde_json::Value::Null,
            zome_name: "z".to_string(),
            fn_name: "f".to_string(),
            payload: serde_json::Value::Null,
            cap_secret: None,
            nonce: "00".to_string(),
            expires_at: 0,
        };
        assert!(matches!(
            signer.sign(&call).await,
            Err(LauncherError::Signing(_))
        ));
    }

    #[tokio::test]
    async fn window_ids_are_sequential() {
        let c = collaborators();
        let request = WindowRequest {
            data_root: DataRoot::Partition {
                name: "default".to_string(),
            },
            installed_app_id: "forum".to_string(),
            runtime_endpoint: "ws://127.0.0.1:1".to_string(),
            ui_dir: PathBuf::from("/tmp/ui"),
        };
        assert_eq!(c.windows.open(&request).await.unwrap(), WindowId(1));
        assert_eq!(c.windows.open(&request).await.unwrap(), WindowId(2));
    }
}
