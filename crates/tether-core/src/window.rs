//! Contract with whatever draws application windows.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::authz::WindowId;
use crate::data_root::DataRoot;
use crate::error::LauncherResult;

/// What the host needs to open a window for an installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub data_root: DataRoot,
    pub installed_app_id: String,
    /// Endpoint of the runtime the window's UI talks to.
    pub runtime_endpoint: String,
    pub ui_dir: PathBuf,
}

/// Opens and focuses windows. The host reports closes back through
/// [`crate::launcher::Launcher::window_closed`].
#[async_trait]
pub trait WindowHost: Send + Sync {
    async fn open(&self, request: &WindowRequest) -> LauncherResult<WindowId>;

    async fn focus(&self, window_id: WindowId) -> LauncherResult<()>;

    /// Discard a window the launcher opened but could not authorize.
    async fn close(&self, window_id: WindowId) -> LauncherResult<()>;
}
