//! Orchestration of keystore, runtimes, windows and signing.
//!
//! [`Launcher`] owns all mutable state explicitly: the event bus, the
//! runtime table, the window authorization map and the signing gate. The
//! RPC boundary holds an `Arc<Launcher>` and nothing else.
//!
//! One keystore serves every managed data root. Its supervisor sits behind
//! an async mutex so concurrent launches for different roots share it
//! instead of racing to start two.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::admin::{AdminApi, AdminConnector, ExtendedAppInfo, InstallRequest, InstalledApp};
use crate::authz::{SignerSelector, WindowAuthorizations, WindowBinding, WindowId};
use crate::data_root::{self, DataRoot, Partition, RuntimeMode};
use crate::error::{LauncherError, LauncherResult};
use crate::events::{EventBus, LauncherEvent, ProgressEvent};
use crate::layout::DataLayout;
use crate::runtime_table::{RunningRuntime, RuntimeEntry, RuntimeTable};
use crate::secret::Secret;
use crate::signing::{SignedZomeCall, SignerConnector, SignerTarget, SigningGate, UnsignedZomeCall};
use crate::supervisor::keystore::{self, KeystoreConfig};
use crate::supervisor::runtime::{self, RuntimeLaunch};
use crate::supervisor::{ProcessRole, Supervisor, allocate_port, query_version};
use crate::window::{WindowHost, WindowRequest};

/// Regexes used to read child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPatterns {
    pub keystore: String,
    pub runtime: String,
    pub port_in_use: String,
}

impl Default for ReadinessPatterns {
    fn default() -> Self {
        Self {
            keystore: keystore::DEFAULT_READY_PATTERN.to_string(),
            runtime: runtime::DEFAULT_READY_PATTERN.to_string(),
            port_in_use: runtime::DEFAULT_PORT_IN_USE_PATTERN.to_string(),
        }
    }
}

/// Static settings of one launcher instance.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub layout: DataLayout,
    pub keystore_binary: PathBuf,
    /// Runtime binary used for [`RuntimeMode::BuiltIn`].
    pub runtime_binary: PathBuf,
    /// Bundle installed when an [`InstallRequest`] has an empty `bundle_path`.
    pub default_app_bundle: Option<PathBuf>,
    /// Mode and partition used by [`Launcher::launch`].
    pub mode: RuntimeMode,
    pub partition: Partition,
    pub readiness: ReadinessPatterns,
}

/// Implementations of the external contracts.
#[derive(Clone)]
pub struct Collaborators {
    pub admin: Arc<dyn AdminConnector>,
    pub signer: Arc<dyn SignerConnector>,
    pub windows: Arc<dyn WindowHost>,
}

/// What to install, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallApplication {
    pub data_root: String,
    pub request: InstallRequest,
}

struct RunningKeystore {
    supervisor: Supervisor,
    url: String,
}

pub struct Launcher {
    config: LauncherConfig,
    collaborators: Collaborators,
    bus: EventBus,
    runtimes: RuntimeTable,
    authz: WindowAuthorizations,
    signing: SigningGate,
    keystore: Mutex<Option<RunningKeystore>>,
    /// Serializes window opening so one app never gets two windows.
    window_lock: Mutex<()>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .field("runtimes", &self.runtimes)
            .field("windows", &self.authz.len())
            .finish()
    }
}

impl Launcher {
    pub fn new(config: LauncherConfig, collaborators: Collaborators, bus: EventBus) -> Self {
        Self {
            config,
            collaborators,
            bus,
            runtimes: RuntimeTable::new(),
            authz: WindowAuthorizations::new(),
            signing: SigningGate::new(),
            keystore: Mutex::new(None),
            window_lock: Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn runtimes(&self) -> &RuntimeTable {
        &self.runtimes
    }

    pub fn authorizations(&self) -> &WindowAuthorizations {
        &self.authz
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// True until the keystore directory holds a keystore config.
    pub fn is_keystore_setup_required(&self) -> bool {
        !self.config.layout.keystore_initialized()
    }

    /// First-run path: create the keystore if needed, then launch.
    #[instrument(skip_all)]
    pub async fn initialize_and_launch(&self, secret: &Secret) -> LauncherResult<RunningRuntime> {
        require_secret(secret)?;
        query_version(ProcessRole::Keystore, &self.config.keystore_binary).await?;

        if self.is_keystore_setup_required() {
            self.config.layout.create_initial_directories()?;
            self.bus.progress(ProgressEvent::InitializingKeystore);
            keystore::initialize_keystore(&self.keystore_config(), secret, &self.bus).await?;
        }
        self.launch(secret).await
    }

    /// Launch the configured mode and partition.
    pub async fn launch(&self, secret: &Secret) -> LauncherResult<RunningRuntime> {
        require_secret(secret)?;
        let mode = self.config.mode.clone();
        let partition = self.config.partition.clone();
        self.launch_data_root(&mode, &partition, secret).await
    }

    /// Bring up the runtime for one data root.
    ///
    /// Fails fast with [`LauncherError::AlreadyLaunching`] if a launch for
    /// the same root is in flight.
    #[instrument(skip(self, secret), fields(data_root = tracing::field::Empty))]
    pub async fn launch_data_root(
        &self,
        mode: &RuntimeMode,
        partition: &Partition,
        secret: &Secret,
    ) -> LauncherResult<RunningRuntime> {
        data_root::validate_mode(mode)?;
        data_root::validate_partition(partition)?;
        let root = data_root::resolve(mode, partition);
        tracing::Span::current().record("data_root", root.name());

        let ticket = self.runtimes.begin_launch(root.name())?;

        let entry = match mode {
            RuntimeMode::RunningExternal { admin_port, .. } => {
                self.attach_external(mode, &root, *admin_port).await?
            }
            RuntimeMode::BuiltIn { .. } | RuntimeMode::CustomPath { .. } => {
                self.start_managed(mode, &root, secret).await?
            }
        };

        let info = ticket.complete(entry);
        self.bus.progress(ProgressEvent::Ready);
        self.bus.publish(LauncherEvent::RuntimeReady(info.clone()));
        Ok(info)
    }

    async fn attach_external(
        &self,
        mode: &RuntimeMode,
        root: &DataRoot,
        admin_port: u16,
    ) -> LauncherResult<RuntimeEntry> {
        let endpoint = format!("ws://127.0.0.1:{admin_port}");
        info!(data_root = %root, %endpoint, "attaching to external runtime");

        let admin = self.collaborators.admin.connect(&endpoint).await?;
        let selector = SignerSelector::Custom { admin_port };
        if !self.signing.contains(selector) {
            let signer = self
                .collaborators
                .signer
                .connect(SignerTarget::External { admin_port })
                .await?;
            self.signing.register(selector, signer);
        }

        let apps = fetch_apps(admin.as_ref(), root).await;
        Ok(RuntimeEntry {
            info: RunningRuntime {
                mode: mode.clone(),
                data_root: root.clone(),
                admin_port,
                endpoint,
            },
            supervisor: None,
            admin,
            apps,
        })
    }

    async fn start_managed(
        &self,
        mode: &RuntimeMode,
        root: &DataRoot,
        secret: &Secret,
    ) -> LauncherResult<RuntimeEntry> {
        let keystore_url = self.ensure_keystore(secret).await?;

        self.bus.progress(ProgressEvent::StartingRuntime);
        let admin_port = allocate_port()?;
        let binary = match mode {
            RuntimeMode::CustomPath { path } => path.clone(),
            _ => self.config.runtime_binary.clone(),
        };
        let layout = &self.config.layout;
        let launch = RuntimeLaunch {
            binary,
            config_path: layout.conductor_config_path(root),
            data_dir: layout.databases_dir(root),
            keystore_url,
            admin_port,
            ready_pattern: self.config.readiness.runtime.clone(),
            port_in_use_pattern: self.config.readiness.port_in_use.clone(),
        };
        let (mut supervisor, endpoint) = runtime::launch_runtime(&launch, secret, &self.bus).await?;

        let admin = match self.collaborators.admin.connect(&endpoint).await {
            Ok(admin) => admin,
            Err(e) => {
                supervisor.terminate();
                return Err(e);
            }
        };
        let apps = fetch_apps(admin.as_ref(), root).await;

        Ok(RuntimeEntry {
            info: RunningRuntime {
                mode: mode.clone(),
                data_root: root.clone(),
                admin_port,
                endpoint,
            },
            supervisor: Some(supervisor),
            admin,
            apps,
        })
    }

    /// Connection URL of the shared keystore, starting it if necessary.
    async fn ensure_keystore(&self, secret: &Secret) -> LauncherResult<String> {
        let mut guard = self.keystore.lock().await;
        if let Some(running) = guard.as_mut() {
            if running.supervisor.is_running() {
                return Ok(running.url.clone());
            }
            warn!("keystore is no longer running, restarting");
            *guard = None;
        }

        self.config.layout.create_initial_directories()?;
        self.bus.progress(ProgressEvent::StartingKeystore);
        let (mut supervisor, url) =
            keystore::launch_keystore(&self.keystore_config(), secret, &self.bus).await?;

        let signer = match self
            .collaborators
            .signer
            .connect(SignerTarget::Keystore { url: &url, secret })
            .await
        {
            Ok(signer) => signer,
            Err(e) => {
                supervisor.terminate();
                return Err(e);
            }
        };
        self.signing.register(SignerSelector::Default, signer);

        *guard = Some(RunningKeystore {
            supervisor,
            url: url.clone(),
        });
        Ok(url)
    }

    fn keystore_config(&self) -> KeystoreConfig {
        KeystoreConfig {
            binary: self.config.keystore_binary.clone(),
            keystore_dir: self.config.layout.keystore_dir(),
            ready_pattern: self.config.readiness.keystore.clone(),
        }
    }

    /// Every cached installed app across running data roots.
    pub fn list_installed_applications(&self) -> Vec<ExtendedAppInfo> {
        self.runtimes
            .all_apps()
            .into_iter()
            .map(|(runtime, app)| ExtendedAppInfo {
                app,
                version: runtime.mode,
                data_root: runtime.data_root,
            })
            .collect()
    }

    /// Re-read a root's installed apps from its admin API.
    pub async fn refresh_apps(&self, data_root: &str) -> LauncherResult<Vec<InstalledApp>> {
        let admin = self.runtimes.admin(data_root)?;
        let apps = admin.list_apps().await?;
        self.runtimes.update_apps(data_root, apps.clone())?;
        Ok(apps)
    }

    /// Open a window for an installed app and bind it to the app's agent.
    ///
    /// If the app already has a window, that window is focused instead.
    #[instrument(skip(self))]
    pub async fn open_application_window(
        &self,
        data_root: &str,
        installed_app_id: &str,
    ) -> LauncherResult<WindowId> {
        let _serial = self.window_lock.lock().await;

        let runtime = self
            .runtimes
            .get(data_root)
            .ok_or_else(|| LauncherError::UnknownDataRoot(data_root.to_string()))?;
        let app = self
            .runtimes
            .apps(data_root)?
            .into_iter()
            .find(|app| app.installed_app_id == installed_app_id)
            .ok_or_else(|| {
                LauncherError::Validation(format!(
                    "app '{installed_app_id}' is not installed in '{data_root}'"
                ))
            })?;

        if let Some(existing) = self.authz.window_for_app(data_root, installed_app_id) {
            self.collaborators.windows.focus(existing).await?;
            return Ok(existing);
        }

        let request = WindowRequest {
            data_root: runtime.data_root.clone(),
            installed_app_id: installed_app_id.to_string(),
            runtime_endpoint: runtime.endpoint.clone(),
            ui_dir: self.config.layout.app_ui_dir(&runtime.data_root, installed_app_id),
        };
        let window_id = self.collaborators.windows.open(&request).await?;

        let admin_port = match runtime.mode {
            RuntimeMode::RunningExternal { admin_port, .. } => Some(admin_port),
            RuntimeMode::BuiltIn { .. } | RuntimeMode::CustomPath { .. } => None,
        };
        let bound = self.authz.bind(WindowBinding {
            window_id,
            agent: app.agent_pub_key,
            admin_port,
            data_root: data_root.to_string(),
            installed_app_id: installed_app_id.to_string(),
        });
        if let Err(e) = bound {
            if let Err(close_err) = self.collaborators.windows.close(window_id).await {
                warn!(%window_id, error = %close_err, "failed to discard unbound window");
            }
            return Err(e);
        }
        info!(%window_id, "application window opened");
        Ok(window_id)
    }

    /// Called by the window host when a window closes.
    pub fn window_closed(&self, window_id: WindowId) -> bool {
        self.authz.unbind(window_id).is_some()
    }

    pub async fn install_application(
        &self,
        install: &InstallApplication,
    ) -> LauncherResult<InstalledApp> {
        let mut request = install.request.clone();
        if request.bundle_path.as_os_str().is_empty() {
            request.bundle_path = self
                .config
                .default_app_bundle
                .clone()
                .ok_or_else(|| LauncherError::Validation("no file path provided".to_string()))?;
        }
        let admin = self.runtimes.admin(&install.data_root)?;
        info!(
            data_root = %install.data_root,
            app = %request.installed_app_id,
            bundle = %request.bundle_path.display(),
            "installing application"
        );
        let installed = admin.install_app(&request).await?;
        self.refresh_apps(&install.data_root).await?;
        Ok(installed)
    }

    /// Uninstall an app. An open window for it loses its signing grant.
    pub async fn uninstall_application(
        &self,
        data_root: &str,
        installed_app_id: &str,
    ) -> LauncherResult<()> {
        let admin = self.runtimes.admin(data_root)?;
        info!(data_root, app = installed_app_id, "uninstalling application");
        admin.uninstall_app(installed_app_id).await?;
        if let Some(window_id) = self.authz.window_for_app(data_root, installed_app_id) {
            self.authz.unbind(window_id);
        }
        self.refresh_apps(data_root).await?;
        Ok(())
    }

    /// Authorize and sign a zome call on behalf of a window.
    pub async fn sign_zome_call(
        &self,
        window_id: WindowId,
        call: UnsignedZomeCall,
    ) -> LauncherResult<SignedZomeCall> {
        self.signing.sign(&self.authz, window_id, call).await
    }

    /// Signal every owned child to stop. Safe to call more than once.
    pub async fn shutdown(&self) -> usize {
        let mut signalled = self.runtimes.terminate_all();
        let keystore = self.keystore.lock().await.take();
        if let Some(mut keystore) = keystore {
            if keystore.supervisor.terminate() {
                signalled += 1;
            }
        }
        self.signing.clear();
        info!(signalled, "launcher shut down");
        signalled
    }
}

fn require_secret(secret: &Secret) -> LauncherResult<()> {
    if secret.is_empty() {
        return Err(LauncherError::Validation("secret must not be empty".to_string()));
    }
    Ok(())
}

async fn fetch_apps(admin: &dyn AdminApi, root: &DataRoot) -> Vec<InstalledApp> {
    match admin.list_apps().await {
        Ok(apps) => apps,
        Err(e) => {
            warn!(data_root = %root, error = %e, "could not list installed apps");
            Vec::new()
        }
    }
}
