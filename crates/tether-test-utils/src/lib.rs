//! Shared test utilities for tether integration tests.
//!
//! Provides executable stand-ins for the keystore and runtime binaries,
//! recording fakes for the admin API, signer and window host, and
//! [`TestLauncher`], which wires all of them into a [`Launcher`] rooted in
//! a temporary directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use tether_core::admin::{AdminApi, AdminConnector, InstallRequest, InstalledApp};
use tether_core::authz::{AgentPubKey, WindowId};
use tether_core::data_root::{Partition, RuntimeMode};
use tether_core::events::EventBus;
use tether_core::launcher::{Collaborators, Launcher, LauncherConfig, ReadinessPatterns};
use tether_core::layout::DataLayout;
use tether_core::signing::{SignerConnector, SignerTarget, UnsignedZomeCall, ZomeCallSigner};
use tether_core::window::{WindowHost, WindowRequest};
use tether_core::{LauncherError, LauncherResult};

/// Write `body` to `dir/name` and make it executable.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

/// Keystore stand-in.
///
/// `init` stores the passphrase and writes the keystore config file;
/// `server` checks the passphrase and prints a connection URL under the
/// keystore directory. Each `init` appends a line to `<root>/init-calls`.
pub const FAKE_KEYSTORE: &str = r##"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "lair-keystore 0.4.5-fake"
  exit 0
fi
root="$2"
cmd="$3"
read -r pw
case "$cmd" in
  init)
    if [ -z "$pw" ]; then
      echo "empty passphrase" >&2
      exit 1
    fi
    mkdir -p "$root"
    echo init >> "$root/init-calls"
    printf '%s\n' "$pw" > "$root/.fake-pass"
    echo "connectionUrl: unix://$root/socket" > "$root/lair-keystore-config.yaml"
    ;;
  server)
    if [ "$(cat "$root/.fake-pass" 2>/dev/null)" != "$pw" ]; then
      echo "failed to unlock keystore: passphrase mismatch" >&2
      exit 1
    fi
    echo "# lair-keystore running #"
    echo "# lair-keystore connection_url # unix://$root/socket?k=fake #"
    exec sleep 600
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 2
    ;;
esac
"##;

/// Runtime stand-in.
///
/// Reads the admin port from the conductor config passed with `-c` and
/// fails the way a real runtime does if something already listens there.
pub const FAKE_RUNTIME: &str = r#"#!/usr/bin/env bash
read -r pw
config="$3"
port=$(sed -n 's/^ *port: *\([0-9][0-9]*\).*/\1/p' "$config" | head -n 1)
echo "Conductor starting, admin port $port"
if (exec 3<>"/dev/tcp/127.0.0.1/$port") 2>/dev/null; then
  echo "Error: Address already in use (os error 98)" >&2
  exit 1
fi
echo "Conductor ready."
exec sleep 600
"#;

/// Runtime stand-in that never becomes ready.
pub const SILENT_RUNTIME: &str = "#!/bin/sh\nread -r pw\necho 'Conductor starting'\nexec sleep 600\n";

/// Runtime stand-in that becomes ready and then exits on its own.
pub const SHORT_LIVED_RUNTIME: &str =
    "#!/bin/sh\nread -r pw\necho 'Conductor ready.'\nsleep 1\nexit 3\n";

/// Admin API fake shared by every runtime it is connected to.
#[derive(Debug, Default)]
pub struct FakeAdmin {
    apps: Mutex<Vec<InstalledApp>>,
    endpoints: Mutex<Vec<String>>,
    installs: Mutex<Vec<InstallRequest>>,
}

impl FakeAdmin {
    pub fn with_apps(apps: Vec<InstalledApp>) -> Self {
        Self {
            apps: Mutex::new(apps),
            ..Self::default()
        }
    }

    /// Requests that reached `install_app`, in call order.
    pub fn installs(&self) -> Vec<InstallRequest> {
        self.installs.lock().expect("poisoned").clone()
    }

    /// Endpoints passed to `connect`, in call order.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().expect("poisoned").clone()
    }

    pub fn apps(&self) -> Vec<InstalledApp> {
        self.apps.lock().expect("poisoned").clone()
    }

    pub fn set_apps(&self, apps: Vec<InstalledApp>) {
        *self.apps.lock().expect("poisoned") = apps;
    }
}

/// App whose agent key is the app id's bytes.
pub fn app(installed_app_id: &str) -> InstalledApp {
    InstalledApp {
        installed_app_id: installed_app_id.to_string(),
        agent_pub_key: AgentPubKey::new(installed_app_id.as_bytes()),
        cell_info: serde_json::Value::Null,
    }
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn list_apps(&self) -> LauncherResult<Vec<InstalledApp>> {
        Ok(self.apps())
    }

    async fn install_app(&self, request: &InstallRequest) -> LauncherResult<InstalledApp> {
        self.installs.lock().expect("poisoned").push(request.clone());
        let mut apps = self.apps.lock().expect("poisoned");
        if apps.iter().any(|a| a.installed_app_id == request.installed_app_id) {
            return Err(LauncherError::Admin(format!(
                "app '{}' already installed",
                request.installed_app_id
            )));
        }
        let installed = app(&request.installed_app_id);
        apps.push(installed.clone());
        Ok(installed)
    }

    async fn uninstall_app(&self, installed_app_id: &str) -> LauncherResult<()> {
        self.apps
            .lock()
            .expect("poisoned")
            .retain(|a| a.installed_app_id != installed_app_id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeAdminConnector(pub Arc<FakeAdmin>);

#[async_trait]
impl AdminConnector for FakeAdminConnector {
    async fn connect(&self, endpoint: &str) -> LauncherResult<Arc<dyn AdminApi>> {
        self.0
            .endpoints
            .lock()
            .expect("poisoned")
            .push(endpoint.to_string());
        Ok(self.0.clone())
    }
}

/// Signer that counts calls and returns a fixed signature.
#[derive(Debug, Default)]
pub struct RecordingSigner {
    calls: AtomicUsize,
    targets: Mutex<Vec<String>>,
}

impl RecordingSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Connection targets, as `keystore:<url>` or `external:<port>`.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl ZomeCallSigner for RecordingSigner {
    async fn sign(&self, _call: &UnsignedZomeCall) -> LauncherResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0x51, 0x67])
    }
}

#[derive(Debug)]
pub struct RecordingSignerConnector(pub Arc<RecordingSigner>);

#[async_trait]
impl SignerConnector for RecordingSignerConnector {
    async fn connect(&self, target: SignerTarget<'_>) -> LauncherResult<Arc<dyn ZomeCallSigner>> {
        let label = match target {
            SignerTarget::Keystore { url, .. } => format!("keystore:{url}"),
            SignerTarget::External { admin_port } => format!("external:{admin_port}"),
        };
        self.0.targets.lock().expect("poisoned").push(label);
        Ok(self.0.clone())
    }
}

/// Window host that hands out sequential ids.
#[derive(Debug, Default)]
pub struct FakeWindowHost {
    next_id: AtomicU64,
    opened: Mutex<Vec<WindowRequest>>,
    focused: Mutex<Vec<WindowId>>,
    closed: Mutex<Vec<WindowId>>,
}

impl FakeWindowHost {
    /// Make the next `open` return `id`.
    pub fn reuse_id(&self, id: WindowId) {
        self.next_id.store(id.0.saturating_sub(1), Ordering::SeqCst);
    }

    pub fn closed(&self) -> Vec<WindowId> {
        self.closed.lock().expect("poisoned").clone()
    }

    pub fn opened(&self) -> Vec<WindowRequest> {
        self.opened.lock().expect("poisoned").clone()
    }

    pub fn focused(&self) -> Vec<WindowId> {
        self.focused.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl WindowHost for FakeWindowHost {
    async fn open(&self, request: &WindowRequest) -> LauncherResult<WindowId> {
        self.opened.lock().expect("poisoned").push(request.clone());
        Ok(WindowId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn focus(&self, window_id: WindowId) -> LauncherResult<()> {
        self.focused.lock().expect("poisoned").push(window_id);
        Ok(())
    }

    async fn close(&self, window_id: WindowId) -> LauncherResult<()> {
        self.closed.lock().expect("poisoned").push(window_id);
        Ok(())
    }
}

fn built_in() -> RuntimeMode {
    RuntimeMode::BuiltIn {
        version: "0.2.3".to_string(),
    }
}

/// A [`Launcher`] over fake binaries and fake collaborators.
pub struct TestLauncher {
    pub launcher: Arc<Launcher>,
    pub admin: Arc<FakeAdmin>,
    pub signer: Arc<RecordingSigner>,
    pub windows: Arc<FakeWindowHost>,
    pub bus: EventBus,
    pub dir: TempDir,
}

impl TestLauncher {
    /// Built-in mode, default partition, one installed app `forum`.
    pub fn new() -> Self {
        Self::with_mode(built_in())
    }

    pub fn with_mode(mode: RuntimeMode) -> Self {
        Self::build(mode, FAKE_RUNTIME, None)
    }

    /// Like [`TestLauncher::new`] with a default app bundle configured.
    pub fn with_default_app_bundle(bundle: impl Into<PathBuf>) -> Self {
        Self::build(built_in(), FAKE_RUNTIME, Some(bundle.into()))
    }

    /// Like [`TestLauncher::new`] but the runtime never prints its marker.
    pub fn with_silent_runtime() -> Self {
        Self::with_runtime_script(SILENT_RUNTIME)
    }

    /// Built-in mode with a custom runtime script.
    pub fn with_runtime_script(runtime_script: &str) -> Self {
        Self::build(built_in(), runtime_script, None)
    }

    fn build(
        mode: RuntimeMode,
        runtime_script: &str,
        default_app_bundle: Option<PathBuf>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).expect("failed to create bin dir");
        let keystore_binary = write_script(&bin, "keystore", FAKE_KEYSTORE);
        let runtime_binary = write_script(&bin, "runtime", runtime_script);

        let admin = Arc::new(FakeAdmin::with_apps(vec![app("forum")]));
        let signer = Arc::new(RecordingSigner::default());
        let windows = Arc::new(FakeWindowHost::default());
        let bus = EventBus::new();

        let config = LauncherConfig {
            layout: DataLayout::new(dir.path().join("profile")),
            keystore_binary,
            runtime_binary,
            default_app_bundle,
            mode,
            partition: Partition::Default,
            readiness: ReadinessPatterns::default(),
        };
        let collaborators = Collaborators {
            admin: Arc::new(FakeAdminConnector(admin.clone())),
            signer: Arc::new(RecordingSignerConnector(signer.clone())),
            windows: windows.clone(),
        };
        let launcher = Arc::new(Launcher::new(config, collaborators, bus.clone()));

        Self {
            launcher,
            admin,
            signer,
            windows,
            bus,
            dir,
        }
    }

    /// Number of times the fake keystore ran `init`.
    pub fn keystore_init_calls(&self) -> usize {
        let path = self.launcher.config().layout.keystore_dir().join("init-calls");
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

impl Default for TestLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tether_core::supervisor::ReadinessMatcher;
    use tether_core::supervisor::keystore::DEFAULT_READY_PATTERN;

    use super::*;

    #[test]
    fn keystore_script_is_complete_and_announces_its_url() {
        assert!(FAKE_KEYSTORE.trim_end().ends_with("esac"));
        let matcher = ReadinessMatcher::new(DEFAULT_READY_PATTERN).unwrap();
        let line = FAKE_KEYSTORE
            .lines()
            .find(|l| l.contains("connection_url"))
            .unwrap();
        let ready = matcher.check(line).unwrap();
        assert_eq!(ready.endpoint.as_deref(), Some("unix://$root/socket?k=fake"));
    }
}
