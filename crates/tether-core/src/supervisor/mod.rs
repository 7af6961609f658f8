//! Supervision of the keystore and runtime child processes.
//!
//! A [`Supervisor`] exclusively owns one child process. Launching spawns
//! the binary, writes the secret to its stdin, and scans stdout/stderr line
//! by line until the readiness marker appears or the process exits.
//!
//! ```text
//! NotStarted -> Spawning -> AwaitingReady -> Ready -> Terminating -> Stopped
//!                  |              |
//!                  +----> Failed <+
//! ```

pub mod keystore;
pub mod readiness;
pub mod runtime;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{LauncherError, LauncherResult};
use crate::events::{EventBus, LauncherEvent, LogLine};
use crate::secret::Secret;

pub use readiness::{LineBuffer, OutputPatterns, Readiness, ReadinessMatcher};

/// Number of stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 40;

/// How long to keep draining output after a child exits during launch.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which external service a process provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessRole {
    Keystore,
    Runtime,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keystore => f.write_str("keystore"),
            Self::Runtime => f.write_str("runtime"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Spawning,
    AwaitingReady,
    Ready,
    Terminating,
    Stopped,
    Failed,
}

impl ProcessState {
    /// Whether `from -> to` is an edge of the lifecycle graph.
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::NotStarted, Self::Spawning)
                | (Self::Spawning, Self::AwaitingReady)
                | (Self::Spawning, Self::Failed)
                | (Self::AwaitingReady, Self::Ready)
                | (Self::AwaitingReady, Self::Failed)
                | (Self::Ready, Self::Terminating)
                | (Self::Ready, Self::Stopped)
                | (Self::Terminating, Self::Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Everything needed to start one child process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: ProcessRole,
    pub binary: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub patterns: OutputPatterns,
    /// Port the child was told to bind, reported in [`LauncherError::PortBind`].
    pub port: Option<u16>,
    /// Endpoint to report when the ready line itself carries none.
    pub fallback_endpoint: Option<String>,
}

impl LaunchSpec {
    pub fn new(role: ProcessRole, binary: impl Into<PathBuf>, patterns: OutputPatterns) -> Self {
        Self {
            role,
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            patterns,
            port: None,
            fallback_endpoint: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn(&self) -> LauncherResult<Child> {
        self.command().spawn().map_err(|source| LauncherError::Spawn {
            role: self.role,
            binary: self.binary.clone(),
            source,
        })
    }
}

/// Run `binary --version` and return its trimmed stdout.
pub async fn query_version(role: ProcessRole, binary: &Path) -> LauncherResult<String> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| LauncherError::Spawn {
            role,
            binary: binary.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LauncherError::Launch {
            role,
            reason: format!("`--version` exited with {}", output.status),
            stderr_tail: tail_of(stderr.lines()),
        });
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!(%role, binary = %binary.display(), %version, "queried binary version");
    Ok(version)
}

/// Pick a loopback port that is free right now.
///
/// Nothing reserves it between this call and the child binding it, so the
/// child may still lose the race; that surfaces as [`LauncherError::PortBind`].
pub fn allocate_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn tail_of<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut tail = StderrTail::default();
    for line in lines {
        tail.push(line.to_string());
    }
    tail.into_vec()
}

/// The child could not be reaped. Keeps what it printed on stderr.
fn wait_failure(
    role: ProcessRole,
    error: &std::io::Error,
    tail: StderrTail,
    initializing: bool,
) -> LauncherError {
    let reason = format!("failed to wait for process: {error}");
    let stderr_tail = tail.into_vec();
    if initializing {
        LauncherError::Initialization {
            role,
            reason,
            stderr_tail,
        }
    } else {
        LauncherError::Launch {
            role,
            reason,
            stderr_tail,
        }
    }
}

#[derive(Debug, Default)]
struct StderrTail(VecDeque<String>);

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.0.len() == STDERR_TAIL_LINES {
            self.0.pop_front();
        }
        self.0.push_back(line);
    }

    fn into_vec(self) -> Vec<String> {
        self.0.into()
    }
}

/// Read `reader` to EOF, publishing each line on the bus and forwarding it
/// to `scan` while anyone is still listening there.
fn pump_output<R>(
    reader: R,
    role: ProcessRole,
    stream: OutputStream,
    bus: EventBus,
    scan: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(%role, ?stream, error = %e, "error reading child output");
                    break;
                }
            };
            for line in lines.push(&chunk[..n]) {
                forward_line(&bus, &scan, role, stream, line);
            }
        }
        if let Some(line) = lines.finish() {
            forward_line(&bus, &scan, role, stream, line);
        }
    });
}

fn forward_line(
    bus: &EventBus,
    scan: &mpsc::UnboundedSender<(OutputStream, String)>,
    role: ProcessRole,
    stream: OutputStream,
    line: String,
) {
    bus.publish(LauncherEvent::Log(LogLine {
        role,
        stream,
        line: line.clone(),
    }));
    let _ = scan.send((stream, line));
}

/// Write the secret as a single newline-terminated write.
async fn deliver_secret(stdin: &mut ChildStdin, secret: &Secret) -> std::io::Result<()> {
    let mut framed = Zeroizing::new(Vec::with_capacity(secret.expose_bytes().len() + 1));
    framed.extend_from_slice(secret.expose_bytes());
    framed.push(b'\n');
    stdin.write_all(&framed).await?;
    stdin.flush().await
}

/// Owner of one child process.
pub struct Supervisor {
    role: ProcessRole,
    state: ProcessState,
    pid: Option<u32>,
    child: Option<Child>,
    /// Kept open for the life of the child.
    stdin: Option<ChildStdin>,
    endpoint: Option<String>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Supervisor {
    fn new(role: ProcessRole) -> Self {
        Self {
            role,
            state: ProcessState::NotStarted,
            pid: None,
            child: None,
            stdin: None,
            endpoint: None,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn transition(&mut self, to: ProcessState) {
        debug_assert!(
            ProcessState::is_valid_transition(self.state, to),
            "invalid process transition {:?} -> {:?}",
            self.state,
            to
        );
        debug!(role = %self.role, pid = ?self.pid, from = ?self.state, to = ?to, "process state");
        self.state = to;
    }

    fn fail(&mut self) {
        self.transition(ProcessState::Failed);
        self.child = None;
        self.stdin = None;
    }

    /// One-shot setup run: spawn, deliver the secret, close stdin and wait
    /// for a successful exit.
    pub async fn initialize(spec: &LaunchSpec, secret: &Secret, bus: &EventBus) -> LauncherResult<()> {
        let role = spec.role;
        let mut child = spec.spawn()?;
        info!(%role, pid = ?child.id(), "initialization process spawned");

        let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, role, OutputStream::Stdout, bus.clone(), scan_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, role, OutputStream::Stderr, bus.clone(), scan_tx.clone());
        }
        drop(scan_tx);

        let delivered = match child.stdin.take() {
            Some(mut stdin) => deliver_secret(&mut stdin, secret).await,
            None => Err(std::io::Error::other("stdin not piped")),
        };

        let waited = child.wait().await;
        let mut tail = StderrTail::default();
        let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
            while let Some((stream, line)) = scan_rx.recv().await {
                if stream == OutputStream::Stderr {
                    tail.push(line);
                }
            }
        })
        .await;

        let status = match waited {
            Ok(status) => status,
            Err(e) => return Err(wait_failure(role, &e, tail, true)),
        };
        if let Err(e) = delivered {
            return Err(LauncherError::Initialization {
                role,
                reason: format!("secret could not be delivered: {e}"),
                stderr_tail: tail.into_vec(),
            });
        }
        if !status.success() {
            return Err(LauncherError::Initialization {
                role,
                reason: format!("process exited with {status}"),
                stderr_tail: tail.into_vec(),
            });
        }

        info!(%role, "initialization complete");
        Ok(())
    }

    /// Spawn a persistent child and wait for its readiness marker.
    ///
    /// Resolves with the supervisor and the endpoint once the first ready
    /// line is seen. Stays pending for as long as the child runs without
    /// printing one; callers own any timeout.
    pub async fn launch(
        spec: &LaunchSpec,
        secret: &Secret,
        bus: &EventBus,
    ) -> LauncherResult<(Supervisor, String)> {
        let role = spec.role;
        let mut sup = Supervisor::new(role);
        sup.transition(ProcessState::Spawning);

        let mut child = match spec.spawn() {
            Ok(child) => child,
            Err(e) => {
                sup.fail();
                return Err(e);
            }
        };
        sup.pid = child.id();
        info!(%role, pid = ?sup.pid, binary = %spec.binary.display(), "process spawned");

        let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, role, OutputStream::Stdout, bus.clone(), scan_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, role, OutputStream::Stderr, bus.clone(), scan_tx.clone());
        }
        drop(scan_tx);

        let mut stdin = child.stdin.take();
        if let Some(stdin) = stdin.as_mut() {
            if let Err(e) = deliver_secret(stdin, secret).await {
                // A child that died already is reported by the scan below.
                warn!(%role, error = %e, "failed to write secret to child stdin");
            }
        }
        sup.stdin = stdin;
        sup.transition(ProcessState::AwaitingReady);

        let mut tail = StderrTail::default();
        let mut port_in_use = false;

        let waited: std::io::Result<ExitStatus> = loop {
            tokio::select! {
                biased;
                line = scan_rx.recv() => {
                    let Some((stream, line)) = line else {
                        // Both pipes closed: the child is gone or going.
                        break child.wait().await;
                    };
                    if spec.patterns.is_port_in_use(&line) {
                        port_in_use = true;
                    }
                    if let Some(ready) = spec.patterns.ready.check(&line) {
                        let endpoint = match ready.endpoint.or_else(|| spec.fallback_endpoint.clone()) {
                            Some(endpoint) => endpoint,
                            None => {
                                sup.fail();
                                return Err(LauncherError::Launch {
                                    role,
                                    reason: "ready line carried no endpoint".to_string(),
                                    stderr_tail: tail.into_vec(),
                                });
                            }
                        };
                        sup.child = Some(child);
                        sup.endpoint = Some(endpoint.clone());
                        sup.transition(ProcessState::Ready);
                        info!(%role, pid = ?sup.pid, %endpoint, "process ready");
                        return Ok((sup, endpoint));
                    }
                    if stream == OutputStream::Stderr {
                        tail.push(line);
                    }
                }
                status = child.wait() => {
                    break status;
                }
            }
        };

        // Collect what the child printed on its way out.
        let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
            while let Some((stream, line)) = scan_rx.recv().await {
                if spec.patterns.is_port_in_use(&line) {
                    port_in_use = true;
                }
                if stream == OutputStream::Stderr {
                    tail.push(line);
                }
            }
        })
        .await;

        sup.fail();
        let exit_status = match waited {
            Ok(status) => status,
            Err(e) => {
                warn!(%role, error = %e, "failed to wait for process");
                return Err(wait_failure(role, &e, tail, false));
            }
        };
        warn!(%role, status = %exit_status, "process exited before becoming ready");

        match (port_in_use, spec.port) {
            (true, Some(port)) => Err(LauncherError::PortBind {
                role,
                port,
                stderr_tail: tail.into_vec(),
            }),
            _ => Err(LauncherError::Launch {
                role,
                reason: format!("process exited with {exit_status}"),
                stderr_tail: tail.into_vec(),
            }),
        }
    }

    /// Whether the child is still alive. Forgets the handle once it is not.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(role = %self.role, pid = ?self.pid, %status, "process exited");
                self.release();
                false
            }
            Err(e) => {
                warn!(role = %self.role, pid = ?self.pid, error = %e, "error checking process status");
                false
            }
        }
    }

    fn release(&mut self) {
        self.child = None;
        self.stdin = None;
        if self.state == ProcessState::Ready {
            self.transition(ProcessState::Stopped);
        }
    }

    /// Signal the child to stop without waiting for it to exit.
    ///
    /// Returns `true` if a signal was sent. A child that already exited is
    /// not an error.
    pub fn terminate(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.transition(ProcessState::Terminating);
        let sent = match self.child.as_mut() {
            Some(child) => send_terminate(child),
            None => false,
        };
        info!(role = %self.role, pid = ?self.pid, sent, "terminate requested");
        self.child = None;
        self.stdin = None;
        self.transition(ProcessState::Stopped);
        sent
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: pid belongs to a child we spawned and have not reaped.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        true
    } else {
        warn!(pid, "SIGTERM failed, sending SIGKILL");
        child.start_kill().is_ok()
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventChannel;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn patterns() -> OutputPatterns {
        OutputPatterns::new(ReadinessMatcher::new(r"READY (?P<endpoint>\S+)").unwrap())
            .with_port_in_use(r"(?i)address already in use")
            .unwrap()
    }

    #[test]
    fn state_graph_edges() {
        use ProcessState::*;
        assert!(ProcessState::is_valid_transition(NotStarted, Spawning));
        assert!(ProcessState::is_valid_transition(AwaitingReady, Failed));
        assert!(ProcessState::is_valid_transition(Ready, Terminating));
        assert!(!ProcessState::is_valid_transition(Ready, Failed));
        assert!(!ProcessState::is_valid_transition(Stopped, Spawning));
        assert!(Failed.is_terminal());
        assert!(!Ready.is_terminal());
    }

    #[test]
    fn allocate_port_returns_bindable_port() {
        let port = allocate_port().unwrap();
        assert!(port > 0);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn launch_resolves_on_marker_after_noise() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(
            tmp.path(),
            "svc.sh",
            "read -r pw\necho booting\necho 'warn: slow disk' >&2\necho \"READY ws://127.0.0.1:9\"\necho \"READY ws://ignored\"\nexec sleep 30\n",
        );
        let spec = LaunchSpec::new(ProcessRole::Runtime, bin, patterns());
        let bus = EventBus::new();

        let (mut sup, endpoint) = Supervisor::launch(&spec, &Secret::new("pw"), &bus)
            .await
            .unwrap();
        assert_eq!(endpoint, "ws://127.0.0.1:9");
        assert_eq!(sup.state(), ProcessState::Ready);
        assert!(sup.pid().is_some());
        assert!(sup.is_running());

        assert!(sup.terminate());
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert!(!sup.terminate(), "second terminate is a no-op");
    }

    #[tokio::test]
    async fn launch_uses_fallback_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(tmp.path(), "svc.sh", "echo 'Conductor ready.'\nexec sleep 30\n");
        let mut spec = LaunchSpec::new(
            ProcessRole::Runtime,
            bin,
            OutputPatterns::new(ReadinessMatcher::new(r"(?i)conductor ready").unwrap()),
        );
        spec.fallback_endpoint = Some("ws://127.0.0.1:4000".to_string());

        let (mut sup, endpoint) = Supervisor::launch(&spec, &Secret::new("pw"), &EventBus::new())
            .await
            .unwrap();
        assert_eq!(endpoint, "ws://127.0.0.1:4000");
        sup.terminate();
    }

    #[tokio::test]
    async fn launch_fails_with_stderr_tail_when_child_exits_early() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(
            tmp.path(),
            "svc.sh",
            "read -r pw\necho \"passphrase rejected\" >&2\nexit 3\n",
        );
        let spec = LaunchSpec::new(ProcessRole::Keystore, bin, patterns());

        let err = Supervisor::launch(&spec, &Secret::new("pw"), &EventBus::new())
            .await
            .unwrap_err();
        match err {
            LauncherError::Launch {
                role, stderr_tail, ..
            } => {
                assert_eq!(role, ProcessRole::Keystore);
                assert!(stderr_tail.iter().any(|l| l.contains("passphrase rejected")));
            }
            other => panic!("expected Launch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_reports_port_bind_distinctly() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(
            tmp.path(),
            "svc.sh",
            "echo 'Error: Address already in use (os error 98)' >&2\nexit 1\n",
        );
        let mut spec = LaunchSpec::new(ProcessRole::Runtime, bin, patterns());
        spec.port = Some(54321);

        let err = Supervisor::launch(&spec, &Secret::new("pw"), &EventBus::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, LauncherError::PortBind { port: 54321, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn launch_missing_binary_is_spawn_error() {
        let spec = LaunchSpec::new(ProcessRole::Keystore, "/nonexistent/keystore", patterns());
        let err = Supervisor::launch(&spec, &Secret::new("pw"), &EventBus::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/keystore"));
    }

    #[tokio::test]
    async fn secret_goes_to_stdin_not_argv() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(
            tmp.path(),
            "svc.sh",
            "read -r pw\necho \"args=$# READY stdin:$pw\"\nexec sleep 30\n",
        );
        let spec = LaunchSpec::new(
            ProcessRole::Keystore,
            bin,
            OutputPatterns::new(ReadinessMatcher::new(r"args=0 READY (\S+)").unwrap()),
        );
        let (mut sup, endpoint) = Supervisor::launch(&spec, &Secret::new("s3cret"), &EventBus::new())
            .await
            .unwrap();
        assert_eq!(endpoint, "stdin:s3cret");
        sup.terminate();
    }

    #[tokio::test]
    async fn output_lines_are_published_on_log_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(tmp.path(), "svc.sh", "echo hello\necho 'READY x'\nexec sleep 30\n");
        let spec = LaunchSpec::new(ProcessRole::Runtime, bin, patterns());
        let bus = EventBus::new();
        let mut logs = bus.subscribe(EventChannel::Log);

        let (mut sup, _) = Supervisor::launch(&spec, &Secret::new("pw"), &bus).await.unwrap();
        let first = logs.recv().await.unwrap();
        assert_eq!(
            first,
            LauncherEvent::Log(LogLine {
                role: ProcessRole::Runtime,
                stream: OutputStream::Stdout,
                line: "hello".to_string(),
            })
        );
        sup.terminate();
    }

    #[tokio::test]
    async fn initialize_succeeds_on_zero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("initialized");
        let bin = write_script(
            tmp.path(),
            "init.sh",
            &format!("read -r pw\n[ \"$pw\" = \"pw1\" ] || exit 1\ntouch {}\n", marker.display()),
        );
        let spec = LaunchSpec::new(ProcessRole::Keystore, bin, patterns());
        Supervisor::initialize(&spec, &Secret::new("pw1"), &EventBus::new())
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn initialize_fails_on_nonzero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(tmp.path(), "init.sh", "echo 'cannot create dir' >&2\nexit 2\n");
        let spec = LaunchSpec::new(ProcessRole::Keystore, bin, patterns());
        let err = Supervisor::initialize(&spec, &Secret::new("pw1"), &EventBus::new())
            .await
            .unwrap_err();
        match err {
            LauncherError::Initialization { stderr_tail, .. } => {
                assert_eq!(stderr_tail, vec!["cannot create dir".to_string()]);
            }
            other => panic!("expected Initialization error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_version_captures_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_script(tmp.path(), "ks.sh", "echo \"lair-keystore 0.3.0\"\n");
        let version = query_version(ProcessRole::Keystore, &bin).await.unwrap();
        assert_eq!(version, "lair-keystore 0.3.0");
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let lines: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let tail = tail_of(lines.iter().map(String::as_str));
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.last().map(String::as_str), Some("line 99"));
    }

    #[test]
    fn wait_failure_keeps_stderr_tail() {
        let error = std::io::Error::other("interrupted");
        let mut tail = StderrTail::default();
        tail.push("bind: address in use".to_string());

        match wait_failure(ProcessRole::Runtime, &error, tail, false) {
            LauncherError::Launch {
                role,
                reason,
                stderr_tail,
            } => {
                assert_eq!(role, ProcessRole::Runtime);
                assert!(reason.contains("interrupted"), "{reason}");
                assert_eq!(stderr_tail, vec!["bind: address in use".to_string()]);
            }
            other => panic!("expected Launch error, got {other:?}"),
        }

        let mut tail = StderrTail::default();
        tail.push("cannot create dir".to_string());
        let err = wait_failure(ProcessRole::Keystore, &error, tail, true);
        assert!(matches!(
            err,
            LauncherError::Initialization { role: ProcessRole::Keystore, ref stderr_tail, .. }
                if stderr_tail.len() == 1
        ));
    }
}
