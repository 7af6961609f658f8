//! Error taxonomy shared by every component of the supervisor.

use std::path::PathBuf;

use crate::authz::WindowId;
use crate::supervisor::ProcessRole;

/// Result alias used throughout `tether-core`.
pub type LauncherResult<T> = Result<T, LauncherError>;

/// Every failure the supervisor can surface to its callers.
///
/// Process failures carry the captured stderr tail so that the operator
/// can tell a missing binary from a rejected secret or a busy port.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("failed to spawn {role} binary at '{}': {source}", binary.display())]
    Spawn {
        role: ProcessRole,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} initialization failed: {reason}{}", format_tail(stderr_tail))]
    Initialization {
        role: ProcessRole,
        reason: String,
        stderr_tail: Vec<String>,
    },

    #[error("{role} exited before becoming ready: {reason}{}", format_tail(stderr_tail))]
    Launch {
        role: ProcessRole,
        reason: String,
        stderr_tail: Vec<String>,
    },

    #[error("{role} could not bind port {port}{}", format_tail(stderr_tail))]
    PortBind {
        role: ProcessRole,
        port: u16,
        stderr_tail: Vec<String>,
    },

    #[error("a launch for data root '{0}' is already in progress")]
    AlreadyLaunching(String),

    #[error("a runtime for data root '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no running runtime registered for data root '{0}'")]
    UnknownDataRoot(String),

    #[error("window {0} is already bound to an agent")]
    DuplicateBinding(WindowId),

    #[error("window {0} is not bound to any agent")]
    NotBound(WindowId),

    #[error("provenance does not match the agent bound to window {0}")]
    UnauthorizedProvenance(WindowId),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("admin API error: {0}")]
    Admin(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("window host error: {0}")]
    Window(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LauncherError {
    /// Stable machine-readable code for this error, used on the RPC wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SPAWN_ERROR",
            Self::Initialization { .. } => "INITIALIZATION_ERROR",
            Self::Launch { .. } => "LAUNCH_ERROR",
            Self::PortBind { .. } => "PORT_BIND_ERROR",
            Self::AlreadyLaunching(_) => "ALREADY_LAUNCHING",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::UnknownDataRoot(_) => "UNKNOWN_DATA_ROOT",
            Self::DuplicateBinding(_) => "DUPLICATE_BINDING",
            Self::NotBound(_) => "NOT_BOUND",
            Self::UnauthorizedProvenance(_) => "UNAUTHORIZED_PROVENANCE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Admin(_) => "ADMIN_ERROR",
            Self::Signing(_) => "SIGNING_ERROR",
            Self::Window(_) => "WINDOW_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Captured stderr lines attached to a process failure, if any.
    pub fn stderr_tail(&self) -> &[String] {
        match self {
            Self::Initialization { stderr_tail, .. }
            | Self::Launch { stderr_tail, .. }
            | Self::PortBind { stderr_tail, .. } => stderr_tail,
            _ => &[],
        }
    }
}

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\nstderr:\n{}", tail.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_includes_stderr_tail() {
        let err = LauncherError::Launch {
            role: ProcessRole::Keystore,
            reason: "exit status: 1".to_string(),
            stderr_tail: vec!["bad passphrase".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("keystore exited before becoming ready"));
        assert!(msg.contains("bad passphrase"));
        assert_eq!(err.stderr_tail(), ["bad passphrase".to_string()]);
    }

    #[test]
    fn error_without_tail_has_no_stderr_section() {
        let err = LauncherError::Launch {
            role: ProcessRole::Runtime,
            reason: "exit status: 2".to_string(),
            stderr_tail: vec![],
        };
        assert!(!err.to_string().contains("stderr:"));
    }

    #[test]
    fn codes_are_distinct_for_port_and_launch() {
        let port = LauncherError::PortBind {
            role: ProcessRole::Runtime,
            port: 54321,
            stderr_tail: vec![],
        };
        let launch = LauncherError::Launch {
            role: ProcessRole::Runtime,
            reason: "x".to_string(),
            stderr_tail: vec![],
        };
        assert_eq!(port.code(), "PORT_BIND_ERROR");
        assert_eq!(launch.code(), "LAUNCH_ERROR");
    }

    #[test]
    fn authorization_error_display() {
        let err = LauncherError::UnauthorizedProvenance(WindowId(7));
        assert_eq!(
            err.to_string(),
            "provenance does not match the agent bound to window 7"
        );
    }
}
