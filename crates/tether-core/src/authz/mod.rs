//! Window authorization map: which agent may each window sign for.
//!
//! A binding is created from data the launcher itself handed to the window
//! when it was opened. Nothing the window sends afterwards can change it:
//! every signing request re-checks its claimed provenance against the bound
//! agent, and only an exact match yields a signer selector.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{LauncherError, LauncherResult};

/// Identifier the window host assigns to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public key of one signing identity. Hex on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgentPubKey(Vec<u8>);

impl AgentPubKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }
}

impl fmt::Debug for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentPubKey({})", self.to_hex())
    }
}

impl fmt::Display for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for AgentPubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AgentPubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Which signing backend a request is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignerSelector {
    /// The launcher's own keystore.
    Default,
    /// The signer belonging to an externally-run runtime.
    Custom { admin_port: u16 },
}

/// One window's grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBinding {
    pub window_id: WindowId,
    pub agent: AgentPubKey,
    /// Present only for windows of an externally-run runtime.
    pub admin_port: Option<u16>,
    pub data_root: String,
    pub installed_app_id: String,
}

impl WindowBinding {
    fn selector(&self) -> SignerSelector {
        match self.admin_port {
            Some(admin_port) => SignerSelector::Custom { admin_port },
            None => SignerSelector::Default,
        }
    }
}

/// The map itself. Every method is a single critical section.
#[derive(Debug, Default)]
pub struct WindowAuthorizations {
    bindings: Mutex<HashMap<WindowId, WindowBinding>>,
}

impl WindowAuthorizations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WindowId, WindowBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, binding: WindowBinding) -> LauncherResult<()> {
        let mut bindings = self.lock();
        if bindings.contains_key(&binding.window_id) {
            warn!(window_id = %binding.window_id, "refusing to rebind window");
            return Err(LauncherError::DuplicateBinding(binding.window_id));
        }
        debug!(
            window_id = %binding.window_id,
            data_root = %binding.data_root,
            app = %binding.installed_app_id,
            "window bound"
        );
        bindings.insert(binding.window_id, binding);
        Ok(())
    }

    /// Drop a window's grant. Absent windows are ignored.
    pub fn unbind(&self, window_id: WindowId) -> Option<WindowBinding> {
        let removed = self.lock().remove(&window_id);
        if removed.is_some() {
            debug!(%window_id, "window unbound");
        }
        removed
    }

    /// Check `provenance` against the agent bound to `window_id`.
    pub fn authorize(
        &self,
        window_id: WindowId,
        provenance: &AgentPubKey,
    ) -> LauncherResult<SignerSelector> {
        let bindings = self.lock();
        let binding = bindings
            .get(&window_id)
            .ok_or(LauncherError::NotBound(window_id))?;
        if binding.agent.as_bytes() != provenance.as_bytes() {
            warn!(%window_id, claimed = %provenance, "provenance mismatch");
            return Err(LauncherError::UnauthorizedProvenance(window_id));
        }
        Ok(binding.selector())
    }

    pub fn binding(&self, window_id: WindowId) -> Option<WindowBinding> {
        self.lock().get(&window_id).cloned()
    }

    /// The open window for an application, if there is one.
    pub fn window_for_app(&self, data_root: &str, installed_app_id: &str) -> Option<WindowId> {
        self.lock()
            .values()
            .find(|b| b.data_root == data_root && b.installed_app_id == installed_app_id)
            .map(|b| b.window_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
