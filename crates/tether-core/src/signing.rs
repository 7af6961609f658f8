//! Gate in front of the signing backends.
//!
//! [`SigningGate::sign`] is the only path from a window to a signer. It runs
//! [`WindowAuthorizations::authorize`] on every call and forwards nothing
//! when that fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::authz::{AgentPubKey, SignerSelector, WindowAuthorizations, WindowId};
use crate::error::{LauncherError, LauncherResult};
use crate::secret::Secret;

/// A zome call as submitted by a window, before signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnsignedZomeCall {
    pub provenance: AgentPubKey,
    pub cell_id: serde_json::Value,
    pub zome_name: String,
    pub fn_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub cap_secret: Option<String>,
    pub nonce: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedZomeCall {
    #[serde(flatten)]
    pub call: UnsignedZomeCall,
    /// Hex-encoded signature bytes.
    pub signature: String,
}

/// A backend that signs on behalf of an agent.
#[async_trait]
pub trait ZomeCallSigner: Send + Sync {
    async fn sign(&self, call: &UnsignedZomeCall) -> LauncherResult<Vec<u8>>;
}

/// Where a signer connection should point.
#[derive(Debug, Clone, Copy)]
pub enum SignerTarget<'a> {
    /// The launcher's keystore, at its connection URL.
    Keystore { url: &'a str, secret: &'a Secret },
    /// The signer of a runtime run by someone else.
    External { admin_port: u16 },
}

#[async_trait]
pub trait SignerConnector: Send + Sync {
    async fn connect(&self, target: SignerTarget<'_>) -> LauncherResult<Arc<dyn ZomeCallSigner>>;
}

/// Registered signers keyed by selector, behind the authorization check.
#[derive(Default)]
pub struct SigningGate {
    signers: Mutex<HashMap<SignerSelector, Arc<dyn ZomeCallSigner>>>,
}

impl std::fmt::Debug for SigningGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let selectors: Vec<_> = self.lock().keys().copied().collect();
        f.debug_struct("SigningGate").field("signers", &selectors).finish()
    }
}

impl SigningGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SignerSelector, Arc<dyn ZomeCallSigner>>> {
        self.signers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, selector: SignerSelector, signer: Arc<dyn ZomeCallSigner>) {
        info!(?selector, "signer registered");
        self.lock().insert(selector, signer);
    }

    pub fn contains(&self, selector: SignerSelector) -> bool {
        self.lock().contains_key(&selector)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Authorize `call` for `window_id` and sign it with the selected backend.
    pub async fn sign(
        &self,
        authz: &WindowAuthorizations,
        window_id: WindowId,
        call: UnsignedZomeCall,
    ) -> LauncherResult<SignedZomeCall> {
        let selector = authz.authorize(window_id, &call.provenance)?;
        let signer = self.lock().get(&selector).cloned().ok_or_else(|| {
            LauncherError::Signing(format!("no signer available for {selector:?}"))
        })?;

        debug!(%window_id, zome = %call.zome_name, func = %call.fn_name, "signing zome call");
        let signature = signer.sign(&call).await?;
        Ok(SignedZomeCall {
            call,
            signature: hex::encode(signature),
        })
    }
}
