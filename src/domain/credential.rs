//! Bearer credentials and the provider contract.
//!
//! The connection layer never caches a [`Credential`]: it asks its
//! [`CredentialProvider`] afresh before every connection attempt, so login,
//! logout and token rotation take effect at the next (re)connect.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};

/// A bearer token pair as returned by the controller's `/login` endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque access token.
    #[serde(rename = "access_token")]
    pub token: String,
    /// Authorization scheme, normally `bearer`.
    #[serde(rename = "token_type")]
    pub token_type: String,
}

impl Credential {
    /// Creates a credential from its parts.
    #[must_use]
    pub fn new(token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type: token_type.into(),
        }
    }

    /// Creates a `Bearer` credential.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(token, "Bearer")
    }

    /// Value for the `Authorization` request header.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

// Tokens must never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Supplies the current credential on demand.
///
/// Returns a boxed future so that implementations backed by a remote store
/// can suspend without blocking other channels.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Resolves the credential to use for the next connection attempt, or
    /// `None` if the user is logged out.
    fn current(&self) -> BoxFuture<'_, Option<Credential>>;
}

/// In-memory credential store updated by login/logout.
///
/// Cheap to clone; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<Option<Credential>>>,
}

impl CredentialStore {
    /// Creates an empty (logged out) store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `credential`.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        store.login(credential);
        store
    }

    /// Stores a new credential, replacing any previous one.
    pub fn login(&self, credential: Credential) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    /// Clears the stored credential. Open connections are left alone.
    pub fn logout(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns a copy of the stored credential.
    #[must_use]
    pub fn get(&self) -> Option<Credential> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` if a credential is stored.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl CredentialProvider for CredentialStore {
    fn current(&self) -> BoxFuture<'_, Option<Credential>> {
        Box::pin(future::ready(self.get()))
    }
}
