use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::api::{ApiError, CredentialProvider, UserProfile};
use crate::storage;

/// The one piece of state shared between components. Everything else reads
/// it; only the methods here write it, and every write goes through to the
/// persisted store.
pub struct Store {
    storage: Arc<storage::Store>,
    inner: RwLock<State>,
}

#[derive(Debug, Clone, Default)]
struct State {
    credential: Option<String>,
    identity: Option<UserProfile>,
    hydrated: bool,
}

impl Store {
    pub fn new(storage: Arc<storage::Store>) -> Self {
        Self {
            storage,
            inner: RwLock::new(State::default()),
        }
    }

    /// Pull the persisted credential and identity into memory. Idempotent;
    /// later calls are no-ops so an in-session login is never clobbered.
    pub fn hydrate(&self) -> Result<()> {
        {
            let inner = self.inner.read();
            if inner.hydrated {
                return Ok(());
            }
        }
        let persisted = self.storage.load_session()?;
        let mut inner = self.inner.write();
        if inner.hydrated {
            return Ok(());
        }
        inner.credential = persisted.credential;
        inner.identity = persisted.identity;
        inner.hydrated = true;
        debug!(
            has_credential = inner.credential.is_some(),
            has_identity = inner.identity.is_some(),
            "session hydrated from storage"
        );
        Ok(())
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.read().credential.clone()
    }

    pub fn identity(&self) -> Option<UserProfile> {
        self.inner.read().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().credential.is_some()
    }

    pub fn set_credential(&self, token: &str) -> Result<()> {
        self.storage.save_credential(token)?;
        self.inner.write().credential = Some(token.to_string());
        Ok(())
    }

    pub fn set_identity(&self, profile: &UserProfile) -> Result<()> {
        self.storage.save_identity(profile)?;
        self.inner.write().identity = Some(profile.clone());
        Ok(())
    }

    /// Logout. Credential and identity go together, both here and on disk.
    pub fn clear(&self) -> Result<()> {
        self.storage.clear_session()?;
        let mut inner = self.inner.write();
        inner.credential = None;
        inner.identity = None;
        Ok(())
    }
}

impl CredentialProvider for Store {
    fn credential(&self) -> Option<String> {
        Store::credential(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    NotStarted,
    Resolving,
    Resolved,
    Skipped,
}

/// Request minted by `Hydrator::begin`; the caller runs the who-am-i lookup
/// and feeds the outcome back through `apply`.
#[derive(Debug, Clone, Copy)]
pub struct WhoAmIRequest {
    pub request_id: u64,
}

/// Resolves the persisted credential into an identity once per process.
/// A failed resolution is recorded and the machine still lands in
/// `Resolved`: the user browses as unauthenticated until the next run.
pub struct Hydrator {
    state: HydrationState,
    request_id: u64,
    error: Option<ApiError>,
}

impl Default for Hydrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Hydrator {
    pub fn new() -> Self {
        Self {
            state: HydrationState::NotStarted,
            request_id: 0,
            error: None,
        }
    }

    pub fn state(&self) -> HydrationState {
        self.state
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    /// Decide, once, whether a who-am-i lookup is needed. Returns the
    /// request to run, or `None` when hydration is skipped or already done.
    pub fn begin(&mut self, store: &Store) -> Option<WhoAmIRequest> {
        if self.state != HydrationState::NotStarted {
            return None;
        }
        if store.credential().is_none() || store.identity().is_some() {
            self.state = HydrationState::Skipped;
            debug!("session hydration skipped");
            return None;
        }
        self.state = HydrationState::Resolving;
        self.request_id = self.request_id.wrapping_add(1);
        Some(WhoAmIRequest {
            request_id: self.request_id,
        })
    }

    pub fn apply(
        &mut self,
        store: &Store,
        request_id: u64,
        result: Result<UserProfile, ApiError>,
    ) -> Result<()> {
        if self.state != HydrationState::Resolving || request_id != self.request_id {
            return Ok(());
        }
        match result {
            Ok(profile) => {
                debug!(user = %profile.id, "session identity resolved");
                store.set_identity(&profile)?;
            }
            Err(err) => {
                warn!(%err, "session hydration failed");
                self.error = Some(err);
            }
        }
        self.state = HydrationState::Resolved;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        (dir, Arc::new(Store::new(storage)))
    }

    fn profile() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            display_name: "deyo".into(),
            avatar_url: None,
        }
    }

    #[test]
    fn hydrate_pulls_persisted_session() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        storage.save_credential("tok").unwrap();
        storage.save_identity(&profile()).unwrap();

        let store = Store::new(storage);
        store.hydrate().unwrap();
        assert_eq!(store.credential().as_deref(), Some("tok"));
        assert_eq!(store.identity(), Some(profile()));
    }

    #[test]
    fn hydrate_is_idempotent() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("fresh").unwrap();
        store.hydrate().unwrap();
        assert_eq!(store.credential().as_deref(), Some("fresh"));
    }

    #[test]
    fn clear_wipes_credential_and_identity_together() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("tok").unwrap();
        store.set_identity(&profile()).unwrap();
        store.clear().unwrap();
        assert!(store.credential().is_none());
        assert!(store.identity().is_none());
    }

    #[test]
    fn hydrator_skips_without_credential() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        let mut hydrator = Hydrator::new();
        assert!(hydrator.begin(&store).is_none());
        assert_eq!(hydrator.state(), HydrationState::Skipped);
    }

    #[test]
    fn hydrator_skips_when_identity_already_present() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("tok").unwrap();
        store.set_identity(&profile()).unwrap();
        let mut hydrator = Hydrator::new();
        assert!(hydrator.begin(&store).is_none());
        assert_eq!(hydrator.state(), HydrationState::Skipped);
    }

    #[test]
    fn hydrator_resolves_identity_once() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("tok").unwrap();

        let mut hydrator = Hydrator::new();
        let request = hydrator.begin(&store).unwrap();
        assert_eq!(hydrator.state(), HydrationState::Resolving);

        hydrator
            .apply(&store, request.request_id, Ok(profile()))
            .unwrap();
        assert_eq!(hydrator.state(), HydrationState::Resolved);
        assert_eq!(store.identity(), Some(profile()));

        // One shot per mount: a second begin never issues.
        assert!(hydrator.begin(&store).is_none());
    }

    #[test]
    fn hydration_failure_resolves_without_identity() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("tok").unwrap();

        let mut hydrator = Hydrator::new();
        let request = hydrator.begin(&store).unwrap();
        hydrator
            .apply(
                &store,
                request.request_id,
                Err(ApiError::Network("connection reset".into())),
            )
            .unwrap();
        assert_eq!(hydrator.state(), HydrationState::Resolved);
        assert!(store.identity().is_none());
        assert!(matches!(hydrator.error(), Some(ApiError::Network(_))));
    }

    #[test]
    fn stale_hydration_result_is_ignored() {
        let (_dir, store) = open_store();
        store.hydrate().unwrap();
        store.set_credential("tok").unwrap();

        let mut hydrator = Hydrator::new();
        let request = hydrator.begin(&store).unwrap();
        hydrator
            .apply(&store, request.request_id.wrapping_add(7), Ok(profile()))
            .unwrap();
        assert_eq!(hydrator.state(), HydrationState::Resolving);
        assert!(store.identity().is_none());
    }
}
