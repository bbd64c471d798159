use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::api::{ApiError, UserProfile};
use crate::session;

/// A profile lookup the caller is expected to run.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub request_id: u64,
    pub user_id: String,
    pub cancel_flag: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct LookupResponse {
    pub request_id: u64,
    pub user_id: String,
    pub result: Result<UserProfile, ApiError>,
}

struct PendingLookup {
    request_id: u64,
    user_id: String,
    cancel_flag: Arc<AtomicBool>,
}

/// Resolves a user identifier to a public profile. The caller's own
/// identity is answered straight from the session store, synchronously and
/// without a lookup; anything else goes to the network, superseding any
/// lookup still in flight for a previous identifier.
pub struct Resolver {
    session: Arc<session::Store>,
    user_id: Option<String>,
    profile: Option<UserProfile>,
    loading: bool,
    error: Option<ApiError>,
    pending: Option<PendingLookup>,
    next_request_id: u64,
}

impl Resolver {
    pub fn new(session: Arc<session::Store>) -> Self {
        Self {
            session,
            user_id: None,
            profile: None,
            loading: false,
            error: None,
            pending: None,
            next_request_id: 1,
        }
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    /// Point the resolver at an identifier. Returns the lookup to run, or
    /// `None` when resolution was immediate (absent identifier, session
    /// short-circuit) or the identifier is unchanged.
    pub fn resolve(&mut self, user_id: Option<&str>) -> Option<LookupRequest> {
        if self.user_id.as_deref() == user_id {
            return None;
        }
        self.cancel_pending();
        self.user_id = user_id.map(str::to_string);
        self.profile = None;
        self.error = None;
        self.loading = false;

        let id = user_id?;
        if let Some(own) = self.session.identity() {
            if own.id == id {
                self.profile = Some(own);
                return None;
            }
        }

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingLookup {
            request_id,
            user_id: id.to_string(),
            cancel_flag: cancel_flag.clone(),
        });
        self.loading = true;
        debug!(request_id, user = id, "issuing profile lookup");
        Some(LookupRequest {
            request_id,
            user_id: id.to_string(),
            cancel_flag,
        })
    }

    pub fn apply(&mut self, response: LookupResponse) {
        let Some(pending) = &self.pending else {
            return;
        };
        if pending.cancel_flag.load(Ordering::SeqCst)
            || pending.request_id != response.request_id
            || pending.user_id != response.user_id
        {
            debug!(
                request_id = response.request_id,
                "dropping superseded profile lookup"
            );
            return;
        }
        self.pending = None;
        self.loading = false;
        match response.result {
            Ok(profile) => self.profile = Some(profile),
            Err(err) => self.error = Some(err),
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
            self.loading = false;
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;
    use tempfile::tempdir;

    fn session_store() -> (tempfile::TempDir, Arc<session::Store>) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        let store = Arc::new(session::Store::new(storage));
        store.hydrate().unwrap();
        (dir, store)
    }

    fn own_profile() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            display_name: "me".into(),
            avatar_url: None,
        }
    }

    fn other_profile() -> UserProfile {
        UserProfile {
            id: "u2".into(),
            display_name: "other".into(),
            avatar_url: None,
        }
    }

    #[test]
    fn absent_identifier_resolves_to_nothing_without_a_lookup() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);
        assert!(resolver.resolve(None).is_none());
        assert!(resolver.profile().is_none());
        assert!(!resolver.loading());
    }

    #[test]
    fn own_identity_short_circuits_with_zero_lookups() {
        let (_dir, session) = session_store();
        session.set_credential("tok").unwrap();
        session.set_identity(&own_profile()).unwrap();

        let mut resolver = Resolver::new(session);
        // First observation already carries the profile, not a loading state.
        assert!(resolver.resolve(Some("u1")).is_none());
        assert_eq!(resolver.profile(), Some(&own_profile()));
        assert!(!resolver.loading());
    }

    #[test]
    fn unknown_identifier_goes_to_the_network() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);

        let request = resolver.resolve(Some("u2")).unwrap();
        assert_eq!(request.user_id, "u2");
        assert!(resolver.loading());

        resolver.apply(LookupResponse {
            request_id: request.request_id,
            user_id: request.user_id.clone(),
            result: Ok(other_profile()),
        });
        assert_eq!(resolver.profile(), Some(&other_profile()));
        assert!(!resolver.loading());
    }

    #[test]
    fn lookup_failure_sets_error_and_clears_loading() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);
        let request = resolver.resolve(Some("u2")).unwrap();
        resolver.apply(LookupResponse {
            request_id: request.request_id,
            user_id: request.user_id.clone(),
            result: Err(ApiError::NotFound("no such user".into())),
        });
        assert!(resolver.profile().is_none());
        assert!(!resolver.loading());
        assert!(matches!(resolver.error(), Some(ApiError::NotFound(_))));
    }

    #[test]
    fn identifier_change_supersedes_the_inflight_lookup() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);

        let first = resolver.resolve(Some("u2")).unwrap();
        let second = resolver.resolve(Some("u3")).unwrap();
        assert!(first.cancel_flag.load(Ordering::SeqCst));

        // The stale resolution must not touch any state.
        resolver.apply(LookupResponse {
            request_id: first.request_id,
            user_id: first.user_id.clone(),
            result: Ok(other_profile()),
        });
        assert!(resolver.profile().is_none());
        assert!(resolver.loading());

        resolver.apply(LookupResponse {
            request_id: second.request_id,
            user_id: second.user_id.clone(),
            result: Ok(UserProfile {
                id: "u3".into(),
                display_name: "third".into(),
                avatar_url: None,
            }),
        });
        assert_eq!(resolver.profile().map(|p| p.id.as_str()), Some("u3"));
    }

    #[test]
    fn repeated_resolve_for_the_same_identifier_is_silent() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);
        let request = resolver.resolve(Some("u2")).unwrap();
        assert!(resolver.resolve(Some("u2")).is_none());
        assert!(!request.cancel_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn disposal_cancels_the_inflight_lookup() {
        let (_dir, session) = session_store();
        let mut resolver = Resolver::new(session);
        let request = resolver.resolve(Some("u2")).unwrap();
        drop(resolver);
        assert!(request.cancel_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn after_logout_the_former_session_id_requires_a_lookup() {
        let (_dir, session) = session_store();
        session.set_credential("tok").unwrap();
        session.set_identity(&own_profile()).unwrap();

        let mut resolver = Resolver::new(session.clone());
        assert!(resolver.resolve(Some("u1")).is_none());

        session.clear().unwrap();
        let mut fresh = Resolver::new(session);
        let request = fresh.resolve(Some("u1"));
        assert!(request.is_some());
    }
}
