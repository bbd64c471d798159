use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::api::{ApiError, PostPage, PostSummary};
use crate::session;

pub const DEFAULT_PAGE_SIZE: u32 = 5;

/// Rows of slack tolerated when deciding the viewport rests at its end.
/// Exact equality under-triggers when the final page lands mid-row.
pub const SCROLL_EPSILON: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    All,
    Mine,
}

impl Filter {
    pub fn label(&self) -> &'static str {
        match self {
            Filter::All => "All Posts",
            Filter::Mine => "My Posts",
        }
    }
}

/// Backend collection a page request routes to. "Mine" without a session
/// identity falls back to the public collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection {
    Public,
    Own { user_id: String },
}

/// Accumulated result set for one filter. Items only ever grow within the
/// filter's lifetime; a refresh starts a new lifetime.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub items: Vec<PostSummary>,
    /// Highest page requested so far; 0 before the first request.
    pub cursor: u32,
    /// 0 until the first response reports the real count.
    pub total_pages: u32,
    pub loading: bool,
    pub last_error: Option<ApiError>,
}

/// A page fetch the caller is expected to run. The cancel flag is shared
/// with the paginator; once it flips, the fetch's outcome must be thrown
/// away without calling `apply`-side handlers.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub request_id: u64,
    pub filter: Filter,
    pub collection: Collection,
    pub page: u32,
    pub page_size: u32,
    pub cancel_flag: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct PageResponse {
    pub request_id: u64,
    pub filter: Filter,
    pub result: Result<PostPage, ApiError>,
}

struct PendingPage {
    request_id: u64,
    filter: Filter,
    page: u32,
    cancel_flag: Arc<AtomicBool>,
}

/// The feed core: one retained accumulator per filter, an explicit cursor,
/// and at most one page request in flight. Every parameter change
/// supersedes the outstanding request, so a late response can never land
/// in the wrong accumulator or out of order.
pub struct Paginator {
    session: Arc<session::Store>,
    page_size: u32,
    filter: Filter,
    all: FeedState,
    mine: FeedState,
    pending: Option<PendingPage>,
    next_request_id: u64,
}

impl Paginator {
    pub fn new(session: Arc<session::Store>, page_size: u32) -> Self {
        Self {
            session,
            page_size,
            filter: Filter::All,
            all: FeedState::default(),
            mine: FeedState::default(),
            pending: None,
            next_request_id: 1,
        }
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn state(&self) -> &FeedState {
        self.state_for(self.filter)
    }

    pub fn state_for(&self, filter: Filter) -> &FeedState {
        match filter {
            Filter::All => &self.all,
            Filter::Mine => &self.mine,
        }
    }

    fn state_mut(&mut self, filter: Filter) -> &mut FeedState {
        match filter {
            Filter::All => &mut self.all,
            Filter::Mine => &mut self.mine,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    /// More pages are known to exist beyond the current cursor.
    pub fn has_more(&self) -> bool {
        let state = self.state();
        state.total_pages > state.cursor
    }

    /// Switch the visible filter. Retained items for the target filter show
    /// instantly; a fetch is only issued when that filter has never loaded.
    /// Any in-flight request is superseded either way.
    pub fn select_filter(&mut self, filter: Filter) -> Option<PageRequest> {
        if filter == self.filter {
            return None;
        }
        self.cancel_pending();
        self.filter = filter;
        if self.state().cursor == 0 {
            return Some(self.issue(filter, 1));
        }
        debug!(filter = filter.label(), "filter switch served from retained items");
        None
    }

    /// Drop the current filter's accumulator and start over from page 1.
    pub fn refresh(&mut self) -> Option<PageRequest> {
        self.cancel_pending();
        let filter = self.filter;
        *self.state_mut(filter) = FeedState::default();
        Some(self.issue(filter, 1))
    }

    /// Move the cursor forward one page. A no-op while a fetch is in
    /// flight, before the first page has been requested, or once the
    /// cursor has reached the reported total.
    pub fn advance(&mut self) -> Option<PageRequest> {
        if self.pending.is_some() {
            return None;
        }
        let filter = self.filter;
        let state = self.state();
        if state.cursor == 0 || state.total_pages <= state.cursor {
            return None;
        }
        let next = state.cursor + 1;
        Some(self.issue(filter, next))
    }

    /// First load for the startup filter.
    pub fn start(&mut self) -> Option<PageRequest> {
        if self.pending.is_some() || self.state().cursor != 0 {
            return None;
        }
        let filter = self.filter;
        Some(self.issue(filter, 1))
    }

    pub fn apply(&mut self, response: PageResponse) {
        let Some(pending) = &self.pending else {
            debug!(request_id = response.request_id, "dropping response with no pending request");
            return;
        };
        if pending.cancel_flag.load(Ordering::SeqCst)
            || pending.request_id != response.request_id
            || pending.filter != response.filter
        {
            debug!(request_id = response.request_id, "dropping superseded page response");
            return;
        }
        self.pending = None;

        let state = self.state_mut(response.filter);
        state.loading = false;
        match response.result {
            Ok(page) => {
                state.total_pages = page.total_pages;
                state.items.extend(page.posts);
                state.last_error = None;
            }
            Err(err) => {
                // The accumulator stays exactly as it was.
                state.last_error = Some(err);
            }
        }
    }

    fn issue(&mut self, filter: Filter, page: u32) -> PageRequest {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let state = self.state_mut(filter);
        state.cursor = page;
        state.loading = true;
        state.last_error = None;

        self.pending = Some(PendingPage {
            request_id,
            filter,
            page,
            cancel_flag: cancel_flag.clone(),
        });

        let collection = self.resolve_collection(filter);
        debug!(
            request_id,
            filter = filter.label(),
            page,
            "issuing feed page request"
        );
        PageRequest {
            request_id,
            filter,
            collection,
            page,
            page_size: self.page_size,
            cancel_flag,
        }
    }

    fn resolve_collection(&self, filter: Filter) -> Collection {
        match filter {
            Filter::All => Collection::Public,
            Filter::Mine => match self.session.identity() {
                Some(profile) => Collection::Own {
                    user_id: profile.id,
                },
                None => {
                    debug!("no session identity; own-posts filter falls back to public feed");
                    Collection::Public
                }
            },
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
            self.state_mut(pending.filter).loading = false;
            debug!(
                request_id = pending.request_id,
                page = pending.page,
                "superseding in-flight page request"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollSample {
    pub scroll_top: u64,
    pub viewport_height: u64,
    pub scroll_height: u64,
}

impl ScrollSample {
    fn at_bottom(&self) -> bool {
        self.scroll_height
            .saturating_sub(self.scroll_top + self.viewport_height)
            <= SCROLL_EPSILON
    }
}

/// Pure bottom-reach detector. `observe` fires exactly once per crossing
/// into the bottom state; resting there yields nothing further until the
/// viewport leaves the bottom (e.g. a fetched page grows the content).
#[derive(Debug, Default)]
pub struct ScrollAdvancer {
    was_at_bottom: bool,
}

impl ScrollAdvancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: ScrollSample) -> bool {
        let at_bottom = sample.at_bottom();
        let crossed = at_bottom && !self.was_at_bottom;
        self.was_at_bottom = at_bottom;
        crossed
    }

    pub fn reset(&mut self) {
        self.was_at_bottom = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Post, UserProfile};
    use crate::storage;
    use chrono::{TimeZone, Utc};
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

    fn post(id: &str) -> Post {
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Post {
            id: id.into(),
            slug: format!("slug-{id}"),
            title: format!("Post {id}"),
            content_html: "<p>body</p>".into(),
            tags: vec!["tag".into()],
            cover_image_url: String::new(),
            author_id: "u9".into(),
            created_at: stamp,
            updated_at: stamp,
            read_time_minutes: 2,
        }
    }

    fn page_of(ids: &[&str], total_pages: u32) -> PostPage {
        PostPage {
            posts: ids.iter().map(|id| post(id)).collect(),
            total_pages,
        }
    }

    fn ok_response(request: &PageRequest, page: PostPage) -> PageResponse {
        PageResponse {
            request_id: request.request_id,
            filter: request.filter,
            result: Ok(page),
        }
    }

    #[test]
    fn pages_accumulate_additively_until_the_total() {
        // Page size 5, 12 posts, 3 pages.
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);

        let req = paginator.start().unwrap();
        assert_eq!(req.page, 1);
        paginator.apply(ok_response(&req, page_of(&["1", "2", "3", "4", "5"], 3)));
        assert_eq!(paginator.state().items.len(), 5);
        assert_eq!(paginator.state().total_pages, 3);

        let req = paginator.advance().unwrap();
        assert_eq!(req.page, 2);
        paginator.apply(ok_response(&req, page_of(&["6", "7", "8", "9", "10"], 3)));

        let req = paginator.advance().unwrap();
        assert_eq!(req.page, 3);
        paginator.apply(ok_response(&req, page_of(&["11", "12"], 3)));

        assert_eq!(paginator.state().items.len(), 12);
        assert_eq!(paginator.state().total_pages, 3);
        assert!(!paginator.has_more());

        // Beyond the reported total the cursor refuses to move.
        assert!(paginator.advance().is_none());
        assert_eq!(paginator.state().cursor, 3);
    }

    #[test]
    fn advance_is_a_noop_while_a_fetch_is_in_flight() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&["1"], 3)));

        let inflight = paginator.advance().unwrap();
        assert!(paginator.advance().is_none());
        paginator.apply(ok_response(&inflight, page_of(&["2"], 3)));
        assert!(paginator.advance().is_some());
    }

    #[test]
    fn advance_requires_a_first_page_and_a_known_total() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        // Nothing requested yet: the advancer may not trigger the initial load.
        assert!(paginator.advance().is_none());

        let req = paginator.start().unwrap();
        // Total still unknown while page 1 is in flight.
        assert!(paginator.advance().is_none());
        paginator.apply(ok_response(&req, page_of(&["1"], 1)));
        // Single page: nothing more.
        assert!(paginator.advance().is_none());
    }

    #[test]
    fn filter_switch_issues_page_one_and_keeps_accumulators_apart() {
        let (_dir, session) = session_store();
        session.set_credential("tok").unwrap();
        session
            .set_identity(&UserProfile {
                id: "u1".into(),
                display_name: "me".into(),
                avatar_url: None,
            })
            .unwrap();
        let mut paginator = Paginator::new(session, 5);

        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&["a1", "a2"], 1)));

        let req = paginator.select_filter(Filter::Mine).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(
            req.collection,
            Collection::Own {
                user_id: "u1".into()
            }
        );
        paginator.apply(ok_response(&req, page_of(&["m1"], 1)));

        assert_eq!(paginator.state_for(Filter::All).items.len(), 2);
        assert_eq!(paginator.state_for(Filter::Mine).items.len(), 1);
        assert!(paginator
            .state_for(Filter::Mine)
            .items
            .iter()
            .all(|p| p.id.starts_with('m')));

        // Switching back serves retained items without a fetch.
        assert!(paginator.select_filter(Filter::All).is_none());
        assert_eq!(paginator.state().items.len(), 2);
    }

    #[test]
    fn own_filter_without_session_routes_to_public_collection() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        paginator.start();
        let req = paginator.select_filter(Filter::Mine).unwrap();
        assert_eq!(req.collection, Collection::Public);
    }

    #[test]
    fn superseded_response_never_mutates_state() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);

        let stale = paginator.start().unwrap();
        // Filter change supersedes the in-flight page 1 fetch.
        let fresh = paginator.select_filter(Filter::Mine).unwrap();
        assert!(stale.cancel_flag.load(Ordering::SeqCst));

        paginator.apply(ok_response(&stale, page_of(&["a1", "a2"], 9)));
        assert!(paginator.state_for(Filter::All).items.is_empty());
        assert_eq!(paginator.state_for(Filter::All).total_pages, 0);

        paginator.apply(ok_response(&fresh, page_of(&["m1"], 1)));
        assert_eq!(paginator.state_for(Filter::Mine).items.len(), 1);
    }

    #[test]
    fn refresh_starts_a_new_accumulator_lifetime() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&["1", "2"], 2)));

        let req = paginator.refresh().unwrap();
        assert_eq!(req.page, 1);
        assert!(paginator.state().items.is_empty());
        paginator.apply(ok_response(&req, page_of(&["1"], 1)));
        assert_eq!(paginator.state().items.len(), 1);
    }

    #[test]
    fn a_failed_page_leaves_the_accumulator_untouched() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&["1", "2", "3", "4", "5"], 3)));

        let req = paginator.advance().unwrap();
        paginator.apply(PageResponse {
            request_id: req.request_id,
            filter: req.filter,
            result: Err(ApiError::Server {
                status: 500,
                message: "boom".into(),
            }),
        });

        let state = paginator.state();
        assert_eq!(state.items.len(), 5);
        assert!(state.last_error.is_some());
        assert!(!state.loading);
    }

    #[test]
    fn a_failure_in_one_filter_never_touches_the_other() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&["a1"], 1)));

        let req = paginator.select_filter(Filter::Mine).unwrap();
        paginator.apply(PageResponse {
            request_id: req.request_id,
            filter: req.filter,
            result: Err(ApiError::Network("offline".into())),
        });

        assert!(paginator.state_for(Filter::Mine).last_error.is_some());
        assert_eq!(paginator.state_for(Filter::All).items.len(), 1);
        assert!(paginator.state_for(Filter::All).last_error.is_none());
    }

    #[test]
    fn an_empty_page_still_updates_the_total() {
        let (_dir, session) = session_store();
        let mut paginator = Paginator::new(session, 5);
        let req = paginator.start().unwrap();
        paginator.apply(ok_response(&req, page_of(&[], 0)));
        assert!(paginator.state().items.is_empty());
        assert_eq!(paginator.state().total_pages, 0);
        assert!(!paginator.has_more());
    }

    #[test]
    fn bottom_crossing_fires_once_until_the_viewport_leaves() {
        let mut advancer = ScrollAdvancer::new();
        let bottom = ScrollSample {
            scroll_top: 80,
            viewport_height: 20,
            scroll_height: 100,
        };
        let middle = ScrollSample {
            scroll_top: 40,
            viewport_height: 20,
            scroll_height: 100,
        };

        assert!(advancer.observe(bottom));
        // Resting at the bottom does not re-fire.
        assert!(!advancer.observe(bottom));
        assert!(!advancer.observe(middle));
        assert!(advancer.observe(bottom));
    }

    #[test]
    fn bottom_detection_tolerates_one_row_of_slack() {
        let mut advancer = ScrollAdvancer::new();
        assert!(advancer.observe(ScrollSample {
            scroll_top: 79,
            viewport_height: 20,
            scroll_height: 100,
        }));

        advancer.reset();
        assert!(!advancer.observe(ScrollSample {
            scroll_top: 78,
            viewport_height: 20,
            scroll_height: 100,
        }));
    }

    #[test]
    fn content_shorter_than_the_viewport_counts_as_bottom() {
        let mut advancer = ScrollAdvancer::new();
        assert!(advancer.observe(ScrollSample {
            scroll_top: 0,
            viewport_height: 40,
            scroll_height: 12,
        }));
    }
}
