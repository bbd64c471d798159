use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::api::{ApiError, PostDetail};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub request_id: u64,
    pub slug: String,
    pub cancel_flag: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct FetchResponse {
    pub request_id: u64,
    pub slug: String,
    pub result: Result<PostDetail, ApiError>,
}

struct PendingFetch {
    request_id: u64,
    slug: String,
    cancel_flag: Arc<AtomicBool>,
}

/// One post, resolved by slug. Every slug change re-fetches; nothing is
/// cached across slugs. A slug change while a fetch is in flight
/// supersedes it, so the displayed post always matches the latest slug.
pub struct Fetcher {
    slug: Option<String>,
    post: Option<PostDetail>,
    loading: bool,
    error: Option<ApiError>,
    pending: Option<PendingFetch>,
    next_request_id: u64,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            slug: None,
            post: None,
            loading: false,
            error: None,
            pending: None,
            next_request_id: 1,
        }
    }

    pub fn post(&self) -> Option<&PostDetail> {
        self.post.as_ref()
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    /// Begin fetching `slug`. Returns `None` when that slug is already the
    /// current one; a different slug always fetches, superseding whatever
    /// was in flight.
    pub fn load(&mut self, slug: &str) -> Option<FetchRequest> {
        if self.slug.as_deref() == Some(slug) {
            return None;
        }
        self.cancel_pending();
        self.slug = Some(slug.to_string());
        self.post = None;
        self.error = None;

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingFetch {
            request_id,
            slug: slug.to_string(),
            cancel_flag: cancel_flag.clone(),
        });
        self.loading = true;
        debug!(request_id, slug, "issuing post fetch");
        Some(FetchRequest {
            request_id,
            slug: slug.to_string(),
            cancel_flag,
        })
    }

    /// Leave the single-post view; in-flight work is discarded.
    pub fn close(&mut self) {
        self.cancel_pending();
        self.slug = None;
        self.post = None;
        self.error = None;
    }

    pub fn apply(&mut self, response: FetchResponse) {
        let Some(pending) = &self.pending else {
            return;
        };
        if pending.cancel_flag.load(Ordering::SeqCst)
            || pending.request_id != response.request_id
            || pending.slug != response.slug
        {
            debug!(
                request_id = response.request_id,
                slug = %response.slug,
                "dropping superseded post fetch"
            );
            return;
        }
        self.pending = None;
        self.loading = false;
        match response.result {
            Ok(post) => self.post = Some(post),
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

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Post;
    use chrono::{TimeZone, Utc};

    fn post(slug: &str) -> Post {
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Post {
            id: format!("id-{slug}"),
            slug: slug.into(),
            title: format!("Post {slug}"),
            content_html: "<p>body</p>".into(),
            tags: Vec::new(),
            cover_image_url: String::new(),
            author_id: "u1".into(),
            created_at: stamp,
            updated_at: stamp,
            read_time_minutes: 1,
        }
    }

    #[test]
    fn fetch_resolves_to_the_post() {
        let mut fetcher = Fetcher::new();
        let request = fetcher.load("hello-world").unwrap();
        assert!(fetcher.loading());

        fetcher.apply(FetchResponse {
            request_id: request.request_id,
            slug: request.slug.clone(),
            result: Ok(post("hello-world")),
        });
        assert_eq!(fetcher.post().map(|p| p.slug.as_str()), Some("hello-world"));
        assert!(!fetcher.loading());
        assert!(fetcher.error().is_none());
    }

    #[test]
    fn slug_change_discards_the_earlier_result() {
        let mut fetcher = Fetcher::new();
        let for_a = fetcher.load("a").unwrap();
        let for_b = fetcher.load("b").unwrap();
        assert!(for_a.cancel_flag.load(Ordering::SeqCst));

        // "a" resolves late; the displayed post must still become "b".
        fetcher.apply(FetchResponse {
            request_id: for_a.request_id,
            slug: for_a.slug.clone(),
            result: Ok(post("a")),
        });
        assert!(fetcher.post().is_none());
        assert!(fetcher.loading());

        fetcher.apply(FetchResponse {
            request_id: for_b.request_id,
            slug: for_b.slug.clone(),
            result: Ok(post("b")),
        });
        assert_eq!(fetcher.post().map(|p| p.slug.as_str()), Some("b"));
    }

    #[test]
    fn missing_post_surfaces_as_error() {
        let mut fetcher = Fetcher::new();
        let request = fetcher.load("gone").unwrap();
        fetcher.apply(FetchResponse {
            request_id: request.request_id,
            slug: request.slug.clone(),
            result: Err(ApiError::NotFound("post not found".into())),
        });
        assert!(fetcher.post().is_none());
        assert!(!fetcher.loading());
        assert!(matches!(fetcher.error(), Some(ApiError::NotFound(_))));
    }

    #[test]
    fn same_slug_is_fetched_once() {
        let mut fetcher = Fetcher::new();
        let request = fetcher.load("a").unwrap();
        assert!(fetcher.load("a").is_none());
        assert!(!request.cancel_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn returning_to_a_slug_refetches_it() {
        let mut fetcher = Fetcher::new();
        let first = fetcher.load("a").unwrap();
        fetcher.apply(FetchResponse {
            request_id: first.request_id,
            slug: first.slug.clone(),
            result: Ok(post("a")),
        });
        fetcher.load("b").unwrap();
        // No cross-slug cache: "a" goes back to the network.
        assert!(fetcher.load("a").is_some());
    }

    #[test]
    fn close_cancels_and_clears() {
        let mut fetcher = Fetcher::new();
        let request = fetcher.load("a").unwrap();
        fetcher.close();
        assert!(request.cancel_flag.load(Ordering::SeqCst));
        assert!(fetcher.post().is_none());
        assert!(!fetcher.loading());
    }
}
