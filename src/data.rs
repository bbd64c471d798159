use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::{
    self, ApiError, AuthPayload, NewPost, PostDetail, PostPage, PostPatch, PostSummary,
    UserProfile,
};

pub trait PostService: Send + Sync {
    fn list_posts(&self, page: u32, page_size: u32) -> Result<PostPage, ApiError>;
    fn own_posts(&self, user_id: &str, page: u32, page_size: u32) -> Result<PostPage, ApiError>;
    fn post_by_slug(&self, slug: &str) -> Result<PostDetail, ApiError>;
}

pub trait UserService: Send + Sync {
    fn profile(&self, id: &str) -> Result<UserProfile, ApiError>;
    fn me(&self) -> Result<UserProfile, ApiError>;
}

pub trait AuthService: Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError>;
    fn register(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError>;
}

pub trait ComposeService: Send + Sync {
    fn create(&self, draft: &NewPost) -> Result<PostDetail, ApiError>;
    fn update(&self, id: &str, patch: &PostPatch) -> Result<PostDetail, ApiError>;
    fn delete(&self, id: &str) -> Result<String, ApiError>;
}

pub struct DeyoPostService {
    client: Arc<api::Client>,
}

impl DeyoPostService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl PostService for DeyoPostService {
    fn list_posts(&self, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        self.client.posts(page, page_size)
    }

    fn own_posts(&self, user_id: &str, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        self.client.my_posts(user_id, page, page_size)
    }

    fn post_by_slug(&self, slug: &str) -> Result<PostDetail, ApiError> {
        self.client.post_by_slug(slug)
    }
}

pub struct DeyoUserService {
    client: Arc<api::Client>,
}

impl DeyoUserService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl UserService for DeyoUserService {
    fn profile(&self, id: &str) -> Result<UserProfile, ApiError> {
        self.client.user(id)
    }

    fn me(&self) -> Result<UserProfile, ApiError> {
        self.client.me()
    }
}

pub struct DeyoAuthService {
    client: Arc<api::Client>,
}

impl DeyoAuthService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl AuthService for DeyoAuthService {
    fn login(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError> {
        self.client.login(username, password)
    }

    fn register(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError> {
        self.client.register(username, password)
    }
}

pub struct DeyoComposeService {
    client: Arc<api::Client>,
}

impl DeyoComposeService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ComposeService for DeyoComposeService {
    fn create(&self, draft: &NewPost) -> Result<PostDetail, ApiError> {
        self.client.create_post(draft)
    }

    fn update(&self, id: &str, patch: &PostPatch) -> Result<PostDetail, ApiError> {
        self.client.update_post(id, patch)
    }

    fn delete(&self, id: &str) -> Result<String, ApiError> {
        self.client.delete_post(id)
    }
}

/// In-memory post collection that pages a fixture list. Doubles as the
/// sync-layer test double and the offline placeholder service.
#[derive(Default)]
pub struct MockPostService {
    posts: RwLock<Vec<PostSummary>>,
    calls: AtomicUsize,
}

impl MockPostService {
    pub fn with_posts(posts: Vec<PostSummary>) -> Self {
        Self {
            posts: RwLock::new(posts),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn page_of(posts: &[PostSummary], page: u32, page_size: u32) -> PostPage {
        let len = posts.len() as u32;
        let total_pages = if page_size == 0 {
            0
        } else {
            len.div_ceil(page_size)
        };
        let start = page.saturating_sub(1).saturating_mul(page_size) as usize;
        let end = (start + page_size as usize).min(posts.len());
        let window = if start >= posts.len() {
            Vec::new()
        } else {
            posts[start..end].to_vec()
        };
        PostPage {
            posts: window,
            total_pages,
        }
    }
}

impl PostService for MockPostService {
    fn list_posts(&self, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let posts = self.posts.read();
        Ok(Self::page_of(&posts, page, page_size))
    }

    fn own_posts(&self, user_id: &str, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let posts = self.posts.read();
        let own: Vec<PostSummary> = posts
            .iter()
            .filter(|post| post.author_id == user_id)
            .cloned()
            .collect();
        Ok(Self::page_of(&own, page, page_size))
    }

    fn post_by_slug(&self, slug: &str) -> Result<PostDetail, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let posts = self.posts.read();
        posts
            .iter()
            .find(|post| post.slug == slug)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("post not found".into()))
    }
}

#[derive(Default)]
pub struct MockUserService {
    profiles: RwLock<HashMap<String, UserProfile>>,
    calls: AtomicUsize,
}

impl MockUserService {
    pub fn with_profiles(profiles: Vec<UserProfile>) -> Self {
        Self {
            profiles: RwLock::new(
                profiles
                    .into_iter()
                    .map(|profile| (profile.id.clone(), profile))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UserService for MockUserService {
    fn profile(&self, id: &str) -> Result<UserProfile, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("user not found".into()))
    }

    fn me(&self) -> Result<UserProfile, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .read()
            .values()
            .next()
            .cloned()
            .ok_or_else(|| ApiError::Server {
                status: 401,
                message: "unauthorized".into(),
            })
    }
}
