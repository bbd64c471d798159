use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{multipart, Client as HttpClient, RequestBuilder};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.deyo.blog/";

/// Seam through which the client picks up the current bearer credential.
/// Public endpoints go out without one; protected endpoints rely on the
/// session store providing it at request time.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// Anonymous access: never supplies a credential.
pub struct NoCredential;

impl CredentialProvider for NoCredential {
    fn credential(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("{message}")]
    Server { status: u16, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    fn transport(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Every response from the service wears the same envelope. It is decoded
/// exactly once, here; callers only ever see a typed payload or an
/// `ApiError`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    message: String,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    #[allow(dead_code)]
    errors: Value,
}

fn decode_payload<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, ApiError> {
    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|err| ApiError::Decode(err.to_string()))?;
    let message = if envelope.message.is_empty() {
        format!("request failed with status {}", status.as_u16())
    } else {
        envelope.message
    };
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(message));
    }
    if !status.is_success() {
        return Err(ApiError::Server {
            status: status.as_u16(),
            message,
        });
    }
    envelope
        .data
        .ok_or_else(|| ApiError::Decode("envelope data missing on success".into()))
}

/// Like `decode_payload`, for endpoints whose success carries only a message.
fn decode_message(status: StatusCode, body: &str) -> Result<String, ApiError> {
    let envelope: Envelope<Value> =
        serde_json::from_str(body).map_err(|err| ApiError::Decode(err.to_string()))?;
    let message = if envelope.message.is_empty() {
        format!("request finished with status {}", status.as_u16())
    } else {
        envelope.message
    };
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(message));
    }
    if !status.is_success() {
        return Err(ApiError::Server {
            status: status.as_u16(),
            message,
        });
    }
    Ok(message)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(rename = "username")]
    pub display_name: String,
    #[serde(rename = "displayPhoto", default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub slug: String,
    pub title: String,
    #[serde(rename = "content", default)]
    pub content_html: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "image", default)]
    pub cover_image_url: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "readTime", default)]
    pub read_time_minutes: u32,
}

// Feed rows and the single-post view share one shape on this service.
pub type PostSummary = Post;
pub type PostDetail = Post;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    #[serde(default)]
    pub posts: Vec<PostSummary>,
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub title: String,
    pub content_html: String,
    pub tags: Vec<String>,
    pub cover_image: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PostPatch {
    pub title: Option<String>,
    pub content_html: Option<String>,
    pub tags: Option<Vec<String>>,
    pub cover_image: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    base_url: Url,
    user_agent: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(credentials: Arc<dyn CredentialProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("deyo client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            http,
            base_url,
            user_agent: config.user_agent,
            credentials,
        })
    }

    pub fn posts(&self, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        let req = self.request(
            Method::GET,
            "posts",
            &[
                ("page".into(), page.to_string()),
                ("pageSize".into(), page_size.to_string()),
            ],
        )?;
        self.execute(req)
    }

    pub fn my_posts(&self, user_id: &str, page: u32, page_size: u32) -> Result<PostPage, ApiError> {
        let req = self.request(
            Method::GET,
            &format!("posts/mine/{user_id}"),
            &[
                ("page".into(), page.to_string()),
                ("pageSize".into(), page_size.to_string()),
            ],
        )?;
        self.execute(req)
    }

    pub fn post_by_slug(&self, slug: &str) -> Result<PostDetail, ApiError> {
        let req = self.request(Method::GET, &format!("posts/{slug}"), &[])?;
        self.execute(req)
    }

    pub fn user(&self, id: &str) -> Result<UserProfile, ApiError> {
        let req = self.request(Method::GET, &format!("users/{id}"), &[])?;
        self.execute(req)
    }

    pub fn me(&self) -> Result<UserProfile, ApiError> {
        let req = self.request(Method::GET, "auth/me", &[])?;
        self.execute(req)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError> {
        let req = self.request(Method::POST, "auth/login", &[])?.json(
            &serde_json::json!({ "username": username, "password": password }),
        );
        self.execute(req)
    }

    pub fn register(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError> {
        let req = self.request(Method::POST, "auth/register", &[])?.json(
            &serde_json::json!({ "username": username, "password": password }),
        );
        self.execute(req)
    }

    pub fn create_post(&self, draft: &NewPost) -> Result<PostDetail, ApiError> {
        let mut form = multipart::Form::new()
            .text("title", draft.title.clone())
            .text("content", draft.content_html.clone());
        for tag in &draft.tags {
            form = form.text("tags", tag.clone());
        }
        if let Some(path) = &draft.cover_image {
            form = form
                .file("image", path)
                .map_err(|err| ApiError::Network(format!("attach cover image: {err}")))?;
        }
        let req = self.request(Method::POST, "posts", &[])?.multipart(form);
        self.execute(req)
    }

    pub fn update_post(&self, id: &str, patch: &PostPatch) -> Result<PostDetail, ApiError> {
        let mut form = multipart::Form::new();
        if let Some(title) = &patch.title {
            form = form.text("title", title.clone());
        }
        if let Some(content) = &patch.content_html {
            form = form.text("content", content.clone());
        }
        if let Some(tags) = &patch.tags {
            for tag in tags {
                form = form.text("tags", tag.clone());
            }
        }
        if let Some(path) = &patch.cover_image {
            form = form
                .file("image", path)
                .map_err(|err| ApiError::Network(format!("attach cover image: {err}")))?;
        }
        let req = self
            .request(Method::PATCH, &format!("posts/{id}"), &[])?
            .multipart(form);
        self.execute(req)
    }

    pub fn delete_post(&self, id: &str) -> Result<String, ApiError> {
        let req = self.request(Method::DELETE, &format!("posts/{id}"), &[])?;
        let resp = req.send().map_err(ApiError::transport)?;
        let status = resp.status();
        let body = resp.text().map_err(ApiError::transport)?;
        decode_message(status, &body)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<RequestBuilder, ApiError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| ApiError::Network(err.to_string()))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = self.credentials.credential() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(req)
    }

    fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req.send().map_err(ApiError::transport)?;
        let status = resp.status();
        let body = resp.text().map_err(ApiError::transport)?;
        decode_payload(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST_JSON: &str = r#"{
        "id": "p1",
        "slug": "first-post",
        "title": "First Post",
        "content": "<p>Hello</p>",
        "tags": ["intro", "meta"],
        "image": "https://cdn.deyo.blog/p1.png",
        "authorId": "u1",
        "createdAt": "2024-03-01T10:00:00.000Z",
        "updatedAt": "2024-03-02T11:30:00.000Z",
        "readTime": 3
    }"#;

    #[test]
    fn post_wire_names_map_to_domain_fields() {
        let post: Post = serde_json::from_str(POST_JSON).unwrap();
        assert_eq!(post.content_html, "<p>Hello</p>");
        assert_eq!(post.cover_image_url, "https://cdn.deyo.blog/p1.png");
        assert_eq!(post.read_time_minutes, 3);
        assert_eq!(post.author_id, "u1");
        assert_eq!(post.tags, vec!["intro", "meta"]);
    }

    #[test]
    fn profile_wire_names_map_to_domain_fields() {
        let profile: UserProfile = serde_json::from_str(
            r#"{"id": "u1", "username": "deyo", "displayPhoto": null}"#,
        )
        .unwrap();
        assert_eq!(profile.display_name, "deyo");
        assert!(profile.avatar_url.is_none());
    }

    #[test]
    fn decode_success_yields_data() {
        let body = format!(
            r#"{{"message": "ok", "data": {{"posts": [{POST_JSON}], "totalPages": 3}}, "errors": null}}"#
        );
        let page: PostPage = decode_payload(StatusCode::OK, &body).unwrap();
        assert_eq!(page.posts.len(), 1);
        assert_eq!(page.total_pages, 3);
    }

    #[test]
    fn decode_not_found_is_typed() {
        let body = r#"{"message": "post not found", "data": null, "errors": null}"#;
        let err = decode_payload::<PostDetail>(StatusCode::NOT_FOUND, body).unwrap_err();
        assert_eq!(err, ApiError::NotFound("post not found".into()));
    }

    #[test]
    fn decode_server_error_carries_status_and_message() {
        let body = r#"{"message": "token expired", "data": null, "errors": null}"#;
        let err = decode_payload::<UserProfile>(StatusCode::UNAUTHORIZED, body).unwrap_err();
        assert_eq!(
            err,
            ApiError::Server {
                status: 401,
                message: "token expired".into()
            }
        );
    }

    #[test]
    fn decode_success_without_data_is_malformed() {
        let body = r#"{"message": "ok", "data": null, "errors": null}"#;
        let err = decode_payload::<UserProfile>(StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn decode_message_for_delete() {
        let body = r#"{"message": "post deleted", "data": null, "errors": null}"#;
        let message = decode_message(StatusCode::OK, body).unwrap();
        assert_eq!(message, "post deleted");
    }

    #[test]
    fn client_requires_a_user_agent() {
        let err = Client::new(Arc::new(NoCredential), ClientConfig::default()).unwrap_err();
        assert!(err.to_string().contains("user agent"));
    }

    #[test]
    fn decode_garbage_is_a_decode_error() {
        let err = decode_payload::<PostPage>(StatusCode::OK, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
