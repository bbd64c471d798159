use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::api;
use crate::config;
use crate::data::{self, AuthService, ComposeService, PostService, UserService};
use crate::session;
use crate::storage;
use crate::ui;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    init_logging(&cfg);
    let config_path = config::default_path();
    let display_path = friendly_path(config_path.as_ref());

    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
    let session = Arc::new(session::Store::new(store.clone()));

    let client = Arc::new(
        api::Client::new(
            session.clone(),
            api::ClientConfig {
                user_agent: cfg.api.user_agent.clone(),
                base_url: Some(cfg.api.base_url.clone()),
                timeout: Some(cfg.api.request_timeout),
                http_client: None,
            },
        )
        .context("build api client")?,
    );

    let post_service: Arc<dyn PostService> = Arc::new(data::DeyoPostService::new(client.clone()));
    let user_service: Arc<dyn UserService> = Arc::new(data::DeyoUserService::new(client.clone()));
    let auth_service: Arc<dyn AuthService> = Arc::new(data::DeyoAuthService::new(client.clone()));
    let compose_service: Arc<dyn ComposeService> =
        Arc::new(data::DeyoComposeService::new(client));

    let options = ui::Options {
        status_message:
            "Browsing Deyo. j/k navigate, Enter opens, Tab switches filter, q quits.".to_string(),
        post_service,
        user_service,
        auth_service,
        compose_service,
        session,
        page_size: cfg.feed.page_size,
        config_path: display_path,
    };

    let mut model = ui::Model::new(options);
    model.run()?;

    Ok(())
}

/// The terminal belongs to the UI, so logs go to a file under the cache
/// directory. When no directory is available, logging is simply off.
fn init_logging(cfg: &config::Config) {
    let Some(dir) = cfg.log.dir.clone() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("deyo-tui.log"))
    else {
        return;
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init();
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/deyo-tui/config.yaml".to_string()
    }
}
