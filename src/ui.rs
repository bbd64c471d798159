use std::collections::HashMap;
use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::Terminal;

use crate::api::{ApiError, AuthPayload, NewPost, PostDetail, PostPatch, PostSummary, UserProfile};
use crate::article;
use crate::data::{AuthService, ComposeService, PostService, UserService};
use crate::feed::{self, Collection, Filter, Paginator, ScrollAdvancer, ScrollSample};
use crate::identity;
use crate::render;
use crate::session::{self, Hydrator};

const SPINNER_FRAMES: [&str; 4] = ["|", "/", "-", "\\"];

pub struct Options {
    pub status_message: String,
    pub post_service: Arc<dyn PostService>,
    pub user_service: Arc<dyn UserService>,
    pub auth_service: Arc<dyn AuthService>,
    pub compose_service: Arc<dyn ComposeService>,
    pub session: Arc<session::Store>,
    pub page_size: u32,
    pub config_path: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum View {
    Feed,
    Article,
    Login,
    Compose,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoginField {
    Username,
    Password,
}

#[derive(Default)]
struct LoginForm {
    username: String,
    password: String,
    register_mode: bool,
    status: Option<String>,
    in_progress: bool,
    active: usize,
}

impl LoginForm {
    fn active_field(&self) -> LoginField {
        if self.active == 0 {
            LoginField::Username
        } else {
            LoginField::Password
        }
    }

    fn next(&mut self) {
        self.active = (self.active + 1) % 2;
    }

    fn insert_char(&mut self, ch: char) {
        match self.active_field() {
            LoginField::Username => self.username.push(ch),
            LoginField::Password => self.password.push(ch),
        }
        self.status = None;
    }

    fn backspace(&mut self) {
        match self.active_field() {
            LoginField::Username => {
                self.username.pop();
            }
            LoginField::Password => {
                self.password.pop();
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ComposeField {
    Title,
    Tags,
    Body,
}

struct ComposeForm {
    active: ComposeField,
    title: String,
    tags: String,
    body: String,
    status: Option<String>,
    in_progress: bool,
    editing: Option<String>,
}

impl ComposeForm {
    fn blank() -> Self {
        Self {
            active: ComposeField::Title,
            title: String::new(),
            tags: String::new(),
            body: String::new(),
            status: None,
            in_progress: false,
            editing: None,
        }
    }

    fn for_edit(post: &PostSummary) -> Self {
        Self {
            active: ComposeField::Title,
            title: post.title.clone(),
            tags: post.tags.join(", "),
            body: render::plain_body(&post.content_html),
            status: None,
            in_progress: false,
            editing: Some(post.id.clone()),
        }
    }

    fn next(&mut self) {
        self.active = match self.active {
            ComposeField::Title => ComposeField::Tags,
            ComposeField::Tags => ComposeField::Body,
            ComposeField::Body => ComposeField::Title,
        };
    }

    fn active_value_mut(&mut self) -> &mut String {
        match self.active {
            ComposeField::Title => &mut self.title,
            ComposeField::Tags => &mut self.tags,
            ComposeField::Body => &mut self.body,
        }
    }

    fn insert_char(&mut self, ch: char) {
        self.active_value_mut().push(ch);
        self.status = None;
    }

    fn backspace(&mut self) {
        self.active_value_mut().pop();
    }

    fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WhoAmIOrigin {
    Hydration,
    Login,
}

struct PendingWhoAmI {
    request_id: u64,
    origin: WhoAmIOrigin,
    cancel_flag: Arc<AtomicBool>,
}

struct PendingLogin {
    request_id: u64,
    register_mode: bool,
}

enum AsyncResponse {
    Posts(feed::PageResponse),
    Profile(identity::LookupResponse),
    Article(article::FetchResponse),
    WhoAmI {
        request_id: u64,
        result: Result<UserProfile, ApiError>,
    },
    Login {
        request_id: u64,
        result: Result<AuthPayload, ApiError>,
    },
    Published {
        result: Result<PostDetail, ApiError>,
        was_edit: bool,
    },
    Deleted {
        post_id: String,
        result: Result<String, ApiError>,
    },
}

pub struct Model {
    status_message: String,
    view: View,
    paginator: Paginator,
    advancer: ScrollAdvancer,
    article: article::Fetcher,
    hydrator: Hydrator,
    resolvers: HashMap<String, identity::Resolver>,
    renderer: render::Renderer,

    post_service: Arc<dyn PostService>,
    user_service: Arc<dyn UserService>,
    auth_service: Arc<dyn AuthService>,
    compose_service: Arc<dyn ComposeService>,
    session: Arc<session::Store>,
    page_size: u32,
    config_path: String,

    selected_post: usize,
    post_offset: usize,
    post_view_height: u16,
    content_scroll: u16,

    login_form: LoginForm,
    compose_form: ComposeForm,
    confirm_delete: Option<PostSummary>,

    pending_whoami: Option<PendingWhoAmI>,
    pending_login: Option<PendingLogin>,
    publish_in_progress: bool,
    delete_in_progress: bool,

    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    next_request_id: u64,
    spinner: Spinner,
    needs_redraw: bool,
}

impl Model {
    pub fn new(options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let paginator = Paginator::new(options.session.clone(), options.page_size);
        Self {
            status_message: options.status_message,
            view: View::Feed,
            paginator,
            advancer: ScrollAdvancer::new(),
            article: article::Fetcher::new(),
            hydrator: Hydrator::new(),
            resolvers: HashMap::new(),
            renderer: render::Renderer::new(),
            post_service: options.post_service,
            user_service: options.user_service,
            auth_service: options.auth_service,
            compose_service: options.compose_service,
            session: options.session,
            page_size: options.page_size,
            config_path: options.config_path,
            selected_post: 0,
            post_offset: 0,
            post_view_height: 0,
            content_scroll: 0,
            login_form: LoginForm::default(),
            compose_form: ComposeForm::blank(),
            confirm_delete: None,
            pending_whoami: None,
            pending_login: None,
            publish_in_progress: false,
            delete_in_progress: false,
            response_tx,
            response_rx,
            next_request_id: 1,
            spinner: Spinner::new(),
            needs_redraw: true,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        self.start_session();
        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| {
                    let area = frame.size();
                    self.draw(frame, area);
                })?;
                self.needs_redraw = false;
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match self.handle_key(key) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                                self.mark_dirty();
                            }
                        }
                    }
                }
            }

            if self.poll_async() {
                self.mark_dirty();
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.is_loading() && self.spinner.advance() {
                    self.mark_dirty();
                } else if !self.is_loading() {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.paginator.is_loading()
            || self.article.loading()
            || self.pending_whoami.is_some()
            || self.pending_login.is_some()
            || self.publish_in_progress
            || self.delete_in_progress
    }

    fn mint_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    // ---- startup -----------------------------------------------------

    fn start_session(&mut self) {
        if let Err(err) = self.session.hydrate() {
            self.status_message = format!("Failed to read saved session: {err}");
        }
        if let Some(request) = self.hydrator.begin(&self.session) {
            let cancel_flag = Arc::new(AtomicBool::new(false));
            self.pending_whoami = Some(PendingWhoAmI {
                request_id: request.request_id,
                origin: WhoAmIOrigin::Hydration,
                cancel_flag: cancel_flag.clone(),
            });
            self.spawn_whoami(request.request_id, cancel_flag);
        }
        if let Some(request) = self.paginator.start() {
            self.spawn_page_fetch(request);
        }
    }

    // ---- worker spawns -----------------------------------------------

    fn spawn_page_fetch(&mut self, request: feed::PageRequest) {
        let tx = self.response_tx.clone();
        let service = self.post_service.clone();
        thread::spawn(move || {
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = match &request.collection {
                Collection::Public => service.list_posts(request.page, request.page_size),
                Collection::Own { user_id } => {
                    service.own_posts(user_id, request.page, request.page_size)
                }
            };
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Posts(feed::PageResponse {
                request_id: request.request_id,
                filter: request.filter,
                result,
            }));
        });
    }

    fn spawn_profile_lookup(&mut self, request: identity::LookupRequest) {
        let tx = self.response_tx.clone();
        let service = self.user_service.clone();
        thread::spawn(move || {
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.profile(&request.user_id);
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Profile(identity::LookupResponse {
                request_id: request.request_id,
                user_id: request.user_id,
                result,
            }));
        });
    }

    fn spawn_article_fetch(&mut self, request: article::FetchRequest) {
        let tx = self.response_tx.clone();
        let service = self.post_service.clone();
        thread::spawn(move || {
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.post_by_slug(&request.slug);
            if request.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Article(article::FetchResponse {
                request_id: request.request_id,
                slug: request.slug,
                result,
            }));
        });
    }

    fn spawn_whoami(&mut self, request_id: u64, cancel_flag: Arc<AtomicBool>) {
        let tx = self.response_tx.clone();
        let service = self.user_service.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.me();
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::WhoAmI { request_id, result });
        });
    }

    fn spawn_login(&mut self, username: String, password: String, register_mode: bool) {
        let request_id = self.mint_request_id();
        self.pending_login = Some(PendingLogin {
            request_id,
            register_mode,
        });
        let tx = self.response_tx.clone();
        let service = self.auth_service.clone();
        thread::spawn(move || {
            let result = if register_mode {
                service.register(&username, &password)
            } else {
                service.login(&username, &password)
            };
            let _ = tx.send(AsyncResponse::Login { request_id, result });
        });
    }

    fn spawn_publish(&mut self, draft: NewPost, editing: Option<String>) {
        self.publish_in_progress = true;
        let tx = self.response_tx.clone();
        let service = self.compose_service.clone();
        thread::spawn(move || {
            let was_edit = editing.is_some();
            let result = match editing {
                Some(id) => {
                    let patch = PostPatch {
                        title: Some(draft.title),
                        content_html: Some(draft.content_html),
                        tags: Some(draft.tags),
                        cover_image: draft.cover_image,
                    };
                    service.update(&id, &patch)
                }
                None => service.create(&draft),
            };
            let _ = tx.send(AsyncResponse::Published { result, was_edit });
        });
    }

    fn spawn_delete(&mut self, post_id: String) {
        self.delete_in_progress = true;
        let tx = self.response_tx.clone();
        let service = self.compose_service.clone();
        thread::spawn(move || {
            let result = service.delete(&post_id);
            let _ = tx.send(AsyncResponse::Deleted { post_id, result });
        });
    }

    // ---- async responses ---------------------------------------------

    fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        changed
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Posts(response) => {
                let before = self.feed_len();
                self.paginator.apply(response);
                let len = self.feed_len();
                if len > before {
                    // The viewport content grew, so the next bottom reach is
                    // a fresh crossing.
                    self.advancer.reset();
                }
                if len > 0 && self.selected_post >= len {
                    self.selected_post = len - 1;
                }
                if let Some(err) = self.paginator.state().last_error.clone() {
                    self.status_message = format!("Failed to load posts: {err}");
                } else {
                    self.status_message = self.feed_status();
                }
                self.resolve_visible_authors();
            }
            AsyncResponse::Profile(response) => {
                if let Some(resolver) = self.resolvers.get_mut(&response.user_id) {
                    resolver.apply(response);
                }
            }
            AsyncResponse::Article(response) => {
                self.article.apply(response);
                let author = self.article.post().map(|post| post.author_id.clone());
                if let Some(author) = author {
                    self.ensure_author(&author);
                } else if let Some(err) = self.article.error() {
                    self.status_message = format!("Failed to load post: {err}");
                }
            }
            AsyncResponse::WhoAmI { request_id, result } => {
                let Some(pending) = &self.pending_whoami else {
                    return;
                };
                if pending.request_id != request_id
                    || pending.cancel_flag.load(Ordering::SeqCst)
                {
                    return;
                }
                let origin = pending.origin;
                self.pending_whoami = None;
                match origin {
                    WhoAmIOrigin::Hydration => {
                        if let Err(err) = self.hydrator.apply(&self.session, request_id, result) {
                            self.status_message = format!("Failed to save session: {err}");
                        }
                    }
                    WhoAmIOrigin::Login => match result {
                        Ok(profile) => {
                            let name = profile.display_name.clone();
                            if let Err(err) = self.session.set_identity(&profile) {
                                self.status_message = format!("Failed to save session: {err}");
                                return;
                            }
                            self.status_message = format!("Signed in as {name}.");
                            self.reset_feed();
                        }
                        Err(err) => {
                            self.status_message = format!("Signed in, but profile fetch failed: {err}");
                        }
                    },
                }
            }
            AsyncResponse::Login { request_id, result } => {
                let Some(pending) = &self.pending_login else {
                    return;
                };
                if pending.request_id != request_id {
                    return;
                }
                let register_mode = pending.register_mode;
                self.pending_login = None;
                self.login_form.in_progress = false;
                match result {
                    Ok(payload) => {
                        if let Err(err) = self.session.set_credential(&payload.token) {
                            self.login_form.status =
                                Some(format!("Failed to save credential: {err}"));
                            return;
                        }
                        self.view = View::Feed;
                        self.login_form = LoginForm::default();
                        self.status_message = if register_mode {
                            "Account created. Fetching profile...".to_string()
                        } else {
                            "Signed in. Fetching profile...".to_string()
                        };
                        let request_id = self.mint_request_id();
                        let cancel_flag = Arc::new(AtomicBool::new(false));
                        self.pending_whoami = Some(PendingWhoAmI {
                            request_id,
                            origin: WhoAmIOrigin::Login,
                            cancel_flag: cancel_flag.clone(),
                        });
                        self.spawn_whoami(request_id, cancel_flag);
                    }
                    Err(err) => {
                        self.login_form.status = Some(err.to_string());
                    }
                }
            }
            AsyncResponse::Published { result, was_edit } => {
                self.publish_in_progress = false;
                self.compose_form.in_progress = false;
                match result {
                    Ok(post) => {
                        self.status_message = if was_edit {
                            format!("Updated \"{}\".", post.title)
                        } else {
                            format!("Published \"{}\".", post.title)
                        };
                        self.compose_form = ComposeForm::blank();
                        self.view = View::Feed;
                        self.refresh_feed();
                    }
                    Err(err) => {
                        self.compose_form.status = Some(err.to_string());
                    }
                }
            }
            AsyncResponse::Deleted { post_id: _, result } => {
                self.delete_in_progress = false;
                match result {
                    Ok(message) => {
                        self.status_message = message;
                        if self.view == View::Article {
                            self.article.close();
                            self.view = View::Feed;
                        }
                        self.refresh_feed();
                    }
                    Err(err) => {
                        self.status_message = format!("Failed to delete post: {err}");
                    }
                }
            }
        }
        self.mark_dirty();
    }

    // ---- feed helpers ------------------------------------------------

    fn feed_len(&self) -> usize {
        self.paginator.state().items.len()
    }

    fn selected_summary(&self) -> Option<&PostSummary> {
        self.paginator.state().items.get(self.selected_post)
    }

    fn feed_status(&self) -> String {
        let state = self.paginator.state();
        if state.total_pages > 0 && !self.paginator.has_more() {
            format!(
                "{}: {} posts (all {} pages loaded).",
                self.paginator.filter().label(),
                state.items.len(),
                state.total_pages
            )
        } else {
            format!(
                "{}: {} posts, page {} of {}.",
                self.paginator.filter().label(),
                state.items.len(),
                state.cursor,
                state.total_pages
            )
        }
    }

    fn switch_filter(&mut self, filter: Filter) {
        if filter == Filter::Mine && !self.session.is_authenticated() {
            self.status_message = "Sign in (i) to see your own posts.".to_string();
            return;
        }
        if let Some(request) = self.paginator.select_filter(filter) {
            self.spawn_page_fetch(request);
        }
        self.selected_post = 0;
        self.post_offset = 0;
        self.advancer.reset();
        self.status_message = format!("Showing {}.", filter.label());
        self.resolve_visible_authors();
    }

    fn refresh_feed(&mut self) {
        if let Some(request) = self.paginator.refresh() {
            self.spawn_page_fetch(request);
        }
        self.selected_post = 0;
        self.post_offset = 0;
        self.advancer.reset();
    }

    fn reset_feed(&mut self) {
        self.paginator = Paginator::new(self.session.clone(), self.page_size);
        self.resolvers.clear();
        self.selected_post = 0;
        self.post_offset = 0;
        self.advancer.reset();
        if let Some(request) = self.paginator.start() {
            self.spawn_page_fetch(request);
        }
    }

    fn ensure_post_visible(&mut self) {
        let height = self.post_view_height.max(1) as usize;
        if self.selected_post < self.post_offset {
            self.post_offset = self.selected_post;
        } else if self.selected_post >= self.post_offset + height {
            self.post_offset = self.selected_post + 1 - height;
        }
    }

    fn after_feed_motion(&mut self) {
        self.ensure_post_visible();
        let sample = ScrollSample {
            scroll_top: self.post_offset as u64,
            viewport_height: self.post_view_height.max(1) as u64,
            scroll_height: self.feed_len() as u64,
        };
        if self.advancer.observe(sample) {
            if let Some(request) = self.paginator.advance() {
                self.status_message = format!(
                    "Loading page {} of {}...",
                    request.page,
                    self.paginator.filter().label()
                );
                self.spawn_page_fetch(request);
            }
        }
        self.resolve_visible_authors();
    }

    fn ensure_author(&mut self, author_id: &str) {
        let resolver = self
            .resolvers
            .entry(author_id.to_string())
            .or_insert_with(|| identity::Resolver::new(self.session.clone()));
        if let Some(request) = resolver.resolve(Some(author_id)) {
            self.spawn_profile_lookup(request);
        }
    }

    fn resolve_visible_authors(&mut self) {
        let height = self.post_view_height.max(1) as usize;
        let ids: Vec<String> = self
            .paginator
            .state()
            .items
            .iter()
            .skip(self.post_offset)
            .take(height)
            .map(|post| post.author_id.clone())
            .collect();
        for id in ids {
            self.ensure_author(&id);
        }
    }

    fn author_label(&self, author_id: &str) -> String {
        match self.resolvers.get(author_id) {
            Some(resolver) => match resolver.profile() {
                Some(profile) => profile.display_name.clone(),
                None if resolver.loading() => "...".to_string(),
                None => author_id.to_string(),
            },
            None => author_id.to_string(),
        }
    }

    fn owns(&self, post: &PostSummary) -> bool {
        self.session
            .identity()
            .map(|profile| profile.id == post.author_id)
            .unwrap_or(false)
    }

    fn logout(&mut self) -> Result<()> {
        self.session.clear()?;
        self.resolvers.clear();
        self.article.close();
        self.view = View::Feed;
        self.reset_feed();
        self.status_message = "Signed out.".to_string();
        Ok(())
    }

    // ---- key handling ------------------------------------------------

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if self.confirm_delete.is_some() {
            self.handle_delete_confirm_key(key.code);
            self.mark_dirty();
            return Ok(false);
        }
        let quit = match self.view {
            View::Feed => self.handle_feed_key(key)?,
            View::Article => self.handle_article_key(key)?,
            View::Login => self.handle_login_key(key),
            View::Compose => self.handle_compose_key(key),
        };
        self.mark_dirty();
        Ok(quit)
    }

    fn handle_feed_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => {
                if self.selected_post + 1 < self.feed_len() {
                    self.selected_post += 1;
                }
                self.after_feed_motion();
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected_post = self.selected_post.saturating_sub(1);
                self.after_feed_motion();
            }
            KeyCode::PageDown | KeyCode::Char(' ') => {
                let height = self.post_view_height.max(1) as usize;
                self.selected_post =
                    (self.selected_post + height).min(self.feed_len().saturating_sub(1));
                self.after_feed_motion();
            }
            KeyCode::PageUp => {
                let height = self.post_view_height.max(1) as usize;
                self.selected_post = self.selected_post.saturating_sub(height);
                self.after_feed_motion();
            }
            KeyCode::Char('G') | KeyCode::End => {
                self.selected_post = self.feed_len().saturating_sub(1);
                self.after_feed_motion();
            }
            KeyCode::Tab => {
                let next = match self.paginator.filter() {
                    Filter::All => Filter::Mine,
                    Filter::Mine => Filter::All,
                };
                self.switch_filter(next);
            }
            KeyCode::Char('r') => {
                self.refresh_feed();
                self.status_message = format!("Refreshing {}...", self.paginator.filter().label());
            }
            KeyCode::Enter => {
                let slug = self.selected_summary().map(|post| post.slug.clone());
                if let Some(slug) = slug {
                    self.view = View::Article;
                    self.content_scroll = 0;
                    if let Some(request) = self.article.load(&slug) {
                        self.spawn_article_fetch(request);
                    }
                }
            }
            KeyCode::Char('i') => {
                if self.session.is_authenticated() {
                    self.status_message = "Already signed in. Press o to sign out.".to_string();
                } else {
                    self.login_form = LoginForm::default();
                    self.view = View::Login;
                }
            }
            KeyCode::Char('o') => {
                if self.session.is_authenticated() {
                    self.logout()?;
                } else {
                    self.status_message = "Not signed in.".to_string();
                }
            }
            KeyCode::Char('n') => {
                if self.session.is_authenticated() {
                    self.compose_form = ComposeForm::blank();
                    self.view = View::Compose;
                } else {
                    self.status_message = "Sign in (i) to write a post.".to_string();
                }
            }
            KeyCode::Char('e') => {
                let post = self.selected_summary().cloned();
                match post {
                    Some(post) if self.owns(&post) => {
                        self.compose_form = ComposeForm::for_edit(&post);
                        self.view = View::Compose;
                    }
                    Some(_) => {
                        self.status_message = "You can only edit your own posts.".to_string();
                    }
                    None => {}
                }
            }
            KeyCode::Char('d') => {
                let post = self.selected_summary().cloned();
                match post {
                    Some(post) if self.owns(&post) => {
                        self.confirm_delete = Some(post);
                    }
                    Some(_) => {
                        self.status_message = "You can only delete your own posts.".to_string();
                    }
                    None => {}
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_article_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Esc | KeyCode::Char('h') | KeyCode::Backspace => {
                self.article.close();
                self.view = View::Feed;
                self.status_message = self.feed_status();
            }
            KeyCode::Char('j') | KeyCode::Down => {
                self.content_scroll = self.content_scroll.saturating_add(1);
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.content_scroll = self.content_scroll.saturating_sub(1);
            }
            KeyCode::PageDown | KeyCode::Char(' ') => {
                self.content_scroll = self.content_scroll.saturating_add(10);
            }
            KeyCode::PageUp => {
                self.content_scroll = self.content_scroll.saturating_sub(10);
            }
            KeyCode::Char('d') => {
                let post = self.article.post().cloned();
                if let Some(post) = post {
                    if self.owns(&post) {
                        self.confirm_delete = Some(post);
                    } else {
                        self.status_message = "You can only delete your own posts.".to_string();
                    }
                }
            }
            KeyCode::Char('e') => {
                let post = self.article.post().cloned();
                if let Some(post) = post {
                    if self.owns(&post) {
                        self.compose_form = ComposeForm::for_edit(&post);
                        self.view = View::Compose;
                    } else {
                        self.status_message = "You can only edit your own posts.".to_string();
                    }
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_login_key(&mut self, key: KeyEvent) -> bool {
        if self.login_form.in_progress {
            return false;
        }
        match key.code {
            KeyCode::Esc => {
                self.view = View::Feed;
                self.login_form = LoginForm::default();
            }
            KeyCode::Tab | KeyCode::Down | KeyCode::Up => self.login_form.next(),
            KeyCode::F(2) => {
                self.login_form.register_mode = !self.login_form.register_mode;
                self.login_form.status = None;
            }
            KeyCode::Enter => {
                let username = self.login_form.username.trim().to_string();
                let password = self.login_form.password.clone();
                if username.is_empty() || password.is_empty() {
                    self.login_form.status =
                        Some("Username and password are required.".to_string());
                    return false;
                }
                self.login_form.in_progress = true;
                self.login_form.status = None;
                let register_mode = self.login_form.register_mode;
                self.spawn_login(username, password, register_mode);
            }
            KeyCode::Backspace => self.login_form.backspace(),
            KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.login_form.insert_char(ch);
            }
            _ => {}
        }
        false
    }

    fn handle_compose_key(&mut self, key: KeyEvent) -> bool {
        if self.compose_form.in_progress {
            return false;
        }
        match key.code {
            KeyCode::Esc => {
                self.view = View::Feed;
                self.compose_form = ComposeForm::blank();
            }
            KeyCode::Tab => self.compose_form.next(),
            KeyCode::Char('s') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                let title = self.compose_form.title.trim().to_string();
                let body = self.compose_form.body.trim().to_string();
                if title.is_empty() || body.is_empty() {
                    self.compose_form.status = Some("Title and body are required.".to_string());
                    return false;
                }
                let draft = NewPost {
                    title,
                    content_html: draft_to_html(&body),
                    tags: self.compose_form.tag_list(),
                    cover_image: None,
                };
                let editing = self.compose_form.editing.clone();
                self.compose_form.in_progress = true;
                self.compose_form.status = None;
                self.spawn_publish(draft, editing);
            }
            KeyCode::Enter => {
                if self.compose_form.active == ComposeField::Body {
                    self.compose_form.insert_char('\n');
                } else {
                    self.compose_form.next();
                }
            }
            KeyCode::Backspace => self.compose_form.backspace(),
            KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.compose_form.insert_char(ch);
            }
            _ => {}
        }
        false
    }

    fn handle_delete_confirm_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('y') | KeyCode::Enter => {
                if let Some(post) = self.confirm_delete.take() {
                    self.status_message = format!("Deleting \"{}\"...", post.title);
                    self.spawn_delete(post.id);
                }
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                self.confirm_delete = None;
            }
            _ => {}
        }
    }

    // ---- drawing -----------------------------------------------------

    fn draw(&mut self, frame: &mut ratatui::Frame, area: Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(area);

        self.draw_header(frame, rows[0]);
        match self.view {
            View::Feed => self.draw_feed(frame, rows[1]),
            View::Article => self.draw_article(frame, rows[1]),
            View::Login => self.draw_login(frame, rows[1]),
            View::Compose => self.draw_compose(frame, rows[1]),
        }
        self.draw_status(frame, rows[2]);

        if self.confirm_delete.is_some() {
            self.draw_delete_confirm(frame, area);
        }
    }

    fn draw_header(&self, frame: &mut ratatui::Frame, area: Rect) {
        let selected = Style::default()
            .fg(Color::White)
            .add_modifier(Modifier::BOLD | Modifier::UNDERLINED);
        let dim = Style::default().fg(Color::DarkGray);
        let mut spans = vec![Span::styled(
            " All Posts ",
            if self.paginator.filter() == Filter::All {
                selected
            } else {
                dim
            },
        )];
        if self.session.is_authenticated() {
            spans.push(Span::raw(" "));
            spans.push(Span::styled(
                " My Posts ",
                if self.paginator.filter() == Filter::Mine {
                    selected
                } else {
                    dim
                },
            ));
        }
        let account = match self.session.identity() {
            Some(profile) => format!("{} · o sign out ", profile.display_name),
            None if self.session.is_authenticated() => "signed in ".to_string(),
            None => "i sign in ".to_string(),
        };
        let tabs = Line::from(spans);
        let account_line = Line::from(Span::styled(account, dim)).alignment(Alignment::Right);
        frame.render_widget(
            Paragraph::new(vec![tabs, account_line]).block(Block::default()),
            area,
        );
    }

    fn draw_feed(&mut self, frame: &mut ratatui::Frame, area: Rect) {
        let block = Block::default().borders(Borders::TOP);
        let inner = block.inner(area);
        frame.render_widget(block, area);

        self.post_view_height = inner.height;
        self.ensure_post_visible();

        let state = self.paginator.state();
        if state.items.is_empty() {
            let text = if state.loading {
                format!("{} Loading posts...", self.spinner.frame())
            } else if let Some(err) = &state.last_error {
                format!("Could not load posts: {err}\nPress r to retry.")
            } else {
                "No posts yet.".to_string()
            };
            frame.render_widget(
                Paragraph::new(text).alignment(Alignment::Center),
                centered_rect(inner, 60, 30),
            );
            return;
        }

        let height = inner.height.max(1) as usize;
        let mut lines: Vec<Line> = Vec::with_capacity(height);
        let window_end = (self.post_offset + height).min(state.items.len());
        for index in self.post_offset..window_end {
            let post = &state.items[index];
            let selected = index == self.selected_post;
            let marker = if selected { "> " } else { "  " };
            let author = self.author_label(&post.author_id);
            let meta = format!(
                " — {} · {} · {} min",
                author,
                post.created_at.format("%b %e, %Y"),
                post.read_time_minutes
            );
            let tags = if post.tags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", post.tags.join(", "))
            };
            let style = if selected {
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            let mut spans = vec![
                Span::styled(format!("{marker}{}", post.title), style),
                Span::styled(meta, Style::default().fg(Color::DarkGray)),
                Span::styled(tags, Style::default().fg(Color::DarkGray)),
            ];
            if selected {
                spans.push(Span::styled(
                    format!("  {}", render::plain_excerpt(&post.content_html, 60)),
                    Style::default().fg(Color::Gray),
                ));
            }
            lines.push(Line::from(spans));
        }
        if !self.paginator.has_more() && state.total_pages > 0 && window_end == state.items.len() {
            if lines.len() < height {
                lines.push(Line::from(Span::styled(
                    "  No more posts.",
                    Style::default().fg(Color::DarkGray),
                )));
            }
        }
        frame.render_widget(Paragraph::new(lines), inner);
    }

    fn draw_article(&mut self, frame: &mut ratatui::Frame, area: Rect) {
        let block = Block::default().borders(Borders::TOP);
        let inner = block.inner(area);
        frame.render_widget(block, area);

        if self.article.loading() {
            frame.render_widget(
                Paragraph::new(format!("{} Loading post...", self.spinner.frame()))
                    .alignment(Alignment::Center),
                centered_rect(inner, 60, 30),
            );
            return;
        }
        if let Some(err) = self.article.error() {
            frame.render_widget(
                Paragraph::new(format!("Could not load post: {err}\nEsc returns to the feed."))
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true }),
                centered_rect(inner, 60, 30),
            );
            return;
        }
        let Some(post) = self.article.post() else {
            return;
        };

        let author = self.author_label(&post.author_id);
        let mut lines = vec![
            Line::from(Span::styled(
                post.title.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                format!(
                    "{} · {} · {} min read",
                    author,
                    post.created_at.format("%B %e, %Y"),
                    post.read_time_minutes
                ),
                Style::default().fg(Color::DarkGray),
            )),
        ];
        if !post.tags.is_empty() {
            lines.push(Line::from(Span::styled(
                format!("[{}]", post.tags.join(", ")),
                Style::default().fg(Color::DarkGray),
            )));
        }
        lines.push(Line::default());
        let mut text = Text::from(lines);
        text.lines
            .extend(self.renderer.render(&post.content_html).lines);

        frame.render_widget(
            Paragraph::new(text)
                .wrap(Wrap { trim: false })
                .scroll((self.content_scroll, 0)),
            inner,
        );
    }

    fn draw_login(&self, frame: &mut ratatui::Frame, area: Rect) {
        let title = if self.login_form.register_mode {
            "Create an account"
        } else {
            "Sign in"
        };
        let active = self.login_form.active_field();
        let field = |label: &str, value: &str, focused: bool, masked: bool| {
            let shown = if masked {
                "*".repeat(value.chars().count())
            } else {
                value.to_string()
            };
            let style = if focused {
                Style::default().fg(Color::Cyan)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(format!("{label:>10}: "), Style::default().fg(Color::DarkGray)),
                Span::styled(shown, style),
                Span::styled(if focused { "_" } else { "" }, style),
            ])
        };

        let mut lines = vec![
            Line::from(Span::styled(
                title,
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::default(),
            field(
                "Username",
                &self.login_form.username,
                active == LoginField::Username,
                false,
            ),
            field(
                "Password",
                &self.login_form.password,
                active == LoginField::Password,
                true,
            ),
            Line::default(),
        ];
        if self.login_form.in_progress {
            lines.push(Line::from(format!("{} Signing in...", self.spinner.frame())));
        } else {
            lines.push(Line::from(Span::styled(
                "Enter submits · Tab switches fields · F2 toggles register · Esc cancels",
                Style::default().fg(Color::DarkGray),
            )));
        }
        if let Some(status) = &self.login_form.status {
            lines.push(Line::from(Span::styled(
                status.clone(),
                Style::default().fg(Color::Red),
            )));
        }
        frame.render_widget(
            Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Account ")),
            centered_rect(area, 70, 60),
        );
    }

    fn draw_compose(&self, frame: &mut ratatui::Frame, area: Rect) {
        let title = if self.compose_form.editing.is_some() {
            " Edit post "
        } else {
            " New post "
        };
        let focused = |field: ComposeField| {
            if self.compose_form.active == field {
                Style::default().fg(Color::Cyan)
            } else {
                Style::default()
            }
        };
        let mut lines = vec![
            Line::from(vec![
                Span::styled("Title: ", Style::default().fg(Color::DarkGray)),
                Span::styled(self.compose_form.title.clone(), focused(ComposeField::Title)),
            ]),
            Line::from(vec![
                Span::styled("Tags:  ", Style::default().fg(Color::DarkGray)),
                Span::styled(self.compose_form.tags.clone(), focused(ComposeField::Tags)),
            ]),
            Line::default(),
        ];
        for body_line in self.compose_form.body.split('\n') {
            lines.push(Line::from(Span::styled(
                body_line.to_string(),
                focused(ComposeField::Body),
            )));
        }
        lines.push(Line::default());
        if self.compose_form.in_progress {
            lines.push(Line::from(format!("{} Publishing...", self.spinner.frame())));
        } else {
            lines.push(Line::from(Span::styled(
                "Ctrl-S publishes · Tab switches fields · Esc discards",
                Style::default().fg(Color::DarkGray),
            )));
        }
        if let Some(status) = &self.compose_form.status {
            lines.push(Line::from(Span::styled(
                status.clone(),
                Style::default().fg(Color::Red),
            )));
        }
        frame.render_widget(
            Paragraph::new(lines)
                .wrap(Wrap { trim: false })
                .block(Block::default().borders(Borders::ALL).title(title)),
            centered_rect(area, 80, 80),
        );
    }

    fn draw_delete_confirm(&self, frame: &mut ratatui::Frame, area: Rect) {
        let Some(post) = &self.confirm_delete else {
            return;
        };
        let rect = centered_rect(area, 50, 20);
        frame.render_widget(Clear, rect);
        let lines = vec![
            Line::from(Span::styled(
                format!("Delete \"{}\"?", post.title),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::default(),
            Line::from(Span::styled(
                "This cannot be undone. y deletes · n cancels",
                Style::default().fg(Color::DarkGray),
            )),
        ];
        frame.render_widget(
            Paragraph::new(lines)
                .alignment(Alignment::Center)
                .block(Block::default().borders(Borders::ALL).title(" Delete post ")),
            rect,
        );
    }

    fn draw_status(&self, frame: &mut ratatui::Frame, area: Rect) {
        let spinner = if self.is_loading() {
            format!("{} ", self.spinner.frame())
        } else {
            String::new()
        };
        let left = format!("{spinner}{}", self.status_message);
        let right = format!("config: {} ", self.config_path);
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(1), Constraint::Length(right.len() as u16)])
            .split(area);
        frame.render_widget(
            Paragraph::new(Span::styled(left, Style::default().fg(Color::Gray))),
            columns[0],
        );
        frame.render_widget(
            Paragraph::new(Span::styled(right, Style::default().fg(Color::DarkGray)))
                .alignment(Alignment::Right),
            columns[1],
        );
    }
}

fn centered_rect(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1]);
    horizontal[1]
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// The editor stores HTML; a terminal draft is plain text. Blank lines
/// separate paragraphs, single newlines become soft breaks.
fn draft_to_html(body: &str) -> String {
    body.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| format!("<p>{}</p>", escape_html(paragraph).replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drafts_become_paragraph_markup() {
        let html = draft_to_html("First paragraph.\n\nSecond & <last>.");
        assert_eq!(
            html,
            "<p>First paragraph.</p><p>Second &amp; &lt;last&gt;.</p>"
        );
    }

    #[test]
    fn soft_breaks_survive_inside_a_paragraph() {
        let html = draft_to_html("line one\nline two");
        assert_eq!(html, "<p>line one<br>line two</p>");
    }

    #[test]
    fn compose_form_splits_tags() {
        let mut form = ComposeForm::blank();
        form.tags = "rust, tui, , blogging ".into();
        assert_eq!(form.tag_list(), vec!["rust", "tui", "blogging"]);
    }
}
