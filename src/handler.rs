//! Route handlers. The authorization gate has already run for every request
//! that lands here, so handlers only check roles, never session validity.

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware,
    response::{AppendHeaders, Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::{
    error::AppError,
    gate::{self, AuthUser, ClientIp, MaybeUser},
    index::RESOURCES_DIR,
    state::AppState,
    template::{self, PageContext},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", get(get_login).post(post_login))
        .route("/logout", get(get_logout))
        .route("/renewpw", get(get_renewpw).post(post_renewpw))
        .route("/renewpw/master", post(post_renewpw_master))
        .route("/admin", get(get_admin))
        .route("/sitemap", get(get_sitemap))
        .route("/nav", get(get_nav))
        .route("/sessions", get(get_sessions))
        .route("/invalidate", get(get_invalidate_all))
        .route("/invalidate/{id}", get(get_invalidate_one))
        .route("/adminonly", post(post_admin_only))
        .route("/adminonly/toggletext", get(get_admin_only_text))
        .route("/users/add", post(post_add_user))
        .route("/users/remove", post(post_remove_user))
        .route("/reload", get(get_reload))
        // Shadows the sentinel URL assigned to files found outside the root.
        .route("/error", get(|| async { "An error occurred." }))
        .fallback(resolve_content)
        .layer(middleware::from_fn_with_state(state.clone(), gate::authorize))
        .with_state(state)
}

// ── Login / logout ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RetryQuery {
    retry: Option<String>,
}

async fn get_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RetryQuery>,
) -> Html<String> {
    // The gate redirects authenticated callers away, so this is always an
    // anonymous visitor.
    let redirect_label = match gate::remembered_path(&headers) {
        Some(path) if path != "/" => path,
        _ => "the start page".to_string(),
    };
    let locked = state.users.is_admin_only();
    let markup = template::login_page(
        &state.config.server_name,
        query.retry.is_some(),
        &redirect_label,
        locked,
    );
    Html(markup.into_string())
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn post_login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    tracing::info!("Receiving login try");
    if form.username.is_empty() || !state.users.verify(&form.username, &form.password) {
        return Redirect::to("/login?retry=true").into_response();
    }

    let token = state.sessions.create_session(&ip, &form.username);
    tracing::info!("Login successful for {}", form.username);

    let target = gate::remembered_path(&headers).unwrap_or_else(|| "/".to_string());
    (
        StatusCode::SEE_OTHER,
        AppendHeaders([
            (
                header::SET_COOKIE,
                gate::session_cookie(&token, state.config.cookie_age.as_secs()),
            ),
            (header::SET_COOKIE, gate::clear_redirect_cookie()),
            (header::LOCATION, target),
        ]),
    )
        .into_response()
}

async fn get_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = gate::cookie_value(&headers, gate::SESSION_COOKIE) {
        state.sessions.invalidate(&token);
    }
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, gate::clear_session_cookie()),
            (header::LOCATION, "/login".to_string()),
        ],
    )
        .into_response()
}

// ── Password changes ─────────────────────────────────────────────────────────

async fn get_renewpw(
    State(state): State<AppState>,
    Query(query): Query<RetryQuery>,
) -> Html<String> {
    Html(template::renewpw_page(&state.config.server_name, query.retry.is_some()).into_string())
}

#[derive(Deserialize)]
struct RenewForm {
    current: String,
    new: String,
}

async fn post_renewpw(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
    headers: HeaderMap,
    Form(form): Form<RenewForm>,
) -> Response {
    if !state
        .users
        .change_password_self(&username, &form.current, &form.new)
    {
        return Redirect::to("/renewpw?retry=true").into_response();
    }

    // The password changed; everything minted for it dies with it.
    state.sessions.invalidate_all_for(&username);
    if let Some(token) = gate::cookie_value(&headers, gate::SESSION_COOKIE) {
        state.sessions.invalidate(&token);
    }
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, gate::clear_session_cookie()),
            (header::LOCATION, "/".to_string()),
        ],
    )
        .into_response()
}

#[derive(Deserialize)]
struct MasterPasswordForm {
    username: String,
    password: String,
}

async fn post_renewpw_master(
    State(state): State<AppState>,
    Extension(AuthUser(acting)): Extension<AuthUser>,
    Json(form): Json<MasterPasswordForm>,
) -> Result<String, AppError> {
    if !state.users.is_master(&acting) {
        return Err(AppError::Unauthorized);
    }
    if form.username.is_empty() || form.password.is_empty() {
        return Err(AppError::BadRequest("Please provide correct data!".to_string()));
    }
    if state
        .users
        .change_password_by_master(&acting, &form.username, &form.password)
    {
        Ok("Password was changed successfully.".to_string())
    } else {
        Ok("You don't have permission to do this.".to_string())
    }
}

// ── Admin endpoints ──────────────────────────────────────────────────────────

async fn get_admin(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
) -> Result<Html<String>, AppError> {
    if !state.users.is_admin(&username) {
        return Err(AppError::Unauthorized);
    }
    let dropdown = state.index.dropdown();
    let ctx = page_context(&state, Some(&username), &dropdown);
    Ok(Html(
        template::admin_page(&ctx, state.users.is_admin_only()).into_string(),
    ))
}

async fn get_sessions(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
) -> Result<Html<String>, AppError> {
    if !state.users.is_admin(&username) {
        return Err(AppError::Unauthorized);
    }
    let usernames = state.users.usernames();
    let mut sessions = state.sessions.sessions();
    sessions.sort_by(|a, b| a.0.cmp(&b.0));

    let dropdown = state.index.dropdown();
    let ctx = page_context(&state, Some(&username), &dropdown);
    Ok(Html(
        template::sessions_page(&ctx, &usernames, &sessions).into_string(),
    ))
}

async fn get_invalidate_all(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
) -> Result<String, AppError> {
    if !state.users.is_master(&username) {
        return Err(AppError::Unauthorized);
    }
    state.sessions.invalidate_all();
    Ok("All user sessions have been deleted.".to_string())
}

async fn get_invalidate_one(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
    UrlPath(id): UrlPath<String>,
) -> Result<String, AppError> {
    if !state.users.is_master(&username) {
        return Err(AppError::Unauthorized);
    }
    state.sessions.invalidate(&id);
    Ok("This session has been removed.".to_string())
}

async fn post_admin_only(
    State(state): State<AppState>,
    Extension(AuthUser(username)): Extension<AuthUser>,
) -> Result<String, AppError> {
    if !state.users.is_admin(&username) {
        return Err(AppError::Unauthorized);
    }
    if state.users.toggle_admin_only() {
        Ok("Admin-only mode is now enabled.".to_string())
    } else {
        Ok("Admin-only mode is now disabled.".to_string())
    }
}

async fn get_admin_only_text(State(state): State<AppState>) -> String {
    if state.users.is_admin_only() {
        "Disable".to_string()
    } else {
        "Enable".to_string()
    }
}

#[derive(Deserialize)]
struct AddUserForm {
    username: String,
    password: String,
}

async fn post_add_user(
    State(state): State<AppState>,
    Extension(AuthUser(acting)): Extension<AuthUser>,
    Json(form): Json<AddUserForm>,
) -> Result<String, AppError> {
    if !state.users.is_admin(&acting) {
        return Err(AppError::Unauthorized);
    }
    if form.username.is_empty() || form.password.is_empty() {
        return Err(AppError::BadRequest("Please provide correct data!".to_string()));
    }
    if state.users.add_user(&form.username, &form.password) {
        Ok("User was created successfully.".to_string())
    } else {
        Ok("This user could not be created.".to_string())
    }
}

#[derive(Deserialize)]
struct RemoveUserForm {
    username: String,
}

async fn post_remove_user(
    State(state): State<AppState>,
    Extension(AuthUser(acting)): Extension<AuthUser>,
    Json(form): Json<RemoveUserForm>,
) -> Result<String, AppError> {
    if !state.users.is_admin(&acting) {
        return Err(AppError::Unauthorized);
    }
    if form.username.is_empty() {
        return Err(AppError::BadRequest("Please provide correct data!".to_string()));
    }
    if state.users.remove_user(&form.username) {
        Ok("User was deleted successfully.".to_string())
    } else {
        Ok("This user could not be deleted.".to_string())
    }
}

async fn get_reload(State(state): State<AppState>) -> Response {
    let index = state.index.clone();
    let users = state.users.clone();
    let result = tokio::task::spawn_blocking(move || {
        index.rescan();
        users.reload();
    })
    .await;
    if let Err(e) = result {
        tracing::error!("Reload task failed: {}", e);
    }
    Redirect::to("/").into_response()
}

// ── Navigation and overview pages ────────────────────────────────────────────

async fn get_nav(State(state): State<AppState>, MaybeUser(user): MaybeUser) -> Html<String> {
    let dropdown = state.index.dropdown();
    let ctx = page_context(&state, user.as_deref(), &dropdown);
    Html(template::navbar(&ctx).into_string())
}

async fn get_sitemap(State(state): State<AppState>, MaybeUser(user): MaybeUser) -> Html<String> {
    let entries = state.index.folder_overview("/");
    let dropdown = state.index.dropdown();
    let ctx = page_context(&state, user.as_deref(), &dropdown);
    Html(template::folder_overview(&ctx, &entries).into_string())
}

// ── Content fallback ─────────────────────────────────────────────────────────

/// Resolve anything that matched no route: exact content entry, folder
/// redirect, static asset from the resources directory, folder overview,
/// then 404. Failures degrade to the error page, never a raw trace.
async fn resolve_content(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    uri: Uri,
) -> Result<Response, AppError> {
    let path = percent_decode(uri.path()).ok_or(AppError::NotFound)?;
    if path.split('/').any(|segment| segment == "..") {
        return Err(AppError::NotFound);
    }

    if path == "/" && state.config.has_root_redirect() {
        return Ok(Redirect::to(&state.config.root_redirect).into_response());
    }

    if let Some(entry) = state.index.lookup(&path) {
        let doc = state.index.rendered(&entry).await;
        let dropdown = state.index.dropdown();
        let ctx = page_context(&state, user.as_deref(), &dropdown);
        return Ok(
            Html(template::content_page(&ctx, &doc.title, &doc.html).into_string())
                .into_response(),
        );
    }

    let folder = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path.as_str()
    };
    if state.index.has_redirect(folder) {
        return Ok(Redirect::to(&state.index.redirect_target(folder)).into_response());
    }

    if let Some(response) = serve_static(&state, &path).await? {
        return Ok(response);
    }

    let entries = state.index.folder_overview(folder);
    let dropdown = state.index.dropdown();
    let ctx = page_context(&state, user.as_deref(), &dropdown);

    if entries.is_empty() {
        return Ok((
            StatusCode::NOT_FOUND,
            Html(template::not_found(&ctx).into_string()),
        )
            .into_response());
    }
    Ok(Html(template::folder_overview(&ctx, &entries).into_string()).into_response())
}

/// Try `<root>/resources/<path>` as a static file. `Ok(None)` when there is
/// no such file, so resolution can continue to the folder overview.
async fn serve_static(state: &AppState, path: &str) -> Result<Option<Response>, AppError> {
    let resources_root = state.index.root().join(RESOURCES_DIR);
    let candidate = resources_root.join(path.trim_start_matches('/'));

    let Ok(real_path) = tokio::fs::canonicalize(&candidate).await else {
        return Ok(None);
    };
    let Ok(real_root) = tokio::fs::canonicalize(&resources_root).await else {
        return Ok(None);
    };
    let Ok(meta) = tokio::fs::metadata(&real_path).await else {
        return Ok(None);
    };
    // Symlink guard: the resolved file must stay under the resources root.
    if !real_path.starts_with(&real_root) || !meta.is_file() {
        return Ok(None);
    }

    let file = tokio::fs::File::open(&real_path).await.map_err(AppError::Io)?;
    let content_length = meta.len();

    let mime: &'static str = mime_guess::from_path(&real_path)
        .first_raw()
        .unwrap_or("application/octet-stream");

    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CONTENT_LENGTH, content_length)
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Some(response))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn page_context<'a>(
    state: &'a AppState,
    username: Option<&'a str>,
    dropdown: &'a str,
) -> PageContext<'a> {
    PageContext {
        config: &state.config,
        username,
        is_admin: username
            .map(|name| state.users.is_admin(name))
            .unwrap_or(false),
        dropdown,
    }
}

/// Percent-decode a URL path; `None` (a 404) if the bytes are not UTF-8.
fn percent_decode(s: &str) -> Option<String> {
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::index::{ContentIndex, MarkdownRenderer};
    use crate::sessions::SessionStore;
    use crate::users::{testing::PlainScheme, CredentialStore};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const MASTER: &str = "masterUser";

    fn setup() -> (Router, AppState, TempDir) {
        let dir = tempdir().unwrap();
        let root: PathBuf = dir.path().to_path_buf();

        std::fs::write(root.join("Welcome.md"), "# Welcome\n\nHello there.").unwrap();
        std::fs::create_dir_all(root.join("notes")).unwrap();
        std::fs::write(root.join("notes/First.md"), "# First note\n").unwrap();
        std::fs::write(root.join("notes/.mdIndex"), "/notes/first\n").unwrap();
        std::fs::create_dir_all(root.join(RESOURCES_DIR)).unwrap();
        std::fs::write(root.join(RESOURCES_DIR).join("robots.txt"), "User-agent: *\n").unwrap();
        std::fs::write(root.join(RESOURCES_DIR).join("style.css"), "body {}\n").unwrap();

        let config = Arc::new(ServerConfig::default());
        let users = Arc::new(CredentialStore::open(&root, Box::new(PlainScheme)));
        // The fresh store comes up locked down; open it for the tests.
        users.toggle_admin_only();
        users.add_user("alice", "secret");

        let sessions = Arc::new(SessionStore::open(&root, config.cookie_age));
        let index = Arc::new(ContentIndex::new(root, Box::new(MarkdownRenderer)));
        index.rescan();

        let state = AppState {
            config,
            index,
            sessions,
            users,
        };
        (router(state.clone()), state, dir)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn get_as(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::COOKIE, format!("login-id={}", token))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn robots_is_always_reachable() {
        let (app, _state, _dir) = setup();
        let response = app.oneshot(get("/robots.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("User-agent"));
    }

    #[tokio::test]
    async fn unauthenticated_requests_redirect_to_login() {
        let (app, _state, _dir) = setup();

        let response = app.oneshot(get("/welcome")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("login-redirect=%2Fwelcome"));
    }

    #[tokio::test]
    async fn login_page_is_reachable_without_session() {
        let (app, _state, _dir) = setup();
        let response = app.oneshot(get("/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_round_trip() {
        let (app, state, _dir) = setup();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .header(header::COOKIE, "login-redirect=%2Fwelcome")
                    .body(Body::from("username=alice&password=secret"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/welcome");

        let session_cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .find_map(|value| value.to_str().ok()?.strip_prefix("login-id="))
            .map(|rest| rest.split(';').next().unwrap().to_string())
            .expect("session cookie set");
        assert!(state.sessions.has_session(&session_cookie));

        // The remembered path now serves rendered content.
        let response = app
            .clone()
            .oneshot(get_as("/welcome", &session_cookie))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("Hello there."));
        assert!(body.contains("alice"), "navbar shows the username");
    }

    #[tokio::test]
    async fn bad_credentials_bounce_back_to_login() {
        let (app, state, _dir) = setup();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=alice&password=wrong"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login?retry=true");
        assert!(state.sessions.sessions().is_empty());
    }

    #[tokio::test]
    async fn authenticated_login_page_redirects_home() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app.oneshot(get_as("/login", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn lockdown_forces_logout_on_next_request() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");
        state.users.toggle_admin_only();

        let response = app.oneshot(get_as("/welcome", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
        assert!(
            !state.sessions.has_session(&token),
            "session invalidated, not just redirected"
        );
    }

    #[tokio::test]
    async fn lockdown_leaves_admins_alone() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", MASTER);
        state.users.toggle_admin_only();

        let response = app.oneshot(get_as("/welcome", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.sessions.has_session(&token));
    }

    #[tokio::test]
    async fn resources_prefix_is_rewritten() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app
            .oneshot(get_as("/resources/style.css", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/style.css");
    }

    #[tokio::test]
    async fn static_assets_serve_from_resources() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app.oneshot(get_as("/style.css", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
    }

    #[tokio::test]
    async fn folder_redirect_applies() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app.oneshot(get_as("/notes/", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/notes/first");
    }

    #[tokio::test]
    async fn unmatched_path_with_entries_shows_overview() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app.oneshot(get_as("/", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("/welcome"));
        assert!(body.contains("/notes/first"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app.oneshot(get_as("/zzz-nowhere", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_page_requires_admin() {
        let (app, state, _dir) = setup();
        let alice = state.sessions.create_session("10.0.0.1", "alice");
        let master = state.sessions.create_session("10.0.0.2", MASTER);

        let response = app.clone().oneshot(get_as("/admin", &alice)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(get_as("/admin", &master)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn master_manages_users_and_sessions() {
        let (app, state, _dir) = setup();
        let master = state.sessions.create_session("10.0.0.2", MASTER);

        let payload = serde_json::json!({ "username": "bob", "password": "pw" });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/users/add")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::COOKIE, format!("login-id={}", master))
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.users.verify("bob", "pw"));

        let alice = state.sessions.create_session("10.0.0.1", "alice");
        let response = app
            .clone()
            .oneshot(get_as("/invalidate", &master))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.sessions.has_session(&alice));
    }

    #[tokio::test]
    async fn master_issued_password_change() {
        let (app, state, _dir) = setup();
        let master = state.sessions.create_session("10.0.0.2", MASTER);
        let alice = state.sessions.create_session("10.0.0.1", "alice");

        let payload = serde_json::json!({ "username": "alice", "password": "issued" });
        let request = |token: &str| {
            Request::builder()
                .method("POST")
                .uri("/renewpw/master")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, format!("login-id={}", token))
                .body(Body::from(payload.to_string()))
                .unwrap()
        };

        // A mere user is turned away.
        let response = app.clone().oneshot(request(&alice)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.users.verify("alice", "secret"));

        let response = app.oneshot(request(&master)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.users.verify("alice", "issued"));
    }

    #[tokio::test]
    async fn self_service_password_change_drops_sessions() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");
        let other = state.sessions.create_session("10.0.0.9", "alice");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/renewpw")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .header(header::COOKIE, format!("login-id={}", token))
                    .body(Body::from("current=secret&new=changed"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(state.users.verify("alice", "changed"));
        assert!(!state.sessions.has_session(&token));
        assert!(!state.sessions.has_session(&other));
    }

    #[tokio::test]
    async fn traversal_attempts_are_rejected() {
        let (app, state, _dir) = setup();
        let token = state.sessions.create_session("10.0.0.1", "alice");

        let response = app
            .oneshot(get_as("/%2e%2e/users.properties", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
