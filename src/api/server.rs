use anyhow::Context;
use axum::{
    Router,
    routing::{get, post, put},
};
use axum_extra::extract::cookie::CookieJar;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::accounts::admin::UserAdmin;
use crate::accounts::auth::AuthService;
use crate::accounts::password::Hasher;
use crate::accounts::session::{Clock, SessionStore, SystemClock};
use crate::api::auth::{self, CookieSettings, session_token};
use crate::api::admin;
use crate::config::Config;
use crate::db::models::SessionUser;
use crate::db::store::UserStore;

pub struct AppState {
    pub auth: AuthService,
    pub users: UserAdmin,
    pub cookie: CookieSettings,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<UserStore>,
        hasher: Hasher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = i64::try_from(config.session_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let sessions = SessionStore::new(ttl, clock.clone());

        Self {
            auth: AuthService::new(store.clone(), sessions, hasher.clone()),
            users: UserAdmin::new(store, hasher, clock),
            cookie: CookieSettings {
                max_age_secs: config.session_ttl_secs,
                secure: config.cookie_secure,
            },
        }
    }

    /// The identity behind the request's session cookie, if it is still live.
    pub async fn caller(&self, jar: &CookieJar) -> Option<SessionUser> {
        let token = session_token(jar)?;
        self.auth.current_session(&token).await
    }
}

pub fn build_router(state: Arc<AppState>, public_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/login", post(auth::login))
        .route("/api/logout", post(auth::logout))
        .route("/api/session", get(auth::session))
        .route(
            "/api/admin/users",
            get(admin::list_users).post(admin::create_user),
        )
        .route(
            "/api/admin/users/{id}",
            put(admin::update_user).delete(admin::delete_user),
        );

    if let Some(dir) = public_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
    .with_state(state)
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let hasher = Hasher::default();
    let store = Arc::new(UserStore::new(&config.users_file));
    if store
        .init(&hasher, &config.default_admin_password)
        .await
        .context("Failed to initialize user store")?
    {
        info!("Created default admin account; change its password after first login");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(&config, store, hasher, clock));

    spawn_session_sweeper(
        state.auth.sessions().clone(),
        Duration::from_secs(config.session_sweep_secs),
    );

    let app = build_router(state, config.public_dir.as_deref());

    let address = config.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {address}"))?;

    info!("Server running on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")?;

    info!("Server shut down");
    Ok(())
}

fn spawn_session_sweeper(sessions: SessionStore, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = sessions.purge_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Swept expired sessions");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::session::testing::ManualClock;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        router: Router,
        clock: Arc<ManualClock>,
    }

    async fn test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let config = Config {
            users_file: dir.path().join("users.json"),
            ..Config::default()
        };
        let hasher = Hasher::fast();
        let store = Arc::new(UserStore::new(&config.users_file));
        store.init(&hasher, "admin123").await.unwrap();

        let clock = ManualClock::new();
        let state = Arc::new(AppState::new(&config, store, hasher, clock.clone()));
        TestApp {
            _dir: dir,
            router: build_router(state, None),
            clock,
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, value)
    }

    /// Logs in and returns a `Cookie` header value carrying the session.
    async fn login(router: &Router, username: &str, password: &str) -> String {
        let (status, headers, body) = send(
            router,
            "POST",
            "/api/login",
            None,
            Some(json!({ "username": username, "password": password })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");

        let set_cookie = headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_and_session() {
        let app = test_app().await;

        let (status, _, body) = send(&app.router, "GET", "/api/session", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "authenticated": false }));

        let (status, headers, body) = send(
            &app.router,
            "POST",
            "/api/login",
            None,
            Some(json!({ "username": "admin", "password": "admin123" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "success": true, "user": { "id": 1, "username": "admin", "role": "admin" } })
        );
        let set_cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with("admin_sid="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Max-Age=86400"));

        let cookie = set_cookie.split(';').next().unwrap();
        let (_, _, body) = send(&app.router, "GET", "/api/session", Some(cookie), None).await;
        assert_eq!(
            body,
            json!({ "authenticated": true, "user": { "id": 1, "username": "admin", "role": "admin" } })
        );
    }

    #[tokio::test]
    async fn test_login_failures() {
        let app = test_app().await;

        let (status, _, body) = send(
            &app.router,
            "POST",
            "/api/login",
            None,
            Some(json!({ "username": "admin" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Username and password required");

        let (status, headers, body) = send(
            &app.router,
            "POST",
            "/api/login",
            None,
            Some(json!({ "username": "admin", "password": "wrong" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid credentials");
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let app = test_app().await;
        let cookie = login(&app.router, "admin", "admin123").await;

        let (status, headers, body) =
            send(&app.router, "POST", "/api/logout", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
        let cleared = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.starts_with("admin_sid=;"));
        assert!(cleared.contains("Max-Age=0"));

        let (_, _, body) = send(&app.router, "GET", "/api/session", Some(&cookie), None).await;
        assert_eq!(body["authenticated"], false);

        // Logging out again, or without any session, still succeeds.
        let (status, _, _) = send(&app.router, "POST", "/api/logout", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&app.router, "POST", "/api/logout", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_expires() {
        let app = test_app().await;
        let cookie = login(&app.router, "admin", "admin123").await;

        app.clock.advance(chrono::Duration::hours(24));
        let (_, _, body) = send(&app.router, "GET", "/api/session", Some(&cookie), None).await;
        assert_eq!(body["authenticated"], false);

        let (status, _, _) =
            send(&app.router, "GET", "/api/admin/users", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_routes_require_admin() {
        let app = test_app().await;
        let admin_cookie = login(&app.router, "admin", "admin123").await;
        send(
            &app.router,
            "POST",
            "/api/admin/users",
            Some(&admin_cookie),
            Some(json!({ "username": "alice", "password": "pw123" })),
        )
        .await;
        let user_cookie = login(&app.router, "alice", "pw123").await;

        for cookie in [None, Some(user_cookie.as_str())] {
            let (status, _, body) =
                send(&app.router, "GET", "/api/admin/users", cookie, None).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(body["error"], "Admin access required");

            let (status, _, _) = send(
                &app.router,
                "POST",
                "/api/admin/users",
                cookie,
                Some(json!({ "username": "mallory", "password": "pw" })),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);

            let (status, _, _) = send(
                &app.router,
                "PUT",
                "/api/admin/users/1",
                cookie,
                Some(json!({ "role": "user" })),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);

            let (status, _, _) =
                send(&app.router, "DELETE", "/api/admin/users/1", cookie, None).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test]
    async fn test_user_management_flow() {
        let app = test_app().await;
        let cookie = login(&app.router, "admin", "admin123").await;

        let (status, _, body) = send(
            &app.router,
            "POST",
            "/api/admin/users",
            Some(&cookie),
            Some(json!({ "username": "alice", "password": "pw123" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["id"], 2);
        assert_eq!(body["user"]["role"], "user");
        assert!(body["user"].get("password").is_none());

        let (status, _, body) = send(
            &app.router,
            "POST",
            "/api/admin/users",
            Some(&cookie),
            Some(json!({ "username": "alice", "password": "again" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Username already exists");

        let (status, _, body) = send(
            &app.router,
            "PUT",
            "/api/admin/users/2",
            Some(&cookie),
            Some(json!({ "role": "admin" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["username"], "alice");
        assert_eq!(body["user"]["role"], "admin");

        let (status, _, body) =
            send(&app.router, "GET", "/api/admin/users", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        let users = body.as_array().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| u.get("password").is_none()));
        assert!(users.iter().all(|u| u.get("createdAt").is_some()));

        let (status, _, body) =
            send(&app.router, "DELETE", "/api/admin/users/2", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let (status, _, _) =
            send(&app.router, "DELETE", "/api/admin/users/2", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(
            &app.router,
            "PUT",
            "/api/admin/users/2",
            Some(&cookie),
            Some(json!({ "username": "ghost" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "User not found");
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected() {
        let app = test_app().await;
        let cookie = login(&app.router, "admin", "admin123").await;

        let (status, _, body) = send(
            &app.router,
            "POST",
            "/api/admin/users",
            Some(&cookie),
            Some(json!({ "username": "bob", "password": "pw", "role": "root" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid role: root");

        let (status, _, body) = send(
            &app.router,
            "DELETE",
            "/api/admin/users/not-a-number",
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_public_dir_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>admin</h1>").unwrap();

        let config = Config {
            users_file: dir.path().join("users.json"),
            ..Config::default()
        };
        let store = Arc::new(UserStore::new(&config.users_file));
        let state = Arc::new(AppState::new(
            &config,
            store,
            Hasher::fast(),
            ManualClock::new(),
        ));
        let router = build_router(state, Some(dir.path()));

        let response = router
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<h1>admin</h1>");
    }
}
