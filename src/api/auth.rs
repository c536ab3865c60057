use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::server::AppState;
use crate::db::models::SessionUser;
use crate::error::AppError;

pub const SESSION_COOKIE: &str = "admin_sid";

#[derive(Deserialize)]
pub struct LoginPayload {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user: SessionUser,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<SessionUser>,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    payload: Result<Json<LoginPayload>, JsonRejection>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    let Json(payload) = payload?;

    let (Some(username), Some(password)) = (
        payload.username.filter(|u| !u.is_empty()),
        payload.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::BadRequest(
            "Username and password required".to_string(),
        ));
    };

    let (token, user) = state.auth.login(&username, &password).await?;

    Ok((
        jar.add(state.cookie.issue(token)),
        Json(LoginResponse {
            success: true,
            user,
        }),
    ))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, Json<SuccessResponse>) {
    if let Some(token) = session_token(&jar) {
        state.auth.logout(&token).await;
    }

    (
        jar.remove(state.cookie.removal()),
        Json(SuccessResponse { success: true }),
    )
}

pub async fn session(State(state): State<Arc<AppState>>, jar: CookieJar) -> Json<SessionResponse> {
    let user = state.caller(&jar).await;

    Json(SessionResponse {
        authenticated: user.is_some(),
        user,
    })
}

/// Cookie attributes for the session token.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub max_age_secs: u64,
    pub secure: bool,
}

impl CookieSettings {
    pub fn issue(&self, token: String) -> Cookie<'static> {
        let max_age = i64::try_from(self.max_age_secs).unwrap_or(i64::MAX);

        Cookie::build((SESSION_COOKIE, token))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure)
            .max_age(cookie::time::Duration::seconds(max_age))
            .build()
    }

    /// A cookie matching the issued one's path, for `CookieJar::remove`.
    pub fn removal(&self) -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE)
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure)
            .build()
    }
}

/// The session token carried by the request's cookies, if any.
pub fn session_token(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
