use axum::{
    Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use std::sync::Arc;

use crate::accounts::admin::{NewUser, UserChanges, require_admin};
use crate::api::auth::SuccessResponse;
use crate::api::server::AppState;
use crate::db::models::PublicUser;
use crate::error::AppError;

#[derive(Serialize)]
pub struct UserResponse {
    pub success: bool,
    pub user: PublicUser,
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Vec<PublicUser>>, AppError> {
    let caller = state.caller(&jar).await;
    let users = state.users.list_users(caller.as_ref()).await?;
    Ok(Json(users))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let caller = state.caller(&jar).await;
    // Non-admins get 403 even when the body is malformed.
    require_admin(caller.as_ref())?;
    let Json(request) = payload?;

    let user = state.users.create_user(caller.as_ref(), request).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    id: Result<Path<u64>, PathRejection>,
    payload: Result<Json<UserChanges>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let caller = state.caller(&jar).await;
    require_admin(caller.as_ref())?;
    let Path(id) = id?;
    let Json(changes) = payload?;

    let user = state.users.update_user(caller.as_ref(), id, changes).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<SuccessResponse>, AppError> {
    let caller = state.caller(&jar).await;
    require_admin(caller.as_ref())?;
    let Path(id) = id?;

    state.users.delete_user(caller.as_ref(), id).await?;
    Ok(Json(SuccessResponse { success: true }))
}
