//! HTTP route handlers

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{error::ApiError, extract::AuthUser, AppState};
use crate::db::{self, IngestSnapshot, NewPost, Post};

/// Longest post accepted, in characters
pub const MAX_POST_CHARS: usize = 280;

const DEFAULT_TIMELINE_LIMIT: i64 = 50;
const MAX_TIMELINE_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl CredentialsRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ApiError::BadRequest("missing fields".to_string()));
        }
        Ok(())
    }
}

/// API: Create an account
pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = payload?;
    request.validate()?;

    // Hashing is CPU-bound, run it on the blocking pool
    let hasher = state.hasher.clone();
    let password = request.password;
    let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
        .await
        .map_err(anyhow::Error::from)?;

    let user = match state.db.create_user(&request.username, &password_hash).await {
        Ok(user) => user,
        Err(e) if db::is_unique_violation(&e) => {
            return Err(ApiError::Conflict(format!("username '{}' is taken", request.username)));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!("Registered user {} ({})", user.username, user.id);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "userId": user.id, "username": user.username })),
    ))
}

/// API: Exchange username and password for a bearer token
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    request.validate()?;

    let invalid = || ApiError::Unauthorized("invalid credentials".to_string());

    let Some((user_id, stored)) = state.db.get_credentials(&request.username).await? else {
        tracing::debug!("Login for unknown user {}", request.username);
        return Err(invalid());
    };

    let hasher = state.hasher.clone();
    let password = request.password;
    let verified = tokio::task::spawn_blocking(move || hasher.verify(&password, &stored))
        .await
        .map_err(anyhow::Error::from)?;
    if !verified {
        tracing::debug!("Wrong password for {}", request.username);
        return Err(invalid());
    }

    let token = state.tokens.issue(user_id)?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    #[serde(default)]
    pub text: String,
}

/// API: Queue a post for batched persistence. Never waits on the database.
pub async fn create_post(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<CreatePostRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = payload?;

    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text cannot be empty".to_string()));
    }
    if request.text.chars().count() > MAX_POST_CHARS {
        return Err(ApiError::BadRequest(format!(
            "text too long (max {} characters)",
            MAX_POST_CHARS
        )));
    }

    if let Err(e) = state.write_tx.submit(NewPost::new(user_id, request.text)) {
        tracing::warn!("Rejected post from user {}: {}", user_id, e);
        return Err(e.into());
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// API: Fetch a single persisted post (cached, posts are immutable)
pub async fn get_post(
    State(state): State<Arc<AppState>>,
    post_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Post>, ApiError> {
    let Path(post_id) = post_id?;

    if let Some(post) = state.cached_post(post_id) {
        return Ok(Json(post));
    }

    // Misses are not cached: the post may still be sitting in the write buffer
    let post = state
        .db
        .get_post(post_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("post not found".to_string()))?;

    state.cache_post(post.clone());
    Ok(Json(post))
}

/// API: Follow another user
pub async fn follow(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    target: Result<Path<i64>, PathRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Path(target_id) = target?;
    if target_id == user_id {
        return Err(ApiError::BadRequest("cannot follow yourself".to_string()));
    }
    if !state.db.user_exists(target_id).await? {
        return Err(ApiError::NotFound(format!("user {} not found", target_id)));
    }

    match state.db.insert_follow(user_id, target_id).await {
        Ok(()) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(ApiError::Conflict(format!("already following user {}", target_id)));
        }
        Err(e) => return Err(e.into()),
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "followerId": user_id, "followedId": target_id })),
    ))
}

/// API: Stop following a user
pub async fn unfollow(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    target: Result<Path<i64>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(target_id) = target?;
    if target_id == user_id {
        return Err(ApiError::BadRequest("cannot unfollow yourself".to_string()));
    }

    if !state.db.delete_follow(user_id, target_id).await? {
        return Err(ApiError::NotFound(format!(
            "user {} does not follow {}",
            user_id, target_id
        )));
    }

    Ok(Json(json!({ "unfollow": "success" })))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub limit: Option<i64>,
}

/// API: Posts from followed users, newest first. Buffered posts are not visible yet.
pub async fn timeline(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<TimelineQuery>, QueryRejection>,
) -> Result<Json<Vec<Post>>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TIMELINE_LIMIT)
        .clamp(1, MAX_TIMELINE_LIMIT);

    Ok(Json(state.db.get_timeline(user_id, limit).await?))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ingest: IngestSnapshot,
}

/// API: Liveness and ingestion counters
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ingest: state.write_tx.stats(),
    })
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}
