use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthUser, CurrentUser, access_cookie, expired_cookie, hash_password, verify_password},
    models::{LoginRequest, LoginResponse, RegisterRequest, UserRecord},
    service::{
        ApiError, ApiResult, AppState, bad_request_error, conflict_error, storage_error,
        unauthorized_error,
    },
    store::email_key,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/user", get(current_user))
}

async fn register(
    State(app_state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Value> {
    let email = email_key(&request.email);
    if email.is_empty() || request.password.is_empty() {
        return Err(bad_request_error("email and password are required"));
    }

    let user = UserRecord {
        user_id: Uuid::new_v4().to_string(),
        email: email.clone(),
        hashed_password: hash_password(&request.password),
        created_at: Utc::now(),
    };
    let user_id = user.user_id.clone();

    let inserted = app_state
        .repository
        .insert_user(user)
        .await
        .map_err(storage_error)?;
    if !inserted {
        warn!(email = %email, "Registration for existing email");
        return Err(conflict_error("Email already registered"));
    }

    info!(user_id = %user_id, "Registered user");
    Ok(Json(json!({ "id": user_id, "email": email })))
}

async fn login(
    State(app_state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let user = app_state
        .repository
        .user_by_email(&request.email)
        .await
        .map_err(storage_error)?
        .filter(|user| verify_password(&request.password, &user.hashed_password))
        .ok_or_else(|| unauthorized_error("Invalid email or password"))?;

    let token = app_state.tokens.issue(AuthUser {
        user_id: user.user_id.clone(),
        email: user.email.clone(),
    });
    let cookie = access_cookie(
        &token,
        app_state.tokens.ttl().num_seconds(),
        app_state.config.cookie_secure,
    );

    info!(user_id = %user.user_id, "User logged in");
    let body = LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        user_id: user.user_id,
        email: user.email,
    };
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn logout(State(app_state): State<AppState>, current: CurrentUser) -> Response {
    app_state.tokens.revoke(&current.token);
    info!(user_id = %current.user.user_id, "User logged out");
    (
        [(header::SET_COOKIE, expired_cookie(app_state.config.cookie_secure))],
        Json(json!({ "message": "Logged out" })),
    )
        .into_response()
}

async fn current_user(current: CurrentUser) -> Json<Value> {
    Json(json!({
        "user_id": current.user.user_id,
        "email": current.user.email
    }))
}
