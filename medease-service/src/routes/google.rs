use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Json, Redirect},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    auth::CurrentUser,
    google::{CalendarGateway, TokenGrant, build_event},
    models::{CalendarEventRequest, GoogleToken, OAuthCallbackQuery},
    service::{
        ApiError, ApiResult, AppState, bad_gateway_error, bad_request_error, internal_error,
        storage_error, unavailable_error,
    },
};

const DEFAULT_EXPIRES_IN: i64 = 3600;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/connect-google", get(connect_google))
        .route("/oauth2callback", get(oauth2_callback))
        .route("/is-google-calendar-connected", get(is_connected))
        .route("/add-calendar-event", post(add_calendar_event))
}

fn calendar(app_state: &AppState) -> Result<Arc<dyn CalendarGateway>, ApiError> {
    app_state
        .calendar
        .clone()
        .ok_or_else(|| unavailable_error("Google Calendar is not configured"))
}

/// Stored form of a token grant. A refresh grant usually omits the refresh token, so the
/// previous one is carried over.
fn token_from_grant(
    user_id: &str,
    grant: TokenGrant,
    previous_refresh: Option<String>,
) -> Option<GoogleToken> {
    let access_token = grant.access_token.filter(|t| !t.is_empty())?;
    let expires_in = grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
    Some(GoogleToken {
        user_id: user_id.to_string(),
        access_token,
        refresh_token: grant.refresh_token.or(previous_refresh),
        scope: grant.scope,
        token_type: grant.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_in,
        expiry_date: Utc::now() + Duration::seconds(expires_in),
    })
}

async fn connect_google(
    State(app_state): State<AppState>,
    current: CurrentUser,
) -> Result<Redirect, ApiError> {
    let calendar = calendar(&app_state)?;
    let state = app_state.authorizations.issue(&current.user.user_id);
    let consent_url = calendar.consent_url(&state).map_err(|e| {
        error!("Failed to build consent URL: {}", e);
        internal_error("Failed to build consent URL", &e.to_string())
    })?;
    info!(user_id = %current.user.user_id, "Starting Google Calendar authorization");
    Ok(Redirect::to(&consent_url))
}

/// Google redirects the browser here, so the caller is identified by the `state` issued at
/// `connect-google`, not a credential
async fn oauth2_callback(
    State(app_state): State<AppState>,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Value> {
    let calendar = calendar(&app_state)?;
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Err(bad_request_error("code and state are required"));
    };
    let Some(user_id) = app_state.authorizations.consume(&state) else {
        warn!("OAuth callback with unknown or expired state");
        return Err(bad_request_error("Invalid or expired authorization state"));
    };

    let grant = calendar.exchange_code(&code).await.map_err(|e| {
        error!("Google code exchange failed: {}", e);
        bad_gateway_error("Token exchange failed", &e.to_string())
    })?;
    let raw = grant.raw.clone();
    let Some(token) = token_from_grant(&user_id, grant, None) else {
        warn!(user_id = %user_id, "Code exchange returned no access token");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Token exchange failed", "details": raw })),
        ));
    };

    app_state
        .repository
        .save_google_token(token)
        .await
        .map_err(storage_error)?;
    info!(user_id = %user_id, "Google Calendar connected");
    Ok(Json(json!({ "message": "Google Calendar connected successfully!" })))
}

async fn is_connected(State(app_state): State<AppState>, current: CurrentUser) -> ApiResult<Value> {
    let token = app_state
        .repository
        .google_token(&current.user.user_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(json!({ "isConnected": token.is_some() })))
}

/// Live access token of a user, refreshing an expired one when a refresh token is stored
async fn access_token(
    app_state: &AppState,
    calendar: &dyn CalendarGateway,
    user_id: &str,
) -> Result<String, ApiError> {
    let token = app_state
        .repository
        .google_token(user_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| bad_request_error("Google Calendar is not connected"))?;
    if !token.is_expired(Utc::now()) {
        return Ok(token.access_token);
    }

    let Some(refresh_token) = token.refresh_token.clone() else {
        return Err(bad_request_error(
            "Google Calendar authorization expired, reconnect the calendar",
        ));
    };
    let grant = calendar.refresh(&refresh_token).await.map_err(|e| {
        error!("Google token refresh failed: {}", e);
        bad_gateway_error("Token refresh failed", &e.to_string())
    })?;
    let refreshed = token_from_grant(user_id, grant, Some(refresh_token)).ok_or_else(|| {
        bad_request_error("Google Calendar authorization expired, reconnect the calendar")
    })?;
    let access_token = refreshed.access_token.clone();
    app_state
        .repository
        .save_google_token(refreshed)
        .await
        .map_err(storage_error)?;
    info!(user_id = %user_id, "Refreshed Google access token");
    Ok(access_token)
}

async fn add_calendar_event(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Json(request): Json<CalendarEventRequest>,
) -> ApiResult<Value> {
    let calendar = calendar(&app_state)?;
    let event = build_event(&request, &app_state.config.default_timezone)
        .map_err(|message| bad_request_error(&message))?;
    let access_token = access_token(&app_state, calendar.as_ref(), &current.user.user_id).await?;

    let created = calendar
        .insert_event(&access_token, &event)
        .await
        .map_err(|e| {
            error!("Calendar event creation failed: {}", e);
            bad_gateway_error("Failed to create calendar event", &e.to_string())
        })?;

    info!(
        user_id = %current.user.user_id,
        event_id = %created.id,
        recurring = !event.recurrence.is_empty(),
        "Created calendar event"
    );
    Ok(Json(json!({
        "message": format!("Reminder '{}' added to Google Calendar", event.summary),
        "event_id": created.id,
        "html_link": created.html_link
    })))
}
