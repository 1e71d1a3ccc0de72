use axum::{
    Router,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::{Next, from_fn},
    response::Json,
    routing::get,
};
use chrono::Duration;
use medease_flow::{
    ChatEngine, Classifier, Generator, InMemoryReportStore, InMemorySessionRegistry,
    PostgresReportStore, ReportStore, SessionRegistry, SimplificationPipeline,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::TokenRegistry,
    config::Config,
    dispatch::InProcessDispatcher,
    google::{CalendarGateway, GoogleCalendar, PendingAuthorizations},
    llm::{HuggingFaceClassifier, OpenRouterGenerator},
    routes,
    store::{InMemoryRepository, PostgresRepository, Repository},
    uploads::ObjectUploads,
    ws,
};

/// How long a Google authorization may take between consent redirect and callback
const AUTHORIZATION_TTL_MINUTES: i64 = 10;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

pub fn unauthorized_error(message: &str) -> ApiError {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

pub fn forbidden_error(message: &str) -> ApiError {
    (StatusCode::FORBIDDEN, Json(json!({ "error": message })))
}

pub fn not_found_error(message: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

pub fn conflict_error(message: &str) -> ApiError {
    (StatusCode::CONFLICT, Json(json!({ "error": message })))
}

pub fn bad_gateway_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

pub fn unavailable_error(message: &str) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": message })),
    )
}

pub fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

/// 500 for a failed store operation
pub fn storage_error(e: impl std::fmt::Display) -> ApiError {
    error!("Storage error: {}", e);
    internal_error("Storage error", &e.to_string())
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<dyn Repository>,
    pub tokens: Arc<TokenRegistry>,
    pub generator: Arc<dyn Generator>,
    pub pipeline: SimplificationPipeline,
    /// None when no Google OAuth client is configured
    pub calendar: Option<Arc<dyn CalendarGateway>>,
    pub authorizations: Arc<PendingAuthorizations>,
    /// None when no upload bucket is configured
    pub uploads: Option<Arc<ObjectUploads>>,
}

impl AppState {
    pub fn new(
        config: Config,
        repository: Arc<dyn Repository>,
        reports: Arc<dyn ReportStore>,
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn Generator>,
        calendar: Option<Arc<dyn CalendarGateway>>,
    ) -> Self {
        let tokens = Arc::new(TokenRegistry::new(Duration::minutes(
            config.access_token_ttl_minutes,
        )));
        let pipeline = SimplificationPipeline::new(classifier, generator.clone(), reports);
        let uploads = config
            .s3
            .clone()
            .map(|s3| Arc::new(ObjectUploads::new(s3)));
        Self {
            config: Arc::new(config),
            repository,
            tokens,
            generator,
            pipeline,
            calendar,
            authorizations: Arc::new(PendingAuthorizations::new(Duration::minutes(
                AUTHORIZATION_TTL_MINUTES,
            ))),
            uploads,
        }
    }
}

/// Build the full application from configuration
pub async fn create_app(config: Config) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_app(app_state))
}

async fn create_app_state(config: Config) -> anyhow::Result<AppState> {
    let (repository, reports) = create_storage(config.database_url.as_deref()).await;
    let generator: Arc<dyn Generator> = Arc::new(OpenRouterGenerator::from_config(&config)?);
    let classifier: Arc<dyn Classifier> = Arc::new(HuggingFaceClassifier::from_config(&config));
    let calendar: Option<Arc<dyn CalendarGateway>> = match &config.google {
        Some(oauth) => Some(Arc::new(GoogleCalendar::new(oauth.clone()))),
        None => {
            warn!("Google OAuth client not configured, calendar routes are disabled");
            None
        }
    };
    if config.s3.is_none() {
        warn!("S3 upload bucket not configured, upload URLs are disabled");
    }

    Ok(AppState::new(
        config, repository, reports, classifier, generator, calendar,
    ))
}

/// Use PostgreSQL when DATABASE_URL is set and reachable, otherwise in-memory storage
async fn create_storage(
    database_url: Option<&str>,
) -> (Arc<dyn Repository>, Arc<dyn ReportStore>) {
    let Some(database_url) = database_url else {
        info!("Using in-memory storage (set DATABASE_URL to use PostgreSQL)");
        return (
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryReportStore::new()),
        );
    };

    info!("Using PostgreSQL storage");
    let repository = PostgresRepository::connect(database_url).await;
    let reports = PostgresReportStore::connect(database_url).await;
    match (repository, reports) {
        (Ok(repository), Ok(reports)) => (Arc::new(repository), Arc::new(reports)),
        (Err(e), _) | (_, Err(e)) => {
            error!(
                "Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.",
                e
            );
            (
                Arc::new(InMemoryRepository::new()),
                Arc::new(InMemoryReportStore::new()),
            )
        }
    }
}

/// API routes plus the chat socket. Chat actions are dispatched in-process against the
/// API routes, so the socket route is merged in after the dispatcher is built.
pub fn build_app(app_state: AppState) -> Router {
    build_app_with_sessions(app_state, Arc::new(InMemorySessionRegistry::new()))
}

pub fn build_app_with_sessions(app_state: AppState, sessions: Arc<dyn SessionRegistry>) -> Router {
    let cors = cors_layer(&app_state.config.cors_origins);
    let api = build_router(app_state.clone());

    let dispatcher = Arc::new(InProcessDispatcher::new(api.clone()));
    let engine = Arc::new(ChatEngine::new(
        app_state.generator.clone(),
        dispatcher,
        sessions,
    ));

    api.merge(ws::router(engine))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .nest("/auth", routes::auth::router())
        .nest("/medication", routes::medication::router())
        .nest("/general", routes::general::router())
        .nest("/caregiver", routes::caregiver::router())
        .nest("/google", routes::google::router())
        .nest("/simplify", routes::simplify::router())
        .nest("/upload", routes::upload::router())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value.clone());
        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %request.method(),
            path = %request.uri().path()
        );
        let mut response = next.run(request).instrument(span).await;
        response.headers_mut().insert("x-correlation-id", value);
        return response;
    }

    next.run(request).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "MedEase",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Medical assistant backend: report simplification, medication notes, caregiver sharing and calendar reminders",
        "endpoints": {
            "POST /auth/register": "Create an account",
            "POST /auth/login": "Log in and receive an access token",
            "POST /auth/logout": "Revoke the current access token",
            "GET /auth/user": "Current user",
            "POST /medication/extract-medication": "Extract a structured medication note from text",
            "GET /medication/latest": "Latest medication note",
            "GET /general/email": "Email of the current user",
            "POST /general/generate-key": "Store a caregiver share key",
            "GET /caregiver/patient-data": "Patient notes and reports for a caregiver holding a share key",
            "GET /google/connect-google": "Start Google Calendar authorization",
            "GET /google/oauth2callback": "Google authorization callback",
            "GET /google/is-google-calendar-connected": "Calendar connection status",
            "POST /google/add-calendar-event": "Create a calendar reminder",
            "POST /simplify/classify": "Stream the classification preview",
            "POST /simplify/stream": "Stream a simplified report",
            "POST /simplify/stream-and-save": "Stream a simplified report and save it",
            "GET /simplify/reports": "Saved simplified reports",
            "POST /upload/presigned-url": "Presigned URL for a direct file upload",
            "GET /ws": "Chat assistant WebSocket",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
