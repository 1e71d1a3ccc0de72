//! In-process application fixture for router tests.

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, header},
    response::Response,
};
use chrono::{Duration, Utc};
use medease_flow::{
    InMemoryReportStore, InMemorySessionRegistry,
    testing::{FixedClassifier, ScriptedGenerator},
};
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

use crate::{
    auth::{AuthUser, hash_password},
    config::{Config, S3UploadConfig},
    google::{CalendarEvent, CalendarGateway, CreatedEvent, TokenGrant},
    models::{GoogleToken, UserRecord},
    service::{AppState, build_app, build_app_with_sessions},
    store::{InMemoryRepository, Repository},
};

/// Calendar double: code "good" exchanges successfully, everything else fails
#[derive(Default)]
pub struct FakeCalendar {
    events: Mutex<Vec<(String, CalendarEvent)>>,
    reject: AtomicBool,
}

impl FakeCalendar {
    /// Access token and event of every accepted insert
    pub fn events(&self) -> Vec<(String, CalendarEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn reject_inserts(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CalendarGateway for FakeCalendar {
    fn consent_url(&self, state: &str) -> anyhow::Result<String> {
        Ok(format!("https://accounts.test/consent?state={state}"))
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant> {
        if code != "good" {
            return Ok(TokenGrant {
                raw: json!({"error": "invalid_grant"}),
                ..TokenGrant::default()
            });
        }
        Ok(TokenGrant {
            access_token: Some("live-token".into()),
            refresh_token: Some("refresh-1".into()),
            scope: Some(crate::google::CALENDAR_SCOPE.into()),
            token_type: Some("Bearer".into()),
            expires_in: Some(3600),
            raw: Value::Null,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: Some("refreshed-token".into()),
            expires_in: Some(3600),
            ..TokenGrant::default()
        })
    }

    async fn insert_event(
        &self,
        access_token: &str,
        event: &CalendarEvent,
    ) -> anyhow::Result<CreatedEvent> {
        if self.reject.load(Ordering::SeqCst) {
            anyhow::bail!("calendar API returned 403 Forbidden");
        }
        let mut events = self.events.lock().unwrap();
        events.push((access_token.to_string(), event.clone()));
        Ok(CreatedEvent {
            id: format!("evt-{}", events.len()),
            html_link: Some("https://calendar.test/event".into()),
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    pub generator: Arc<ScriptedGenerator>,
    pub repository: Arc<InMemoryRepository>,
    pub reports: Arc<InMemoryReportStore>,
    pub calendar: Arc<FakeCalendar>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(Config::default(), FixedClassifier::medical(), true)
    }

    pub fn with_classifier(classifier: FixedClassifier) -> Self {
        Self::build(Config::default(), classifier, true)
    }

    pub fn without_calendar() -> Self {
        Self::build(Config::default(), FixedClassifier::medical(), false)
    }

    pub fn with_uploads(s3: S3UploadConfig) -> Self {
        let config = Config {
            s3: Some(s3),
            ..Config::default()
        };
        Self::build(config, FixedClassifier::medical(), true)
    }

    fn build(config: Config, classifier: FixedClassifier, with_calendar: bool) -> Self {
        let generator = Arc::new(ScriptedGenerator::new());
        let repository = Arc::new(InMemoryRepository::new());
        let reports = Arc::new(InMemoryReportStore::new());
        let calendar = Arc::new(FakeCalendar::default());
        let gateway: Option<Arc<dyn CalendarGateway>> = if with_calendar {
            Some(calendar.clone())
        } else {
            None
        };

        let state = AppState::new(
            config,
            repository.clone(),
            reports.clone(),
            Arc::new(classifier),
            generator.clone(),
            gateway,
        );
        Self {
            state,
            generator,
            repository,
            reports,
            calendar,
        }
    }

    pub fn router(&self) -> Router {
        build_app(self.state.clone())
    }

    /// Full app whose chat sessions live in `sessions`
    pub fn router_with_sessions(&self, sessions: Arc<InMemorySessionRegistry>) -> Router {
        build_app_with_sessions(self.state.clone(), sessions)
    }

    /// Register a user directly and issue a token; returns (user_id, token)
    pub async fn login(&self, email: &str) -> (String, String) {
        let user_id = Uuid::new_v4().to_string();
        self.repository
            .insert_user(UserRecord {
                user_id: user_id.clone(),
                email: email.to_string(),
                hashed_password: hash_password("password"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let token = self.state.tokens.issue(AuthUser {
            user_id: user_id.clone(),
            email: email.to_string(),
        });
        (user_id, token)
    }

    /// Store a Google token that expires after `ttl` (negative for already expired)
    pub async fn connect_calendar(&self, user_id: &str, ttl: Duration) {
        self.repository
            .save_google_token(GoogleToken {
                user_id: user_id.to_string(),
                access_token: "live-token".into(),
                refresh_token: Some("refresh-1".into()),
                scope: None,
                token_type: "Bearer".into(),
                expires_in: ttl.num_seconds(),
                expiry_date: Utc::now() + ttl,
            })
            .await
            .unwrap();
    }
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn read_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn read_json(response: Response) -> Value {
    serde_json::from_str(&read_text(response).await).unwrap()
}
