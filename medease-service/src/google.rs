//! Google OAuth2 (authorization-code grant) and Calendar event creation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use dashmap::DashMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{auth::random_token, config::GoogleOAuthConfig, models::CalendarEventRequest};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const EVENTS_URL: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

/// Token endpoint answer. `access_token` is absent when the exchange failed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenGrant {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventTime {
    #[serde(rename = "dateTime")]
    pub date_time: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

/// Event body as sent to the Calendar API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedEvent {
    pub id: String,
    #[serde(rename = "htmlLink", default)]
    pub html_link: Option<String>,
}

#[async_trait]
pub trait CalendarGateway: Send + Sync {
    /// Consent screen URL; `state` comes back to the callback untouched
    fn consent_url(&self, state: &str) -> anyhow::Result<String>;
    async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant>;
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenGrant>;
    async fn insert_event(
        &self,
        access_token: &str,
        event: &CalendarEvent,
    ) -> anyhow::Result<CreatedEvent>;
}

pub struct GoogleCalendar {
    http: reqwest::Client,
    oauth: GoogleOAuthConfig,
}

impl GoogleCalendar {
    pub fn new(oauth: GoogleOAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            oauth,
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> anyhow::Result<TokenGrant> {
        let response = self.http.post(TOKEN_URL).form(params).send().await?;
        let raw: Value = response.json().await?;
        let mut grant: TokenGrant = serde_json::from_value(raw.clone()).unwrap_or_default();
        grant.raw = raw;
        Ok(grant)
    }
}

#[async_trait]
impl CalendarGateway for GoogleCalendar {
    fn consent_url(&self, state: &str) -> anyhow::Result<String> {
        let url = Url::parse_with_params(
            AUTH_URL,
            &[
                ("client_id", self.oauth.client_id.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", CALENDAR_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant> {
        info!("Exchanging Google authorization code");
        self.token_request(&[
            ("code", code),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("redirect_uri", self.oauth.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenGrant> {
        info!("Refreshing Google access token");
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn insert_event(
        &self,
        access_token: &str,
        event: &CalendarEvent,
    ) -> anyhow::Result<CreatedEvent> {
        let response = self
            .http
            .post(EVENTS_URL)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            error!(status = %status, "Calendar API rejected event");
            anyhow::bail!("calendar API returned {}: {}", status, details);
        }
        Ok(response.json().await?)
    }
}

/// Single-use `state` values handed to the consent screen, each bound to the user that
/// started the authorization
pub struct PendingAuthorizations {
    states: DashMap<String, (String, DateTime<Utc>)>,
    ttl: Duration,
}

impl PendingAuthorizations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Fresh unguessable state for `user_id`; abandoned states are swept here
    pub fn issue(&self, user_id: &str) -> String {
        let now = Utc::now();
        self.states.retain(|_, (_, expires_at)| *expires_at > now);
        let state = random_token();
        self.states
            .insert(state.clone(), (user_id.to_string(), now + self.ttl));
        state
    }

    /// User bound to a live state. A state is accepted at most once.
    pub fn consume(&self, state: &str) -> Option<String> {
        let (_, (user_id, expires_at)) = self.states.remove(state)?;
        if expires_at <= Utc::now() {
            debug!("Rejecting expired authorization state");
            return None;
        }
        Some(user_id)
    }
}

/// Event start or end as given by the caller
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParsedTime {
    Zoned(DateTime<FixedOffset>),
    Local(NaiveDateTime),
}

impl ParsedTime {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
            return Some(ParsedTime::Zoned(zoned));
        }
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(ParsedTime::Local)
    }

    fn local(&self) -> NaiveDateTime {
        match self {
            ParsedTime::Zoned(zoned) => zoned.naive_local(),
            ParsedTime::Local(naive) => *naive,
        }
    }

    /// Later-or-equal check; instants when both carry an offset, wall-clock otherwise
    fn not_before(&self, other: &ParsedTime) -> bool {
        match (self, other) {
            (ParsedTime::Zoned(a), ParsedTime::Zoned(b)) => a >= b,
            _ => self.local() >= other.local(),
        }
    }

    fn to_event_time(self, time_zone: &str) -> EventTime {
        let date_time = match self {
            ParsedTime::Zoned(zoned) => zoned.to_rfc3339(),
            ParsedTime::Local(naive) => naive.format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        EventTime {
            date_time,
            time_zone: time_zone.to_string(),
        }
    }
}

/// Validate a reminder request and turn it into a Calendar event body
pub fn build_event(
    request: &CalendarEventRequest,
    time_zone: &str,
) -> Result<CalendarEvent, String> {
    if request.summary.trim().is_empty() {
        return Err("summary is required".to_string());
    }
    let start = ParsedTime::parse(&request.start_time)
        .ok_or_else(|| format!("invalid start_time: {:?}", request.start_time))?;
    let end = ParsedTime::parse(&request.end_time)
        .ok_or_else(|| format!("invalid end_time: {:?}", request.end_time))?;
    if !end.not_before(&start) {
        return Err("end_time must not be before start_time".to_string());
    }

    let recurrence = match request.recurrence_days {
        Some(days) if days > 1 => vec![format!("RRULE:FREQ=DAILY;COUNT={days}")],
        _ => Vec::new(),
    };
    let blank_to_none = |value: &Option<String>| {
        value
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(CalendarEvent {
        summary: request.summary.trim().to_string(),
        description: blank_to_none(&request.description),
        location: blank_to_none(&request.location),
        start: start.to_event_time(time_zone),
        end: end.to_event_time(time_zone),
        recurrence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(start: &str, end: &str, recurrence_days: Option<u32>) -> CalendarEventRequest {
        serde_json::from_value(json!({
            "summary": "Take aspirin",
            "start_time": start,
            "end_time": end,
            "recurrence_days": recurrence_days,
        }))
        .unwrap()
    }

    #[test]
    fn daily_recurrence_only_for_more_than_one_day() {
        let event = build_event(
            &request("2025-05-02T09:00:00", "2025-05-02T09:15:00", Some(3)),
            "Europe/London",
        )
        .unwrap();
        assert_eq!(event.recurrence, vec!["RRULE:FREQ=DAILY;COUNT=3"]);
        assert_eq!(event.start.date_time, "2025-05-02T09:00:00");
        assert_eq!(event.start.time_zone, "Europe/London");

        let once = build_event(
            &request("2025-05-02T09:00", "2025-05-02T09:15", Some(1)),
            "UTC",
        )
        .unwrap();
        assert!(once.recurrence.is_empty());
    }

    #[test]
    fn rfc3339_times_keep_their_offset() {
        let event = build_event(
            &request("2025-05-02T09:00:00+02:00", "2025-05-02T07:30:00Z", None),
            "UTC",
        )
        .unwrap();
        assert_eq!(event.start.date_time, "2025-05-02T09:00:00+02:00");
    }

    #[test]
    fn end_before_start_is_rejected() {
        let err = build_event(
            &request("2025-05-02T09:00:00", "2025-05-02T08:00:00", None),
            "UTC",
        )
        .unwrap_err();
        assert!(err.contains("end_time"));
        assert!(build_event(&request("tomorrow", "2025-05-02T08:00:00", None), "UTC").is_err());
    }

    #[test]
    fn consent_url_carries_state_and_offline_access() {
        let calendar = GoogleCalendar::new(GoogleOAuthConfig {
            client_id: "client".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost:8081/google/oauth2callback".into(),
        });
        let url = calendar.consent_url("nonce-1").unwrap();
        assert!(url.starts_with(AUTH_URL));
        let parsed = Url::parse(&url).unwrap();
        let query: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(query.contains(&("state".into(), "nonce-1".into())));
        assert!(query.contains(&("access_type".into(), "offline".into())));
        assert!(query.contains(&(
            "redirect_uri".into(),
            "http://localhost:8081/google/oauth2callback".into()
        )));
    }

    #[test]
    fn authorization_state_is_single_use() {
        let pending = PendingAuthorizations::new(Duration::minutes(10));
        let state = pending.issue("user-1");
        assert_ne!(state, "user-1");
        assert_eq!(pending.consume("user-1"), None);
        assert_eq!(pending.consume(&state).as_deref(), Some("user-1"));
        assert_eq!(pending.consume(&state), None);
    }

    #[test]
    fn expired_authorization_state_is_rejected_and_swept() {
        let pending = PendingAuthorizations::new(Duration::seconds(-1));
        let stale = pending.issue("user-1");
        assert_eq!(pending.consume(&stale), None);

        pending.issue("user-2");
        pending.issue("user-3");
        assert_eq!(pending.len(), 1);
    }
}
