use axum::{
    Router,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::{StreamExt, future};
use medease_flow::{FragmentStream, ReportOwner};
use std::convert::Infallible;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    models::{ReportSummary, SimplifyRequest},
    service::{ApiError, ApiResult, AppState, bad_request_error, storage_error},
};

const REPORT_NAME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/classify", post(classify))
        .route("/stream", post(stream))
        .route("/stream-and-save", post(stream_and_save))
        .route("/reports", get(reports))
}

/// Plain-text body over a fragment stream. A failure becomes one terminal
/// `[error]` fragment and ends the body.
fn text_stream(fragments: FragmentStream) -> Response {
    let body = fragments.scan(false, |failed, item| {
        if *failed {
            return future::ready(None);
        }
        let chunk = match item {
            Ok(fragment) => fragment,
            Err(e) => {
                error!("Simplification stream failed: {}", e);
                *failed = true;
                format!("\n[error] {}\n", e)
            }
        };
        future::ready(Some(Ok::<_, Infallible>(chunk)))
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response()
}

fn require_text(request: &SimplifyRequest) -> Result<String, ApiError> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(bad_request_error("text is required"));
    }
    Ok(text.to_string())
}

async fn classify(
    State(app_state): State<AppState>,
    Json(request): Json<SimplifyRequest>,
) -> Result<Response, ApiError> {
    let text = require_text(&request)?;
    Ok(text_stream(app_state.pipeline.stream_classification(text)))
}

async fn stream(
    State(app_state): State<AppState>,
    Json(request): Json<SimplifyRequest>,
) -> Result<Response, ApiError> {
    let text = require_text(&request)?;
    info!(chars = text.len(), "Streaming simplification");
    Ok(text_stream(app_state.pipeline.stream_simplify(text)))
}

async fn stream_and_save(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Json(request): Json<SimplifyRequest>,
) -> Result<Response, ApiError> {
    let text = require_text(&request)?;
    let report_id = request
        .report_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        user_id = %current.user.user_id,
        report_id = %report_id,
        "Streaming simplification with persistence"
    );
    let owner = ReportOwner {
        user_id: current.user.user_id,
        report_id,
        user_email: current.user.email,
    };
    Ok(text_stream(app_state.pipeline.stream_and_persist(text, owner)))
}

async fn reports(
    State(app_state): State<AppState>,
    current: CurrentUser,
) -> ApiResult<Vec<ReportSummary>> {
    let reports = app_state
        .pipeline
        .reports()
        .list_for_user(&current.user.user_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(
        reports
            .into_iter()
            .map(|report| ReportSummary {
                name: report.date_created.format(REPORT_NAME_FORMAT).to_string(),
                original_report: report.original_report,
                simplified_report: report.simplified_report,
                formatted_simplified_report: report.formatted_simplified_report,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{TestApp, get_request, json_request, read_json, read_text};
    use axum::http::{StatusCode, header};
    use medease_flow::{
        pipeline::{DONE_FRAGMENT, REJECTION_FRAGMENT},
        testing::{FixedClassifier, StreamScript},
    };
    use serde_json::json;
    use tower::ServiceExt;

    fn script_four_stages(app: &TestApp) {
        app.generator
            .push_stream(StreamScript::fragments(["BP normal, ", "no fever."]));
        app.generator
            .push_stream(StreamScript::fragments(["Blood pressure normal. No fever."]));
        app.generator
            .push_stream(StreamScript::fragments(["Your blood pressure is normal."]));
        app.generator
            .push_stream(StreamScript::fragments(["- Blood pressure: normal"]));
    }

    #[tokio::test]
    async fn non_medical_text_is_rejected_in_stream() {
        let app = TestApp::with_classifier(FixedClassifier::non_medical());
        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/simplify/stream",
                None,
                &json!({"text": "lol what's up"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let body = read_text(response).await;
        assert!(body.ends_with(REJECTION_FRAGMENT));
        assert!(app.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn stream_and_save_persists_and_lists_report() {
        let app = TestApp::new();
        let (_, token) = app.login("pat@example.com").await;
        script_four_stages(&app);

        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/simplify/stream-and-save",
                Some(&token),
                &json!({"text": "BP 120/80, afebrile", "report_id": "r-1"}),
            ))
            .await
            .unwrap();
        let body = read_text(response).await;
        assert!(body.contains(DONE_FRAGMENT));
        assert!(body.ends_with("- Blood pressure: normal"));
        assert_eq!(app.reports.len(), 1);

        let response = app
            .router()
            .oneshot(get_request("/simplify/reports", Some(&token)))
            .await
            .unwrap();
        let reports = read_json(response).await;
        assert_eq!(reports.as_array().unwrap().len(), 1);
        assert_eq!(reports[0]["original_report"], "BP 120/80, afebrile");
        assert_eq!(reports[0]["simplified_report"], "Your blood pressure is normal.");
        assert_eq!(reports[0]["name"].as_str().unwrap().len(), 19);
    }

    #[tokio::test]
    async fn failure_mid_stream_ends_with_error_fragment() {
        let app = TestApp::new();
        app.generator
            .push_stream(StreamScript::fail_after(["partial "], "upstream closed"));

        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/simplify/stream",
                None,
                &json!({"text": "Hb 13.2 g/dL"}),
            ))
            .await
            .unwrap();
        let body = read_text(response).await;
        assert!(body.contains("partial "));
        assert!(body.ends_with("upstream closed\n"));
        assert_eq!(body.matches("[error]").count(), 1);
    }

    #[tokio::test]
    async fn classify_streams_preview_only() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/simplify/classify",
                None,
                &json!({"text": "Hb 13.2 g/dL"}),
            ))
            .await
            .unwrap();
        let body = read_text(response).await;
        assert!(body.contains("medical report"));
        assert!(app.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_text_and_anonymous_save_are_rejected() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(json_request("POST", "/simplify/stream", None, &json!({"text": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/simplify/stream-and-save",
                None,
                &json!({"text": "Hb 13.2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn same_report_id_from_another_user_does_not_touch_own_report() {
        let app = TestApp::new();
        let (_, alice) = app.login("alice@example.com").await;
        let (_, bob) = app.login("bob@example.com").await;

        for (token, text) in [(&alice, "Alice: Hb 13.2"), (&bob, "Bob: CRP 40")] {
            script_four_stages(&app);
            let response = app
                .router()
                .oneshot(json_request(
                    "POST",
                    "/simplify/stream-and-save",
                    Some(token),
                    &json!({"text": text, "report_id": "r-1"}),
                ))
                .await
                .unwrap();
            assert!(read_text(response).await.contains(DONE_FRAGMENT));
        }
        assert_eq!(app.reports.len(), 2);

        let response = app
            .router()
            .oneshot(get_request("/simplify/reports", Some(&alice)))
            .await
            .unwrap();
        let reports = read_json(response).await;
        assert_eq!(reports.as_array().unwrap().len(), 1);
        assert_eq!(reports[0]["original_report"], "Alice: Hb 13.2");
    }
}
