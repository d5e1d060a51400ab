use super::AppState;
use crate::application::query::parse_day;
use crate::domain::event::{HEADER_EVENT, HEADER_EVENT_VERSION, HEADER_PRODUCER, Message};
use crate::domain::user::{User, UserRole};
use crate::error::LedgerError;
use crate::interfaces::messaging::codec;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::BTreeMap;

pub const PRODUCER_TOKEN_HEADER: &str = "x-producer-token";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/balance/my", get(balance_my))
        .route("/log/my", get(log_my))
        .route("/log/{day}", get(log_on_day))
        .route("/income/today", get(income_today))
        .route("/income/{day}", get(income_on_day))
        .route("/closeday", post(close_day))
        .route("/events/{topic}", post(publish_event))
}

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    NotFound,
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" })),
            ApiError::Ledger(err) => match err {
                LedgerError::AuthFailure(_) => {
                    (StatusCode::FORBIDDEN, serde_json::json!({ "error": "forbidden" }))
                }
                LedgerError::ValidationError(msg) | LedgerError::Codec(msg) => {
                    (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
                }
                LedgerError::CloseIncomplete { cycle, failed } => {
                    tracing::error!(cycle, ?failed, "Close day failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({ "error": "close incomplete", "cycle": cycle, "failed": failed }),
                    )
                }
                other => {
                    tracing::error!("Request failed: {}", other);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({ "error": "internal error" }),
                    )
                }
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn authorize(state: &AppState, headers: &HeaderMap, roles: &[UserRole]) -> ApiResult<User> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    Ok(state.authorizer.authorize(authorization, roles).await?)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn balance_my(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let user = authorize(&state, &headers, &[UserRole::User]).await?;
    let account = state.engine.query().balance(user.id).await?;
    Ok(Json(account))
}

async fn log_my(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let user = authorize(&state, &headers, &[UserRole::User]).await?;
    Ok(Json(state.engine.query().log(user.id, None).await?))
}

async fn log_on_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = authorize(&state, &headers, &[UserRole::User]).await?;
    let day = parse_day(&day)?;
    Ok(Json(state.engine.query().log(user.id, Some(day)).await?))
}

async fn income_today(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &[UserRole::Admin, UserRole::Accountant]).await?;
    Ok(Json(state.engine.query().income(None).await?))
}

async fn income_on_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &[UserRole::Admin, UserRole::Accountant]).await?;
    let day = parse_day(&day)?;
    Ok(Json(state.engine.query().income(Some(day)).await?))
}

async fn close_day(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let admin = authorize(&state, &headers, &[UserRole::Admin]).await?;
    tracing::info!(by = %admin.public_id, "Close day requested");
    Ok(Json(state.engine.close_cycle().await?))
}

async fn publish_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let ingress = state.ingress.as_ref().ok_or(ApiError::NotFound)?;
    let token = headers.get(PRODUCER_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if token != Some(ingress.token.as_str()) {
        return Err(LedgerError::AuthFailure("Bad producer token".to_string()).into());
    }

    let mut envelope = BTreeMap::new();
    for (name, header) in [
        (HEADER_EVENT, "x-event"),
        (HEADER_PRODUCER, "x-producer"),
        (HEADER_EVENT_VERSION, "x-event-version"),
    ] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            envelope.insert(name.to_string(), value.to_string());
        }
    }
    let mut message = Message {
        topic,
        key: String::new(),
        headers: envelope,
        payload: body.to_vec(),
    };
    // Refuse poison at the door rather than dead-lettering it later.
    let event = codec::decode(&message)?;
    if event.topic() != message.topic {
        return Err(LedgerError::ValidationError(format!(
            "{} does not belong on {}",
            event.name(),
            message.topic
        ))
        .into());
    }
    message.key = event.key().to_string();
    ingress.sink.publish(message).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": event.name() }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::LedgerEngine;
    use crate::application::identity::Authorizer;
    use crate::application::pricing::FixedPricing;
    use crate::application::retry::RetryPolicy;
    use crate::domain::event::{DomainEvent, TaskEvent, UserCreated, topics};
    use crate::domain::task::TaskStatus;
    use crate::infrastructure::auth::{HttpIdentityVerifier, StaticIdentityVerifier};
    use crate::infrastructure::in_memory::{InMemoryBus, InMemoryLedgerStore};
    use crate::interfaces::http::app;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let engine = Arc::new(LedgerEngine::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(FixedPricing::new(12, 30)),
            RetryPolicy::immediate(1),
        ));
        for (id, role) in [
            ("u-1", UserRole::User),
            ("admin", UserRole::Admin),
            ("acc", UserRole::Accountant),
        ] {
            engine
                .process_event(DomainEvent::UserCreated(UserCreated {
                    public_id: id.into(),
                    login: id.into(),
                    role,
                }))
                .await
                .unwrap();
        }
        engine
            .process_event(DomainEvent::TaskCreated(TaskEvent {
                public_id: "t-1".into(),
                title: String::new(),
                description: String::new(),
                status: TaskStatus::Open,
                assignee_public_id: "u-1".into(),
                jira_id: None,
            }))
            .await
            .unwrap();
        let verifier = StaticIdentityVerifier::new()
            .with_token("user-token", "u-1")
            .with_token("admin-token", "admin")
            .with_token("acc-token", "acc");
        let authorizer = Arc::new(Authorizer::new(Arc::new(verifier), engine.identity()));
        AppState::new(engine, authorizer)
    }

    async fn call(state: AppState, method: &str, uri: &str, token: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let (status, body) = call(state().await, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_balance_and_log_for_user() {
        let state = state().await;
        let (status, body) = call(state.clone(), "GET", "/balance/my", Some("user-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], -12);

        let (status, body) = call(state, "GET", "/log/my", Some("user-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["operationType"], "assignmentCost");
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let state = state().await;
        for (method, uri, token) in [
            ("GET", "/balance/my", None),
            ("GET", "/balance/my", Some("admin-token")),
            ("GET", "/balance/my", Some("stolen")),
            ("GET", "/income/today", Some("user-token")),
            ("POST", "/closeday", Some("acc-token")),
        ] {
            let (status, _) = call(state.clone(), method, uri, token).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri} {token:?}");
        }
    }

    #[tokio::test]
    async fn test_auth_service_outage_is_internal_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = state().await;
        let verifier = Arc::new(HttpIdentityVerifier::new(&addr.to_string()));
        let state = AppState::new(
            state.engine.clone(),
            Arc::new(Authorizer::new(verifier, state.engine.identity())),
        );
        let (status, body) = call(state, "GET", "/balance/my", Some("user-token")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal error");
    }

    #[tokio::test]
    async fn test_malformed_day_is_bad_request() {
        let state = state().await;
        let (status, _) = call(state.clone(), "GET", "/log/03-01-2024", Some("user-token")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(state, "GET", "/income/not-a-day", Some("acc-token")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_close_day_then_income() {
        let state = state().await;
        let (status, body) = call(state.clone(), "GET", "/income/today", Some("acc-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["income"], -12);

        let (status, body) = call(state.clone(), "POST", "/closeday", Some("admin-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retagged"], 1);

        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let (_, body) = call(state.clone(), "GET", &format!("/income/{today}"), Some("admin-token")).await;
        assert_eq!(body["costsCharged"], 12);
        let (_, body) = call(state.clone(), "GET", &format!("/log/{today}"), Some("user-token")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (_, body) = call(state, "GET", "/log/my", Some("user-token")).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_event_requires_ingress_and_token() {
        let bus = InMemoryBus::new();
        let disabled = state().await;
        let (status, _) = call(disabled.clone(), "POST", "/events/task.lifecycle", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = disabled.with_ingress(Arc::new(bus.clone()), "secret");
        let encoded = codec::encode(&DomainEvent::TaskCompleted(TaskEvent {
            public_id: "t-1".into(),
            title: String::new(),
            description: String::new(),
            status: TaskStatus::Completed,
            assignee_public_id: "u-1".into(),
            jira_id: None,
        }))
        .unwrap();

        let request = |token: &str, topic: &str| {
            Request::builder()
                .method("POST")
                .uri(format!("/events/{topic}"))
                .header(PRODUCER_TOKEN_HEADER, token)
                .header("x-event", "Task.Completed")
                .header("x-producer", "taskmanager")
                .body(Body::from(encoded.payload.clone()))
                .unwrap()
        };

        let response = app(state.clone()).oneshot(request("nope", topics::TASK_LIFECYCLE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app(state.clone()).oneshot(request("secret", topics::USER_LIFECYCLE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = app(state).oneshot(request("secret", topics::TASK_LIFECYCLE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let queued = bus.drain(topics::TASK_LIFECYCLE).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].key, "t-1");
        assert_eq!(queued[0].header(HEADER_PRODUCER), Some("taskmanager"));
    }
}
