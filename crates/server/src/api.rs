use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use autopoliza_agent::{Orchestrator, OrchestratorError, SessionStatus, TurnRequest, TurnResponse};
use autopoliza_core::domain::session::{ControlMode, Message, Session, SessionId};

#[derive(Clone)]
pub struct ApiState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub control_mode: Option<ControlMode>,
}

#[derive(Debug, Deserialize)]
pub struct AdvisorMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/v1/turns", post(submit_turn))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{session_id}", get(session_status))
        .route("/api/v1/sessions/{session_id}/advisor/messages", post(post_advisor_message))
        .route("/api/v1/sessions/{session_id}/release", post(release_session))
        .with_state(ApiState { orchestrator })
}

fn api_error(error: OrchestratorError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        OrchestratorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::EmptyInput => StatusCode::BAD_REQUEST,
        OrchestratorError::Domain(_) => StatusCode::CONFLICT,
        OrchestratorError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error_class = error.error_class(), error = %error, "api request failed");
    (status, Json(ApiError { error: error.error_class().to_string(), message: error.to_string() }))
}

/// Failed turns still carry the apology envelope; the status code reflects the class.
async fn submit_turn(
    State(state): State<ApiState>,
    Json(request): Json<TurnRequest>,
) -> (StatusCode, Json<TurnResponse>) {
    let response = state.orchestrator.process_turn(request).await;
    let status = match response.error.as_deref() {
        _ if response.success => StatusCode::OK,
        Some("bad_request") => StatusCode::BAD_REQUEST,
        Some("store_unavailable") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(response))
}

async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<SessionListQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state.orchestrator.list_sessions(query.control_mode).await.map_err(api_error)?;
    Ok(Json(sessions))
}

async fn session_status(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<SessionStatus>> {
    let status = state
        .orchestrator
        .get_session_status(&SessionId(session_id))
        .await
        .map_err(api_error)?;
    Ok(Json(status))
}

async fn post_advisor_message(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<AdvisorMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state
        .orchestrator
        .post_advisor_message(&SessionId(session_id.clone()), &body.content)
        .await
        .map_err(api_error)?;
    info!(session_id = %session_id, message_id = %message.id.0, "advisor message accepted");
    Ok((StatusCode::CREATED, Json(message)))
}

async fn release_session(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<Session>> {
    let session =
        state.orchestrator.release_session(&SessionId(session_id)).await.map_err(api_error)?;
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    use autopoliza_agent::{AgentRuntime, SessionStatus, TurnResponse};
    use autopoliza_core::config::AppConfig;
    use autopoliza_core::domain::session::{ControlMode, Session};
    use autopoliza_db::InMemorySessionStore;

    use super::{router, ApiError};

    fn app() -> Router {
        let runtime = AgentRuntime::from_config(
            &AppConfig::default(),
            Arc::new(InMemorySessionStore::default()),
        )
        .expect("runtime");
        router(runtime.orchestrator())
    }

    async fn call<T: DeserializeOwned>(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response =
            app.clone().oneshot(request.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn turn_endpoint_returns_envelope() {
        let app = app();

        let (status, response): (_, TurnResponse) = call(
            &app,
            Method::POST,
            "/api/v1/turns",
            Some(json!({ "session_id": "S-http", "user_input": "hola" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(response.success);
        assert_eq!(response.handler, "consultation");
        assert_eq!(response.session_id, "S-http");
    }

    #[tokio::test]
    async fn blank_turn_is_bad_request_with_apology() {
        let (status, response): (_, TurnResponse) = call(
            &app(),
            Method::POST,
            "/api/v1/turns",
            Some(json!({ "session_id": "S-http", "user_input": "  " })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
        assert!(response.content.starts_with("Lo siento"));
    }

    #[tokio::test]
    async fn advisor_flow_over_http() {
        let app = app();
        let _: (_, TurnResponse) = call(
            &app,
            Method::POST,
            "/api/v1/turns",
            Some(json!({ "session_id": "S-adv", "user_input": "quiero hablar con un asesor" })),
        )
        .await;

        let (status, cases): (_, Vec<Session>) =
            call(&app, Method::GET, "/api/v1/sessions?control_mode=transferred", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cases.len(), 1);

        let (status, _): (_, serde_json::Value) = call(
            &app,
            Method::POST,
            "/api/v1/sessions/S-adv/advisor/messages",
            Some(json!({ "content": "Hola, soy Laura." })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, released): (_, Session) =
            call(&app, Method::POST, "/api/v1/sessions/S-adv/release", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released.control_mode, ControlMode::Automated);

        let (_, session_status): (_, SessionStatus) =
            call(&app, Method::GET, "/api/v1/sessions/S-adv", None).await;
        assert!(session_status.exists);
        assert_eq!(session_status.message_count, 3);
    }

    #[tokio::test]
    async fn advisor_message_for_unknown_session_is_not_found() {
        let (status, error): (_, ApiError) = call(
            &app(),
            Method::POST,
            "/api/v1/sessions/S-missing/advisor/messages",
            Some(json!({ "content": "hola" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error.error, "not_found");
    }
}
