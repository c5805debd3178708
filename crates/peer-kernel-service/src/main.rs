use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use peer_kernel_api::{
    PeerInstructionApi, SubmitAnswerRequest, ValidateFormRequest, API_CONTRACT_VERSION,
};
use peer_kernel_core::{AmbientIdentity, ExerciseConfig, ExerciseError};
use serde::Serialize;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const STUDENT_ID_HEADER: &str = "x-student-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: PeerInstructionApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct AcceptedResponse {
    success: bool,
}

#[derive(Debug, Parser)]
#[command(name = "peer-kernel-service")]
#[command(about = "Local HTTP service for the peer-instruction kernel")]
struct Args {
    #[arg(long, default_value = "./peer_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Map the typed core taxonomy onto HTTP status codes: authoring validation
/// failures are client errors, out-of-order submissions are permission
/// denials, and a missing identity means the caller cannot participate.
fn service_error(err: &anyhow::Error) -> ServiceError {
    let status = match peer_kernel_api::exercise_error(err) {
        Some(ExerciseError::Validation(_)) => StatusCode::BAD_REQUEST,
        Some(ExerciseError::OutOfOrder(_)) => StatusCode::FORBIDDEN,
        Some(ExerciseError::MissingStudentIdentity) => StatusCode::UNAUTHORIZED,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
        status,
    }
}

fn ambient_identity(headers: &HeaderMap, course_id: String) -> AmbientIdentity {
    AmbientIdentity {
        student_id: headers
            .get(STUDENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        course_id: Some(course_id),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/exercises/validate", post(validate_form))
        .route("/v1/exercises/:course_id/:item_id", get(exercise_view))
        .route("/v1/exercises/:course_id/:item_id/submit", post(submit_answer))
        .route("/v1/exercises/:course_id/:item_id/stats", get(exercise_stats))
        .route("/v1/exercises/:course_id/:item_id/config", put(studio_submit))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "peer_kernel=info,peer_kernel_service=info".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let state = ServiceState { api: PeerInstructionApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "peer-kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn exercise_view(
    State(state): State<ServiceState>,
    Path((course_id, item_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<peer_kernel_api::StudentView>>, ServiceError> {
    let ambient = ambient_identity(&headers, course_id);
    let view = state
        .api
        .get_student_view(&ambient, &item_id)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(view)))
}

async fn submit_answer(
    State(state): State<ServiceState>,
    Path((course_id, item_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<SubmitAnswerRequest>,
) -> Result<Json<ServiceEnvelope<peer_kernel_api::StudentView>>, ServiceError> {
    let ambient = ambient_identity(&headers, course_id);
    let view = state
        .api
        .submit_answer(&ambient, &item_id, &request)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(view)))
}

async fn exercise_stats(
    State(state): State<ServiceState>,
    Path((course_id, item_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<peer_kernel_core::Stats>>, ServiceError> {
    let stats = state
        .api
        .get_stats(&course_id, &item_id)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(stats)))
}

async fn studio_submit(
    State(state): State<ServiceState>,
    Path((course_id, item_id)): Path<(String, String)>,
    Json(config): Json<ExerciseConfig>,
) -> Result<Json<ServiceEnvelope<AcceptedResponse>>, ServiceError> {
    state
        .api
        .studio_submit(&course_id, &item_id, config)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(AcceptedResponse { success: true })))
}

async fn validate_form(
    State(state): State<ServiceState>,
    Json(request): Json<ValidateFormRequest>,
) -> Result<Json<ServiceEnvelope<AcceptedResponse>>, ServiceError> {
    state.api.validate_form(&request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(AcceptedResponse { success: true })))
}
