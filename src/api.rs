//! HTTP surface for the PDF summarizer.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /summaries?user_id=..&file_name=..` – Upload a PDF as the raw request body and follow
//!   its progress as a Server-Sent Events stream. Each event carries a `ProgressEvent` JSON
//!   payload and is named after its stage; the stream ends after `completed` or `failed`.
//!   Closing the connection cancels the request.
//! - `GET /users/:user_id/prompt` – Show the instruction applied to the user's uploads.
//! - `PUT /users/:user_id/prompt` – Set a custom instruction (`422` when blank).
//! - `DELETE /users/:user_id/prompt` – Return to the default instruction.
//! - `GET /metrics` – Observe request and chunk counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.

use crate::blob::BlobError;
use crate::notify::{ChannelNotifier, deliver};
use crate::processing::{
    DocumentRef, InvalidPromptError, Orchestrator, PromptProfile, UserId,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

/// Extra room on top of the document ceiling so oversized uploads reach the fetch-time check.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

const DEFAULT_FILE_NAME: &str = "document.pdf";

/// Build the HTTP router exposing the summarization API surface.
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let body_limit = usize::try_from(orchestrator.settings().max_document_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);
    Router::new()
        .route("/summaries", post(create_summary))
        .route(
            "/users/:user_id/prompt",
            get(get_prompt).put(set_prompt).delete(reset_prompt),
        )
        .route("/metrics", get(get_metrics))
        .route("/commands", get(get_commands))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(orchestrator)
}

/// Query parameters of `POST /summaries`.
#[derive(Deserialize)]
struct SummaryParams {
    /// Requesting user; selects the prompt profile.
    user_id: String,
    /// Name of the uploaded file (defaults to `document.pdf`).
    #[serde(default)]
    file_name: Option<String>,
}

/// Store the upload, start a request, and stream its progress.
///
/// The pipeline runs on its own task and pushes events through a [`ChannelNotifier`]; when the
/// client goes away the receiver is dropped and the task abandons the request.
async fn create_summary(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(params): Query<SummaryParams>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    if body.is_empty() {
        return Err(AppError::EmptyUpload);
    }
    let file_name = params
        .file_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
    let file_ref = orchestrator.blobs().store(&file_name, body).await?;
    let request = orchestrator.submit(
        &UserId(params.user_id),
        DocumentRef {
            file_ref,
            file_name,
        },
    );

    let (notifier, mut receiver) = ChannelNotifier::channel();
    let worker = orchestrator.clone();
    tokio::spawn(async move {
        let request_id = request.request_id;
        tokio::select! {
            terminal = deliver(worker.run(request), &notifier) => {
                if terminal.is_none() {
                    tracing::warn!(request_id = %request_id, "Request ended without a terminal event");
                }
            }
            () = notifier.closed() => {
                tracing::info!(request_id = %request_id, "Requester disconnected; request cancelled");
            }
        }
    });

    let events = async_stream::stream! {
        while let Some(event) = receiver.recv().await {
            yield Event::default().event(event.stage.name()).json_data(&event);
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Response body for the prompt endpoints.
#[derive(Serialize)]
struct PromptResponse {
    user_id: String,
    /// Instruction applied to the user's next upload.
    instruction: String,
    /// Whether the instruction is a custom one.
    custom: bool,
    /// RFC 3339 timestamp of the last change, absent for the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

impl PromptResponse {
    fn new(profile: PromptProfile, default_instruction: &str) -> Self {
        Self {
            custom: profile.is_custom(),
            updated_at: profile
                .updated_at
                .and_then(|timestamp| timestamp.format(&Rfc3339).ok()),
            instruction: profile
                .custom_instruction
                .unwrap_or_else(|| default_instruction.to_string()),
            user_id: profile.user_id.0,
        }
    }
}

async fn get_prompt(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(user_id): Path<String>,
) -> Json<PromptResponse> {
    let prompts = orchestrator.prompts();
    let profile = prompts.profile(&UserId(user_id));
    Json(PromptResponse::new(profile, prompts.default_instruction()))
}

/// Request body for `PUT /users/:user_id/prompt`.
#[derive(Deserialize)]
struct SetPromptRequest {
    instruction: String,
}

async fn set_prompt(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(user_id): Path<String>,
    Json(request): Json<SetPromptRequest>,
) -> Result<Json<PromptResponse>, AppError> {
    let prompts = orchestrator.prompts();
    let profile = prompts.set(&UserId(user_id), &request.instruction)?;
    Ok(Json(PromptResponse::new(
        profile,
        prompts.default_instruction(),
    )))
}

/// Response body for `DELETE /users/:user_id/prompt`.
#[derive(Serialize)]
struct ResetPromptResponse {
    /// Whether a custom prompt existed before the reset.
    reset: bool,
    instruction: String,
}

async fn reset_prompt(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(user_id): Path<String>,
) -> Json<ResetPromptResponse> {
    let prompts = orchestrator.prompts();
    Json(ResetPromptResponse {
        reset: prompts.reset(&UserId(user_id)),
        instruction: prompts.default_instruction().to_string(),
    })
}

/// Return request and chunk counters.
async fn get_metrics(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.metrics().snapshot())
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "summarize",
                method: "POST",
                path: "/summaries?user_id={user_id}&file_name={file_name}",
                description: "Upload a PDF as the raw request body. Responds with a Server-Sent Events stream of progress events ending in `completed` (with the summary) or `failed`.",
                request_example: None,
            },
            CommandDescriptor {
                name: "get_prompt",
                method: "GET",
                path: "/users/{user_id}/prompt",
                description: "Show the instruction applied to the user's uploads.",
                request_example: None,
            },
            CommandDescriptor {
                name: "set_prompt",
                method: "PUT",
                path: "/users/{user_id}/prompt",
                description: "Set a custom summarization instruction. Use {text} to place the document text; otherwise it is appended.",
                request_example: Some(json!({
                    "instruction": "Summarize in five bullet points, focusing on numbers."
                })),
            },
            CommandDescriptor {
                name: "reset_prompt",
                method: "DELETE",
                path: "/users/{user_id}/prompt",
                description: "Return to the default instruction.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return request and chunk counters useful for observability dashboards.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    EmptyUpload,
    Upload(BlobError),
    InvalidPrompt(InvalidPromptError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::EmptyUpload => (StatusCode::BAD_REQUEST, "request body is empty".to_string()),
            Self::Upload(error @ BlobError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, error.to_string())
            }
            Self::Upload(error @ BlobError::NotFound(_)) => (StatusCode::NOT_FOUND, error.to_string()),
            Self::Upload(error @ BlobError::Io(_)) => {
                tracing::error!(error = %error, "Failed to store upload");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to store upload".to_string(),
                )
            }
            Self::InvalidPrompt(error) => (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BlobError> for AppError {
    fn from(inner: BlobError) -> Self {
        Self::Upload(inner)
    }
}

impl From<InvalidPromptError> for AppError {
    fn from(inner: InvalidPromptError) -> Self {
        Self::InvalidPrompt(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::blob::{BlobSource, FsBlobSource, MemoryBlobSource};
    use crate::processing::testing::{PlainTextExtractor, ScriptedService};
    use crate::processing::{
        Chunker, Collaborators, Orchestrator, OrchestratorSettings, PromptStore, ReductionPolicy,
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(max_document_bytes: u64) -> (Router, Arc<Orchestrator>, Arc<MemoryBlobSource>) {
        let blobs = Arc::new(MemoryBlobSource::new(max_document_bytes));
        let (router, orchestrator) = app_with(blobs.clone(), max_document_bytes);
        (router, orchestrator, blobs)
    }

    fn app_with(
        blobs: Arc<dyn BlobSource>,
        max_document_bytes: u64,
    ) -> (Router, Arc<Orchestrator>) {
        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                blobs,
                extractor: Arc::new(PlainTextExtractor),
                service: Arc::new(ScriptedService::new()),
            },
            Arc::new(PromptStore::new("Default: {text}")),
            Chunker::by_chars(1000, 0, 100).expect("chunker"),
            ReductionPolicy {
                max_retries: 1,
                retry_base_delay: Duration::ZERO,
                partial_failure_ratio: 0.2,
                max_concurrency: 2,
                call_timeout: Duration::from_secs(5),
            },
            OrchestratorSettings {
                call_timeout: Duration::from_secs(5),
                max_document_bytes,
            },
        ));
        (create_router(orchestrator.clone()), orchestrator)
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn json_request(method: Method, uri: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn commands_catalog_exposes_summarize_endpoint() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let summarize = commands
            .iter()
            .find(|cmd| cmd.name == "summarize")
            .expect("summarize command present");

        assert_eq!(summarize.method, "POST");
        assert!(summarize.path.starts_with("/summaries"));
        assert!(commands.len() >= 4);
    }

    #[tokio::test]
    async fn summary_stream_reports_progress_and_completion() {
        let (app, orchestrator, blobs) = app(1024 * 1024);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/summaries?user_id=alice&file_name=notes.pdf")
                    .body(Body::from("A tiny document."))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .expect("content type")
                .starts_with("text/event-stream")
        );
        let body = body_text(response).await;
        assert!(body.contains("event: starting"));
        assert!(body.contains("event: summarizing"));
        assert!(body.contains("event: completed"));
        assert!(!body.contains("event: combining"));
        assert!(body.contains("summary of A tiny document."));
        assert!(blobs.is_empty());
        assert_eq!(orchestrator.metrics().snapshot().requests_completed, 1);
    }

    #[tokio::test]
    async fn non_pdf_upload_streams_a_failed_event() {
        let (app, _, _) = app(1024 * 1024);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/summaries?user_id=alice&file_name=notes.docx")
                    .body(Body::from("not a pdf"))
                    .expect("request"),
            )
            .await
            .expect("router response");

        let body = body_text(response).await;
        assert!(body.contains("event: failed"));
        assert!(body.contains("PDF files only"));
        assert!(!body.contains("event: completed"));
    }

    #[tokio::test]
    async fn oversized_upload_fails_before_extraction() {
        let (app, _, blobs) = app(16);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/summaries?user_id=alice&file_name=big.pdf")
                    .body(Body::from("x".repeat(64)))
                    .expect("request"),
            )
            .await
            .expect("router response");

        let body = body_text(response).await;
        assert!(body.contains("event: failed"));
        assert!(body.contains("File too large"));
        assert!(!body.contains("event: extracting"));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_on_disk_streams_a_failed_event() {
        let root = std::env::temp_dir().join(format!("api-test-{}", uuid::Uuid::new_v4()));
        let (app, orchestrator) = app_with(Arc::new(FsBlobSource::new(&root, 16)), 16);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/summaries?user_id=alice&file_name=big.pdf")
                    .body(Body::from("x".repeat(64)))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("event: failed"));
        assert!(body.contains("File too large"));
        assert!(!body.contains("event: extracting"));
        assert_eq!(orchestrator.metrics().snapshot().requests_failed, 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn empty_upload_is_a_bad_request() {
        let (app, _, _) = app(1024);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/summaries?user_id=alice&file_name=a.pdf")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn prompt_lifecycle_over_http() {
        let (app, _, _) = app(1024 * 1024);

        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/users/bob/prompt",
                json!({ "instruction": "Bullet points only." }),
            ))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(json["custom"], true);
        assert!(json["updated_at"].is_string());

        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/users/bob/prompt",
                json!({ "instruction": "   " }),
            ))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/users/bob/prompt")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        let json: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(json["instruction"], "Bullet points only.");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/users/bob/prompt")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        let json: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(json["reset"], true);
        assert_eq!(json["instruction"], "Default: {text}");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_counters() {
        let (app, _, _) = app(1024 * 1024);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(json["requests_completed"], 0);
        assert_eq!(json["chunk_failures"], 0);
    }
}
