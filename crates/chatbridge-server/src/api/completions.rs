use axum::{body::Bytes, extract::State, response::Response};
use chatbridge_core::ChatCompletionRequest;
use tracing::{info, warn};

use crate::api::AppState;
use crate::api::response::{error_response, reply_response};

// POST /v1/chat/completions
//
// The body is parsed by hand so that malformed input gets the in-band
// `{"error": ...}` object rather than axum's rejection status.
pub async fn chat_completions(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request = match ChatCompletionRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            info!("Rejected completion request: {}", err);
            return error_response(&err);
        }
    };

    match bridge.complete(request).await {
        Ok(reply) => reply_response(reply),
        Err(err) => {
            warn!("Completion failed: {}", err);
            error_response(&err)
        }
    }
}
