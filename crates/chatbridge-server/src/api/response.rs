use axum::{
    Json,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use chatbridge_core::{BridgeError, BridgeReply, ErrorBody};
use futures::StreamExt;
use std::convert::Infallible;

/// Errors are reported in-band with a 200 status.
pub fn error_response(error: &BridgeError) -> Response {
    Json(ErrorBody::new(error.to_string())).into_response()
}

pub fn reply_response(reply: BridgeReply) -> Response {
    match reply {
        BridgeReply::Completion(completion) => Json(completion).into_response(),
        BridgeReply::Stream(payloads) => {
            let events = payloads.map(|data| Ok::<_, Infallible>(Event::default().data(data)));
            Sse::new(events).into_response()
        }
    }
}
