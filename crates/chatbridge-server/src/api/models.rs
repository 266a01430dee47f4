use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;

#[derive(Serialize, Debug)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Serialize, Debug)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

// GET /v1/models
pub async fn list_models(State(bridge): State<AppState>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelCard {
            id: bridge.settings().model_name.clone(),
            object: "model",
            created: 0,
            owned_by: "chatbridge",
        }],
    })
}

#[derive(Serialize, Debug)]
pub struct Health {
    pub status: String,
    /// Whether a turn currently holds the browser session.
    pub busy: bool,
}

// GET /health
pub async fn health(State(bridge): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "chatbridge is working!".to_string(),
        busy: bridge.is_busy(),
    })
}
