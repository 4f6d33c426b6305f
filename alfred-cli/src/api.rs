//! HTTP API: anonymous, read-only access to the state document.
//!
//! Every resource projects the store through the fixed `{"public"}` role
//! set, so anonymous callers see exactly what the document's policy grants
//! the `public` role. Anything else is a `404` with a JSON body.

use std::sync::Weak;

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde_json::json;

use alfred_core::{Store, roles};

/// Shared router state. The store is held weakly so requests arriving
/// during shutdown observe it gone and answer `503`.
#[derive(Clone)]
pub struct ApiState {
    store: Weak<Store>,
}

impl ApiState {
    /// Creates the router state from a weak store handle.
    #[must_use]
    pub const fn new(store: Weak<Store>) -> Self {
        Self { store }
    }
}

/// Builds the read-only resource routes. Method mismatches on a known
/// resource answer `405`; unknown resources fall through to the catch-all
/// `404`.
pub fn create_api_routes() -> Router<ApiState> {
    Router::new()
        .route("/data", get(get_data_root))
        .route("/data/{*path}", get(get_data))
        .fallback(unknown_resource)
}

async fn get_data_root(State(state): State<ApiState>) -> Response {
    project(&state, &[])
}

async fn get_data(State(state): State<ApiState>, Path(raw_path): Path<String>) -> Response {
    let keys: Vec<&str> = raw_path.split('/').filter(|key| !key.is_empty()).collect();
    project(&state, &keys)
}

fn project(state: &ApiState, keys: &[&str]) -> Response {
    let Some(store) = state.store.upgrade() else {
        return service_unavailable();
    };
    let view = store.get(keys, &roles::public());
    (
        StatusCode::OK,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(view),
    )
        .into_response()
}

async fn unknown_resource() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": "No such resource defined"})),
    )
        .into_response()
}

/// The answer for any request arriving while the service is tearing down.
pub(crate) fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"message": "The service is shutting down.  Please try again later!"})),
    )
        .into_response()
}
