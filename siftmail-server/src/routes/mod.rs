//! HTTP-like task ingress (spec §6.1), nested under `/v1` the way the
//! teacher nests its own API under `/api/v1`.

pub mod v1;

use axum::Router;

use crate::app_state::AppState;

pub fn create_api_router(state: AppState) -> Router<AppState> {
    Router::new().nest("/v1", v1::create_v1_router(state))
}
