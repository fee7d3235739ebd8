pub mod config;
pub mod fetcher;
pub mod handler;
pub mod limiter;
pub mod query;
pub mod state;
pub mod transport;

use std::sync::Arc;

use axum::{routing::get, Router};

use state::State;
use transport::Transport;

pub fn router<T: Transport>(state: Arc<State<T>>) -> Router {
    Router::new()
        .route("/healthz", get(handler::health_check_handler))
        .route("/getViews", get(handler::article_views_handler::<T>))
        .with_state(state)
}
