use std::sync::Arc;

use axum::{
    extract::{Query, State as StateExtractor},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::query::ArticleViewQuery;
use super::state::State;
use super::transport::Transport;

#[derive(Deserialize)]
pub struct ViewsParams {
    article: Option<String>,
    year: Option<String>,
    month: Option<String>,
}

#[derive(Serialize)]
struct ViewsResponse {
    views: u64,
}

pub async fn health_check_handler() -> Response {
    StatusCode::OK.into_response()
}

pub async fn article_views_handler<T: Transport>(
    StateExtractor(state): StateExtractor<Arc<State<T>>>,
    Query(params): Query<ViewsParams>,
) -> Response {
    let query = match parse_query(params) {
        Ok(query) => query,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    match state.fetcher.fetch(&query, &state.request_token()).await {
        Ok(views) => (StatusCode::OK, Json(ViewsResponse { views })).into_response(),
        Err(e) => {
            tracing::error!(
                "failed to fetch views for {}, reason: {}",
                query.article(),
                e
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error fetching article views: {}", e),
            )
                .into_response()
        }
    }
}

fn parse_query(params: ViewsParams) -> Result<ArticleViewQuery, String> {
    let year = params
        .year
        .as_deref()
        .and_then(|year| year.trim().parse::<i32>().ok())
        .ok_or("Invalid year parameter")?;
    let month = params
        .month
        .as_deref()
        .and_then(|month| month.trim().parse::<u32>().ok())
        .ok_or("Invalid month parameter")?;

    ArticleViewQuery::new(params.article.unwrap_or_default(), year, month)
        .map_err(|e| e.to_string())
}
