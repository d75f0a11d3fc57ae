use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::http::state::AppState;

static API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Shared-secret check for mutating endpoints. A no-op when no API key is
/// configured; otherwise every request must carry a matching `X-Api-Key`.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(&API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided != Some(expected) {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(req).await)
}
