pub mod handlers;
pub mod middleware;
pub mod state;
pub mod stream;
pub mod websocket;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the worker's router. Mutating and streaming endpoints sit behind
/// the shared-secret check; liveness, probing, status polling, segment
/// serving, and the progress WebSocket do not require it, mirroring the
/// original worker's split between operational and job-control surfaces.
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/transcode", post(handlers::transcode))
        .route("/transcode/raw", post(handlers::transcode_raw))
        .route("/transcode/stream", post(stream::transcode_stream))
        .route("/job/{job_id}", delete(handlers::cancel_job))
        .route("/beam/stream/{job_id}", post(stream::beam_stream))
        .route("/beam/upload/{job_id}", put(stream::beam_upload))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/probe", get(handlers::probe))
        .route("/status/{job_id}", get(handlers::status))
        .route("/jobs", get(handlers::list_jobs))
        .route("/ws/progress/{job_id}", get(websocket::progress_ws))
        .route("/beam/segments/{job_id}", get(stream::list_segments))
        .route(
            "/beam/segment/{job_id}/{filename}",
            get(stream::serve_segment),
        )
        .route("/segments/{job_id}/{filename}", get(stream::serve_segment))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
