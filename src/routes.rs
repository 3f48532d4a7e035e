use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request},
    http::Method,
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::uploads::UploadManager;

mod download;
mod files;
mod upload;

use download::{download_chunk, file_metadata, upload_status};
use files::{delete_all_files, delete_file, list_files_for_delete, list_files_for_download};
use upload::{cancel_upload, upload_chunk};

#[derive(Clone)]
pub struct RouteState {
    pub uploads: Arc<UploadManager>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);
    let body_limit = route_state.uploads.limits().max_chunk_size_bytes;

    Router::new()
        .route("/", get(index))
        .route(
            "/api/upload",
            post(upload_chunk).with_state(route_state.clone()),
        )
        .route(
            "/api/upload",
            get(list_files_for_delete).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/cancel",
            post(cancel_upload).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/delete/{file_name}",
            delete(delete_file).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/deleteAll",
            delete(delete_all_files).with_state(route_state.clone()),
        )
        .route(
            "/api/uploadfiles",
            get(list_files_for_download).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/download/{file_name}/{chunk_index}",
            get(download_chunk).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/metadata/{file_name}",
            get(file_metadata).with_state(route_state.clone()),
        )
        .route(
            "/api/upload/status/{file_name}",
            get(upload_status).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn index() -> &'static str {
    "Chunkstore Server"
}
