// src/pages.rs - Front-end page routes
use actix_files::NamedFile;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::extract_token;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub const SIGN_IN_PAGE: &str = "/signin";

fn index_path(app_state: &AppState) -> Option<PathBuf> {
    app_state
        .config
        .web
        .dir
        .as_ref()
        .map(|dir| PathBuf::from(dir).join("index.html"))
}

/// Public pages (`/`, `/home`, `/signin`, `/signup`) share the single-page app shell.
pub async fn serve_index(app_state: web::Data<Arc<AppState>>) -> ApiResult<NamedFile> {
    let path = index_path(&app_state).ok_or_else(|| ApiError::not_found("Page"))?;
    NamedFile::open(path).map_err(|e| {
        log::warn!("Front-end shell unavailable: {}", e);
        ApiError::not_found("Page")
    })
}

async fn has_valid_session(app_state: &AppState, req: &HttpRequest) -> bool {
    match extract_token(req) {
        Some(token) => app_state
            .auth_service
            .authenticate(&token, &app_state.sessions)
            .await
            .is_ok(),
        None => false,
    }
}

/// The dashboard subtree is only served to signed-in visitors; everyone else
/// is sent to the sign-in page.
pub async fn serve_dashboard(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    if !has_valid_session(&app_state, &http_request).await {
        return Ok(HttpResponse::Found()
            .insert_header((header::LOCATION, SIGN_IN_PAGE))
            .finish());
    }

    let file = serve_index(app_state).await?;
    Ok(file.into_response(&http_request))
}
