// src/handlers.rs
use actix_web::{web, HttpResponse, HttpRequest};
use std::sync::Arc;
use serde::Serialize;
use crate::AppState;
use crate::models::{CropRecommendation, Profile, SoilTest, SoilTestStats};
use crate::error::ApiResult;
use crate::auth::{get_current_user, UserRole};
use crate::soil_handlers::{fetch_recent, fetch_stats};

// ==================== COMMON STRUCTURES ====================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn success_with_message(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = if per_page > 0 { (total + per_page - 1) / per_page } else { 0 };
        Self { data, total, page, per_page, total_pages }
    }
}

// ==================== DASHBOARD ====================

#[derive(Debug, Serialize)]
pub struct DashboardUser {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub role_name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub user: DashboardUser,
    pub profile: Option<Profile>,
    pub soil_tests: SoilTestStats,
    pub recent_tests: Vec<SoilTest>,
    pub latest_recommendation: Option<CropRecommendation>,
}

pub async fn get_dashboard(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let pool = &app_state.db_pool;

    let profile = Profile::find_by_id(pool, &claims.sub).await.ok();
    let soil_tests = fetch_stats(pool, &claims.sub).await?;
    let recent_tests = fetch_recent(pool, &claims.sub, 2).await?;
    let latest_recommendation = CropRecommendation::latest_for_user(pool, &claims.sub).await?;

    let summary = DashboardSummary {
        user: DashboardUser {
            id: claims.sub.clone(),
            email: claims.email.clone(),
            role: claims.role,
            role_name: claims.role.display_name(),
        },
        profile,
        soil_tests,
        recent_tests,
        latest_recommendation,
    };

    Ok(HttpResponse::Ok().json(ApiResponse::success(summary)))
}
