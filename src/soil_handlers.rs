// src/soil_handlers.rs
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::audit::audit;
use crate::auth::{check_permission, get_current_user, Claims};
use crate::change_feed::{ChangeEvent, ChangeKind};
use crate::classifier::{interpret, StatusPresentation};
use crate::error::{ApiError, ApiResult};
use crate::handlers::{ApiResponse, PaginatedResponse};
use crate::models::{
    AdvanceStatusRequest, CreateSoilTestRequest, NewSoilTest, RecentQuery, RecordResultsRequest,
    SoilTest, SoilTestQuery, SoilTestStats, SoilTestStatus, TimelineStep,
};
use crate::AppState;

// ==================== QUERIES ====================

pub async fn fetch_recent(pool: &SqlitePool, user_id: &str, limit: i64) -> ApiResult<Vec<SoilTest>> {
    let tests = sqlx::query_as::<_, SoilTest>(
        "SELECT * FROM soil_tests WHERE user_id = ? ORDER BY test_date DESC, created_at DESC LIMIT ?"
    )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(tests)
}

pub async fn fetch_stats(pool: &SqlitePool, user_id: &str) -> ApiResult<SoilTestStats> {
    let stats = sqlx::query_as::<_, SoilTestStats>(
        r#"SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
            COALESCE(SUM(CASE WHEN status = 'sample_collection' THEN 1 ELSE 0 END), 0) AS sample_collection,
            COALESCE(SUM(CASE WHEN status = 'analyzing' THEN 1 ELSE 0 END), 0) AS analyzing,
            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed
           FROM soil_tests WHERE user_id = ?"#
    )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(stats)
}

/// Loads a test the caller may see. Other farmers' tests look missing.
pub async fn load_accessible(pool: &SqlitePool, id: &str, claims: &Claims) -> ApiResult<SoilTest> {
    let test = sqlx::query_as::<_, SoilTest>("SELECT * FROM soil_tests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::soil_test_not_found(id))?;

    if test.user_id == claims.sub || claims.role.can_view_all_soil_tests() {
        Ok(test)
    } else {
        Err(ApiError::soil_test_not_found(id))
    }
}

pub async fn insert_soil_test(pool: &SqlitePool, user_id: &str, new_test: NewSoilTest) -> ApiResult<SoilTest> {
    let now = Utc::now();
    let test = SoilTest {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        location: new_test.location,
        field_size: new_test.field_size,
        test_type: new_test.test_type.to_string(),
        test_date: new_test.test_date,
        status: SoilTestStatus::Pending,
        ph_level: None,
        nitrogen_level: None,
        phosphorus_level: None,
        potassium_level: None,
        organic_matter: None,
        moisture_content: None,
        sample_collection_date: None,
        analysis_started_date: None,
        completed_date: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"INSERT INTO soil_tests (
            id, user_id, location, field_size, test_type, test_date, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#
    )
        .bind(&test.id)
        .bind(&test.user_id)
        .bind(&test.location)
        .bind(test.field_size)
        .bind(&test.test_type)
        .bind(test.test_date)
        .bind(test.status)
        .bind(test.created_at)
        .bind(test.updated_at)
        .execute(pool)
        .await?;

    Ok(test)
}

/// Moves `test` one stage forward, stamping the stage date if it is empty.
pub async fn advance_status(
    pool: &SqlitePool,
    test: &SoilTest,
    requested: Option<SoilTestStatus>,
) -> ApiResult<SoilTest> {
    let current = test.status;
    let target = match (requested, current.next()) {
        (Some(target), _) => target,
        (None, Some(next)) => next,
        (None, None) => {
            return Err(ApiError::BadRequest("Soil test is already completed".to_string()));
        }
    };
    if !current.can_transition_to(target) {
        return Err(ApiError::invalid_transition(current.as_ref(), target.as_ref()));
    }

    let now = Utc::now();
    let date_column = target
        .date_column()
        .ok_or_else(|| ApiError::invalid_transition(current.as_ref(), target.as_ref()))?;

    // Column names come from a fixed set, never from input.
    let sql = format!(
        "UPDATE soil_tests SET status = ?, {col} = COALESCE({col}, ?), updated_at = ? WHERE id = ? AND status = ?",
        col = date_column
    );
    let result = sqlx::query(&sql)
        .bind(target)
        .bind(now)
        .bind(now)
        .bind(&test.id)
        .bind(current)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::Conflict(
            "Soil test was updated by someone else. Please refresh and try again".to_string(),
        ));
    }

    let updated = sqlx::query_as::<_, SoilTest>("SELECT * FROM soil_tests WHERE id = ?")
        .bind(&test.id)
        .fetch_one(pool)
        .await?;
    Ok(updated)
}

pub async fn store_results(pool: &SqlitePool, id: &str, results: &RecordResultsRequest) -> ApiResult<SoilTest> {
    sqlx::query(
        r#"UPDATE soil_tests SET
            ph_level = COALESCE(?, ph_level),
            nitrogen_level = COALESCE(?, nitrogen_level),
            phosphorus_level = COALESCE(?, phosphorus_level),
            potassium_level = COALESCE(?, potassium_level),
            organic_matter = COALESCE(?, organic_matter),
            moisture_content = COALESCE(?, moisture_content),
            updated_at = ?
           WHERE id = ?"#
    )
        .bind(results.ph_level)
        .bind(results.nitrogen_level)
        .bind(results.phosphorus_level)
        .bind(results.potassium_level)
        .bind(results.organic_matter)
        .bind(results.moisture_content)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    let updated = sqlx::query_as::<_, SoilTest>("SELECT * FROM soil_tests WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(updated)
}

// ==================== HANDLERS ====================

pub async fn create_soil_test(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateSoilTestRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let new_test = request
        .validate_at(Utc::now().date_naive())
        .map_err(ApiError::ValidationError)?;

    let test = insert_soil_test(&app_state.db_pool, &claims.sub, new_test).await?;
    app_state.change_feed.publish(ChangeEvent::for_soil_test(ChangeKind::Insert, &test));

    audit(
        &app_state.db_pool,
        &claims.sub,
        "create",
        "soil_test",
        &test.id,
        &format!("Scheduled {} at {}", test.test_type, test.location),
        &http_request,
    ).await;
    log::info!("User {} scheduled soil test {}", claims.sub, test.id);

    Ok(HttpResponse::Created().json(ApiResponse::success_with_message(
        test,
        "Soil test scheduled successfully".to_string(),
    )))
}

pub async fn get_soil_tests(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<SoilTestQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let (page, per_page, offset) = query.normalize();

    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(
            SoilTestStatus::from_str(value)
                .map_err(|_| ApiError::BadRequest(format!("Unknown status '{}'", value)))?,
        ),
    };

    let (total, tests) = match status {
        Some(status) => {
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM soil_tests WHERE user_id = ? AND status = ?"
            )
                .bind(&claims.sub)
                .bind(status)
                .fetch_one(&app_state.db_pool)
                .await?;
            let tests = sqlx::query_as::<_, SoilTest>(
                "SELECT * FROM soil_tests WHERE user_id = ? AND status = ? \
                 ORDER BY test_date DESC, created_at DESC LIMIT ? OFFSET ?"
            )
                .bind(&claims.sub)
                .bind(status)
                .bind(per_page)
                .bind(offset)
                .fetch_all(&app_state.db_pool)
                .await?;
            (total, tests)
        }
        None => {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM soil_tests WHERE user_id = ?")
                .bind(&claims.sub)
                .fetch_one(&app_state.db_pool)
                .await?;
            let tests = sqlx::query_as::<_, SoilTest>(
                "SELECT * FROM soil_tests WHERE user_id = ? \
                 ORDER BY test_date DESC, created_at DESC LIMIT ? OFFSET ?"
            )
                .bind(&claims.sub)
                .bind(per_page)
                .bind(offset)
                .fetch_all(&app_state.db_pool)
                .await?;
            (total, tests)
        }
    };

    Ok(HttpResponse::Ok().json(ApiResponse::success(PaginatedResponse::new(tests, total, page, per_page))))
}

pub async fn get_recent_soil_tests(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<RecentQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let tests = fetch_recent(&app_state.db_pool, &claims.sub, query.limit()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(tests)))
}

pub async fn get_soil_test(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let test = load_accessible(&app_state.db_pool, &path.into_inner(), &claims).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(test)))
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub soil_test_id: String,
    pub status: StatusPresentation,
    pub steps: Vec<TimelineStep>,
}

pub async fn get_soil_test_timeline(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let test = load_accessible(&app_state.db_pool, &path.into_inner(), &claims).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(TimelineResponse {
        soil_test_id: test.id.clone(),
        status: test.status.into(),
        steps: test.timeline(),
    })))
}

pub async fn get_soil_test_interpretation(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let test = load_accessible(&app_state.db_pool, &path.into_inner(), &claims).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(interpret(&test))))
}

pub async fn advance_soil_test(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: Option<web::Json<AdvanceStatusRequest>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    check_permission(&claims, |role| role.can_advance_soil_tests())?;

    let test = load_accessible(&app_state.db_pool, &path.into_inner(), &claims).await?;
    let requested = request.and_then(|body| body.into_inner().status);
    let updated = advance_status(&app_state.db_pool, &test, requested).await?;

    app_state.change_feed.publish(ChangeEvent::for_soil_test(ChangeKind::Update, &updated));
    audit(
        &app_state.db_pool,
        &claims.sub,
        "advance",
        "soil_test",
        &updated.id,
        &format!("Status changed from {} to {}", test.status, updated.status),
        &http_request,
    ).await;
    log::info!("User {} moved soil test {} to {}", claims.sub, updated.id, updated.status);

    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        updated.clone(),
        format!("Soil test moved to {}", updated.status.label()),
    )))
}

pub async fn record_soil_test_results(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<RecordResultsRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    check_permission(&claims, |role| role.can_record_results())?;
    request.validate()?;
    if request.is_empty() {
        return Err(ApiError::bad_request("No results provided"));
    }

    let test = load_accessible(&app_state.db_pool, &path.into_inner(), &claims).await?;
    let updated = store_results(&app_state.db_pool, &test.id, &request).await?;

    app_state.change_feed.publish(ChangeEvent::for_soil_test(ChangeKind::Update, &updated));
    audit(
        &app_state.db_pool,
        &claims.sub,
        "record_results",
        "soil_test",
        &updated.id,
        "Recorded lab results",
        &http_request,
    ).await;

    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        updated,
        "Results recorded".to_string(),
    )))
}

fn optional_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub async fn export_soil_tests(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let tests = sqlx::query_as::<_, SoilTest>(
        "SELECT * FROM soil_tests WHERE user_id = ? ORDER BY test_date DESC"
    )
        .bind(&claims.sub)
        .fetch_all(&app_state.db_pool)
        .await?;

    let mut csv_data = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut csv_data);

        writer.write_record(&[
            "Location", "Field Size", "Test Type", "Test Date", "Status",
            "pH", "Nitrogen", "Phosphorus", "Potassium", "Organic Matter", "Moisture",
        ]).map_err(|e| ApiError::InternalServerError(e.to_string()))?;

        for test in tests {
            writer.write_record(&[
                test.location,
                optional_number(test.field_size),
                test.test_type,
                test.test_date.format("%Y-%m-%d").to_string(),
                test.status.label().to_string(),
                optional_number(test.ph_level),
                optional_number(test.nitrogen_level),
                optional_number(test.phosphorus_level),
                optional_number(test.potassium_level),
                optional_number(test.organic_matter),
                optional_number(test.moisture_content),
            ]).map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        }

        writer.flush().map_err(|e| ApiError::InternalServerError(e.to_string()))?;
    }

    Ok(HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header(("Content-Disposition", "attachment; filename=\"soil_tests.csv\""))
        .body(csv_data))
}

/// Server-sent events for the caller's soil tests.
pub async fn soil_test_changes(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    log::debug!("User {} subscribed to soil test changes", claims.sub);

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(app_state.change_feed.sse_stream(&claims.sub)))
}
