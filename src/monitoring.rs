// src/monitoring.rs
use actix_web::{HttpResponse, web};
use serde::Serialize;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use std::time::Instant;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::time::{interval, Duration};

use crate::audit;
use crate::prediction::ServiceHealth;
use crate::session::SessionHub;
use crate::AppState;

const RESPONSE_TIME_WINDOW: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    pub request_count: AtomicU64,
    pub error_count: AtomicU64,
    pub response_times: std::sync::Mutex<Vec<u64>>,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            response_times: std::sync::Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }
    }

    pub fn increment_requests(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, time_ms: u64) {
        if let Ok(mut times) = self.response_times.lock() {
            times.push(time_ms);
            if times.len() > RESPONSE_TIME_WINDOW {
                times.remove(0);
            }
        }
    }

    pub fn average_response_time(&self) -> f64 {
        match self.response_times.lock() {
            Ok(times) if !times.is_empty() => times.iter().sum::<u64>() as f64 / times.len() as f64,
            _ => 0.0,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub app: &'static str,
    pub prediction_service: ServiceHealth,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub requests_total: u64,
    pub errors_total: u64,
    pub avg_response_time_ms: f64,
    pub database_connections: u32,
    pub active_sessions: usize,
    pub change_subscribers: usize,
}

/// App status plus a health check of the prediction service.
pub async fn health_check(
    app_state: web::Data<Arc<AppState>>,
    metrics: web::Data<Arc<Metrics>>,
) -> HttpResponse {
    let response = HealthResponse {
        app: "healthy",
        prediction_service: app_state.prediction.health().await,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: metrics.uptime_seconds(),
    };

    HttpResponse::Ok().json(response)
}

pub async fn readiness_check(app_state: web::Data<Arc<AppState>>) -> HttpResponse {
    match sqlx::query("SELECT 1").fetch_one(&app_state.db_pool).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        })),
        Err(e) => {
            log::warn!("Readiness check failed: {}", e);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "not ready",
                "database": "disconnected"
            }))
        }
    }
}

pub async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "alive",
        "timestamp": Utc::now()
    }))
}

pub async fn metrics_endpoint(
    app_state: web::Data<Arc<AppState>>,
    metrics: web::Data<Arc<Metrics>>,
) -> HttpResponse {
    let response = MetricsResponse {
        requests_total: metrics.request_count.load(Ordering::Relaxed),
        errors_total: metrics.error_count.load(Ordering::Relaxed),
        avg_response_time_ms: metrics.average_response_time(),
        database_connections: app_state.db_pool.size(),
        active_sessions: app_state.sessions.active_sessions().await,
        change_subscribers: app_state.change_feed.subscriber_count(),
    };

    HttpResponse::Ok().json(response)
}

// ==================== REQUEST LOGGER ====================

pub struct RequestLogger {
    metrics: Arc<Metrics>,
}

impl RequestLogger {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S, B> actix_web::dev::Transform<S, actix_web::dev::ServiceRequest> for RequestLogger
where
    S: actix_web::dev::Service<
        actix_web::dev::ServiceRequest,
        Response = actix_web::dev::ServiceResponse<B>,
        Error = actix_web::Error,
    >,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = RequestLoggerMiddleware<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RequestLoggerMiddleware {
            service,
            metrics: self.metrics.clone(),
        }))
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: S,
    metrics: Arc<Metrics>,
}

impl<S, B> actix_web::dev::Service<actix_web::dev::ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: actix_web::dev::Service<
        actix_web::dev::ServiceRequest,
        Response = actix_web::dev::ServiceResponse<B>,
        Error = actix_web::Error,
    >,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, ctx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: actix_web::dev::ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let metrics = self.metrics.clone();
        let method = req.method().clone();
        let path = req.path().to_string();
        let fut = self.service.call(req);

        Box::pin(async move {
            metrics.increment_requests();
            let res = fut.await;
            let elapsed = start_time.elapsed().as_millis() as u64;
            metrics.record_response_time(elapsed);

            match res {
                Ok(ref response) => {
                    let status = response.status();
                    if status.is_client_error() || status.is_server_error() {
                        metrics.increment_errors();
                    }
                    if status.is_server_error() {
                        log::warn!("{} {} -> {} ({} ms)", method, path, status.as_u16(), elapsed);
                    } else {
                        log::debug!("{} {} -> {} ({} ms)", method, path, status.as_u16(), elapsed);
                    }
                }
                Err(_) => metrics.increment_errors(),
            }
            res
        })
    }
}

// ==================== MAINTENANCE ====================

pub async fn start_maintenance_tasks(pool: SqlitePool, sessions: Arc<SessionHub>) {
    tokio::spawn(async move {
        cleanup_old_audit_logs(pool).await;
    });

    tokio::spawn(async move {
        purge_expired_sessions(sessions).await;
    });
}

async fn cleanup_old_audit_logs(pool: SqlitePool) {
    let mut interval = interval(Duration::from_secs(24 * 3600));

    loop {
        interval.tick().await;
        log::info!("Starting daily cleanup of audit logs...");

        match audit::prune_before(&pool, audit::retention_cutoff()).await {
            Ok(0) => {}
            Ok(deleted) => log::info!("Cleaned up {} old audit log entries", deleted),
            Err(e) => log::error!("Failed to cleanup audit logs: {}", e),
        }
    }
}

async fn purge_expired_sessions(sessions: Arc<SessionHub>) {
    let mut interval = interval(Duration::from_secs(3600));

    loop {
        interval.tick().await;
        match sessions.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => log::info!("Purged {} expired session entries", purged),
            Err(e) => log::error!("Failed to purge expired sessions: {}", e),
        }
    }
}
