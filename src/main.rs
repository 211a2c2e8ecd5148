// AgriSense API server: auth, soil tests, crop recommendations and location lookup
use actix_web::{
    middleware::{Compress, DefaultHeaders, Logger},
    web, App, HttpServer,
};
use actix_web_httpauth::middleware::HttpAuthentication;
use actix_web::http::header;
use actix_cors::Cors;
use actix_files::Files;
use anyhow::Context;
use rand::seq::SliceRandom;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sqlx::{migrate::MigrateDatabase, sqlite::{SqliteConnectOptions, SqlitePoolOptions}, Sqlite, SqlitePool};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Module declarations
mod audit;
mod auth;
mod auth_handlers;
mod change_feed;
mod classifier;
mod config;
mod db;
mod error;
mod geocoding;
mod handlers;
mod models;
mod monitoring;
mod pages;
mod prediction;
mod recommendation_handlers;
mod session;
mod soil_handlers;
pub mod validator;
#[cfg(test)]
mod test_support;

use auth::{jwt_middleware, AuthService, SignUpRequest, User, UserRole};
use change_feed::ChangeFeed;
use config::{load_config, Config};
use geocoding::GeocodingClient;
use monitoring::{start_maintenance_tasks, Metrics, RequestLogger};
use prediction::PredictionClient;
use session::{log_auth_events, SessionHub};

pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Config,
    pub auth_service: Arc<AuthService>,
    pub sessions: Arc<SessionHub>,
    pub change_feed: Arc<ChangeFeed>,
    pub prediction: PredictionClient,
    pub geocoding: GeocodingClient,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: Config) -> anyhow::Result<Self> {
        let prediction = PredictionClient::new(&config.prediction)
            .context("Failed to build prediction client")?;
        let geocoding = GeocodingClient::new(&config.geocoding)
            .context("Failed to build geocoding client")?;

        Ok(Self {
            auth_service: Arc::new(AuthService::new(&config.auth)),
            sessions: Arc::new(SessionHub::new(db_pool.clone())),
            change_feed: Arc::new(ChangeFeed::default()),
            prediction,
            geocoding,
            db_pool,
            config,
        })
    }
}

// ==================== MAIN ====================

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (this calls load_env_file internally)
    let config = load_config()?;

    setup_logging(&config)?;

    if config.is_production() {
        validate_production_config(&config)?;
    }
    config.print_startup_info();

    setup_database(&config.database.url).await?;
    let pool = create_database_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let app_state = Arc::new(AppState::new(pool.clone(), config.clone())?);

    create_default_admin_if_needed(&pool, &app_state.auth_service).await?;

    let restored = app_state.sessions.restore().await?;
    log::info!("Restored {} stored session entries", restored);

    // Background tasks
    tokio::spawn(log_auth_events(app_state.sessions.subscribe()));
    start_maintenance_tasks(pool.clone(), app_state.sessions.clone()).await;

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server at http://{}", bind_address);

    let metrics_arc = Arc::new(Metrics::new());
    let workers = config.server.workers;

    let server = HttpServer::new(move || {
        let cors = setup_cors(&config.security.allowed_origins, config.is_production());
        let security_headers = setup_security_headers(&config.security);

        let app = App::new()
            .wrap(cors)
            .wrap(security_headers)
            .wrap(Logger::default())
            .wrap(Compress::default())
            .wrap(RequestLogger::new(metrics_arc.clone()))
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(app_state.auth_service.clone()))
            .app_data(web::Data::new(app_state.sessions.clone()))
            .app_data(web::Data::new(metrics_arc.clone()))
            .app_data(web::JsonConfig::default().limit(config.security.max_request_size))

            // Health check and metrics (no auth)
            .service(
                web::scope("/health")
                    .route("", web::get().to(monitoring::health_check))
                    .route("/live", web::get().to(monitoring::liveness_check))
                    .route("/ready", web::get().to(monitoring::readiness_check))
                    .route("/metrics", web::get().to(monitoring::metrics_endpoint))
            )

            // Auth endpoints (no authentication required)
            .service(
                web::scope("/auth")
                    .route("/signup", web::post().to(auth_handlers::signup))
                    .route("/signin", web::post().to(auth_handlers::signin))
            )

            // Protected API
            .configure(configure_api)

            // Pages
            .route("/", web::get().to(pages::serve_index))
            .route("/home", web::get().to(pages::serve_index))
            .route("/signin", web::get().to(pages::serve_index))
            .route("/signup", web::get().to(pages::serve_index))
            .route("/dashboard", web::get().to(pages::serve_dashboard))
            .route("/dashboard/{tail:.*}", web::get().to(pages::serve_dashboard));

        match config.web.dir {
            Some(ref dir) => app.service(Files::new("/assets", PathBuf::from(dir).join("assets"))),
            None => app,
        }
    });

    let server = match workers {
        Some(workers) => server.workers(workers),
        None => server,
    };

    server
        .bind(&bind_address)?
        .run()
        .await
        .context("Server failed to run")?;

    Ok(())
}

// ==================== HELPER FUNCTIONS ====================

/// Everything under `/api/v1` sits behind the session guard.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .wrap(HttpAuthentication::with_fn(jwt_middleware))
            .service(
                web::scope("/auth")
                    .route("/signout", web::post().to(auth_handlers::signout))
                    .route("/session", web::get().to(auth_handlers::session))
                    .route("/profile", web::put().to(auth_handlers::update_profile))
                    .route("/change-password", web::post().to(auth_handlers::change_password))
            )
            .route("/dashboard", web::get().to(handlers::get_dashboard))

            // Soil tests: fixed segments before /{id}
            .service(
                web::scope("/soil-tests")
                    .route("", web::get().to(soil_handlers::get_soil_tests))
                    .route("", web::post().to(soil_handlers::create_soil_test))
                    .route("/recent", web::get().to(soil_handlers::get_recent_soil_tests))
                    .route("/export", web::get().to(soil_handlers::export_soil_tests))
                    .route("/changes", web::get().to(soil_handlers::soil_test_changes))
                    .route("/{id}", web::get().to(soil_handlers::get_soil_test))
                    .route("/{id}/timeline", web::get().to(soil_handlers::get_soil_test_timeline))
                    .route("/{id}/interpretation", web::get().to(soil_handlers::get_soil_test_interpretation))
                    .route("/{id}/advance", web::post().to(soil_handlers::advance_soil_test))
                    .route("/{id}/results", web::put().to(soil_handlers::record_soil_test_results))
            )

            .route("/treatment-plans", web::post().to(recommendation_handlers::create_treatment_plan))

            .service(
                web::scope("/crop-recommendations")
                    .route("", web::post().to(recommendation_handlers::create_recommendation))
                    .route("", web::get().to(recommendation_handlers::get_recommendations))
                    .route("/upload", web::post().to(recommendation_handlers::upload_soil_report))
                    .route("/service-health", web::get().to(recommendation_handlers::prediction_service_health))
            )

            .route("/location/reverse", web::get().to(geocoding::reverse_geocode))
    );
}

pub fn setup_cors(allowed_origins: &[String], is_production: bool) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
        .expose_headers(vec![header::CONTENT_LENGTH, header::CONTENT_DISPOSITION])
        .supports_credentials()
        .max_age(3600);

    if allowed_origins.iter().any(|o| o == "*") && !is_production {
        log::warn!("Using wildcard CORS (*) in development mode");
        return cors.allow_any_origin().allow_any_header().allow_any_method();
    }

    for origin in allowed_origins.iter().filter(|o| !o.is_empty() && o.as_str() != "*") {
        cors = cors.allowed_origin(origin);
    }
    cors
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}

fn validate_production_config(config: &Config) -> anyhow::Result<()> {
    if config.security.allowed_origins.iter().any(|o| o == "*") {
        anyhow::bail!("Wildcard CORS origins not allowed in production!");
    }
    if env::var("JWT_SECRET").is_err() {
        anyhow::bail!("JWT_SECRET must be set explicitly in production");
    }
    Ok(())
}

async fn setup_database(database_url: &str) -> anyhow::Result<()> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        log::info!("Creating database: {}", database_url);
        Sqlite::create_database(database_url).await?;
    }
    Ok(())
}

async fn create_database_pool(db_config: &config::DatabaseConfig) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_config.url.trim_start_matches("sqlite:"))
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn setup_security_headers(config: &config::SecurityConfig) -> DefaultHeaders {
    let mut headers = DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "strict-origin-when-cross-origin"));

    if config.require_https {
        headers = headers.add((
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains"
        ));
    }

    headers
}

/// Random password that satisfies the sign-up rules (letters and digits).
fn generate_admin_password() -> String {
    let mut rng = thread_rng();
    let mut chars: Vec<char> = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(14)
        .map(char::from)
        .collect();
    chars.push(rng.gen_range(b'a'..=b'z') as char);
    chars.push(rng.gen_range(b'0'..=b'9') as char);
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

/// Seeds one administrator so soil tests can be advanced on a fresh install.
async fn create_default_admin_if_needed(pool: &SqlitePool, auth_service: &AuthService) -> anyhow::Result<()> {
    let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = ?")
        .bind(UserRole::Admin.as_str())
        .fetch_one(pool)
        .await?;
    if admins > 0 {
        return Ok(());
    }

    let email = env::var("DEFAULT_ADMIN_EMAIL").unwrap_or_else(|_| "admin@agrisense.local".to_string());
    let (password, generated) = match env::var("DEFAULT_ADMIN_PASSWORD") {
        Ok(password) => (password, false),
        Err(_) => (generate_admin_password(), true),
    };

    let request = SignUpRequest {
        email,
        password: password.clone(),
        full_name: "Administrator".to_string(),
        phone: None,
        location: None,
        farm_size: None,
    };
    let (user, _) = User::create(pool, &request, auth_service)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create default admin user: {}", e))?;

    sqlx::query("UPDATE users SET role = ? WHERE id = ?")
        .bind(UserRole::Admin.as_str())
        .bind(&user.id)
        .execute(pool)
        .await?;

    log::warn!("Default admin user created: {}", user.email);
    if generated {
        log::warn!("  Password: {} (generated, change it after first sign in)", password);
    }
    Ok(())
}
