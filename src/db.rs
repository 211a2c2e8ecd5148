// src/db.rs - Database migrations and setup

use sqlx::SqlitePool;
use anyhow::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;

    // Create users table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE CHECK(length(email) >= 5 AND length(email) <= 255),
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'farmer' CHECK(
                role IN ('farmer', 'lab_technician', 'admin')
            ),
            is_active INTEGER NOT NULL DEFAULT 1 CHECK(is_active IN (0, 1)),
            last_login DATETIME,
            failed_login_attempts INTEGER NOT NULL DEFAULT 0,
            locked_until DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
        .execute(pool)
        .await?;

    // Profiles share the user id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            full_name TEXT NOT NULL CHECK(length(full_name) <= 255),
            phone TEXT CHECK(phone IS NULL OR length(phone) <= 32),
            location TEXT CHECK(location IS NULL OR length(location) <= 500),
            farm_size TEXT CHECK(farm_size IS NULL OR length(farm_size) <= 100),
            avatar_url TEXT CHECK(avatar_url IS NULL OR length(avatar_url) <= 1000),
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (id) REFERENCES users (id) ON DELETE CASCADE
        )
        "#,
    )
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS soil_tests (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            location TEXT NOT NULL CHECK(length(location) > 0 AND length(location) <= 500),
            field_size REAL CHECK(field_size IS NULL OR field_size > 0),
            test_type TEXT NOT NULL,
            test_date DATETIME NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(
                status IN ('pending', 'sample_collection', 'analyzing', 'completed')
            ),
            ph_level REAL CHECK(ph_level IS NULL OR (ph_level >= 0 AND ph_level <= 14)),
            nitrogen_level REAL CHECK(nitrogen_level IS NULL OR nitrogen_level >= 0),
            phosphorus_level REAL CHECK(phosphorus_level IS NULL OR phosphorus_level >= 0),
            potassium_level REAL CHECK(potassium_level IS NULL OR potassium_level >= 0),
            organic_matter REAL CHECK(organic_matter IS NULL OR (organic_matter >= 0 AND organic_matter <= 100)),
            moisture_content REAL CHECK(moisture_content IS NULL OR (moisture_content >= 0 AND moisture_content <= 100)),
            sample_collection_date DATETIME,
            analysis_started_date DATETIME,
            completed_date DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users (id)
        )
        "#,
    )
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crop_recommendations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            soil_test_id TEXT,
            crop_name TEXT NOT NULL,
            source TEXT NOT NULL CHECK(source IN ('model', 'fallback', 'image')),
            n REAL NOT NULL,
            p REAL NOT NULL,
            k REAL NOT NULL,
            temperature REAL NOT NULL,
            humidity REAL NOT NULL,
            ph REAL NOT NULL,
            rainfall REAL NOT NULL,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users (id),
            FOREIGN KEY (soil_test_id) REFERENCES soil_tests (id)
        )
        "#,
    )
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            description TEXT,
            ip_address TEXT,
            user_agent TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
        .execute(pool)
        .await?;

    // Issued tokens by id; a revoked_at stamp outlives a restart
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS auth_sessions (
            jti TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires_at DATETIME NOT NULL,
            revoked_at DATETIME
        )
        "#,
    )
        .execute(pool)
        .await?;

    // Indexes
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions (user_id)",
        "CREATE INDEX IF NOT EXISTS idx_soil_tests_user_date ON soil_tests (user_id, test_date DESC)",
        "CREATE INDEX IF NOT EXISTS idx_soil_tests_status ON soil_tests (status)",
        "CREATE INDEX IF NOT EXISTS idx_crop_recommendations_user ON crop_recommendations (user_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs (created_at)",
    ];
    for statement in indexes {
        sqlx::query(statement).execute(pool).await?;
    }

    log::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    // In-memory databases are per-connection, so the pool must hold exactly one.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name"
        )
            .fetch_all(&pool)
            .await
            .unwrap();

        for expected in ["audit_logs", "crop_recommendations", "profiles", "soil_tests", "users"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[actix_rt::test]
    async fn test_status_check_constraint() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, created_at, updated_at) \
             VALUES ('u1', 'a@b.co', 'x', 'farmer', datetime('now'), datetime('now'))"
        )
            .execute(&pool)
            .await
            .unwrap();

        let bad = sqlx::query(
            "INSERT INTO soil_tests (id, user_id, location, test_type, test_date, status, created_at, updated_at) \
             VALUES ('t1', 'u1', 'Field A', 'Basic Soil Analysis', datetime('now'), 'shipped', datetime('now'), datetime('now'))"
        )
            .execute(&pool)
            .await;
        assert!(bad.is_err());
    }
}
