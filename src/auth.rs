use bcrypt::{hash, verify};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;
use actix_web::web;
use actix_web::HttpMessage;
use actix_web::{HttpRequest, dev::ServiceRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use crate::config::AuthConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::Profile;
use crate::session::SessionHub;
use crate::validator::normalize_email;

pub use crate::models::UpdateProfileRequest;

pub const SESSION_COOKIE: &str = "agrisense_session";

// ======== USER MODEL ========

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Farmer,
    LabTechnician,
    Admin,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "farmer" => Some(UserRole::Farmer),
            "lab_technician" => Some(UserRole::LabTechnician),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Farmer => "farmer",
            UserRole::LabTechnician => "lab_technician",
            UserRole::Admin => "admin",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            UserRole::Farmer => "Farmer",
            UserRole::LabTechnician => "Lab Technician",
            UserRole::Admin => "Administrator",
        }
    }

    // Soil tests
    pub fn can_view_all_soil_tests(&self) -> bool {
        matches!(self, UserRole::LabTechnician | UserRole::Admin)
    }

    pub fn can_advance_soil_tests(&self) -> bool {
        matches!(self, UserRole::LabTechnician | UserRole::Admin)
    }

    pub fn can_record_results(&self) -> bool {
        matches!(self, UserRole::LabTechnician | UserRole::Admin)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ======== REQUESTS / RESPONSES ========

#[derive(Debug, Clone, Deserialize)]
pub struct SignUpRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub full_name: String,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub farm_size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_in: i64,
    pub user: UserInfo,
    pub profile: Option<Profile>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        let role = user.get_role();
        Self {
            id: user.id,
            email: user.email,
            role,
            is_active: user.is_active,
            last_login: user.last_login,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub email: String,
    pub role: UserRole,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

// ======== AUTH SERVICE ========

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_hours: i64,
    bcrypt_cost: u32,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            expiration_hours: config.token_expiration_hours,
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    pub fn expires_in_seconds(&self) -> i64 {
        self.expiration_hours * 3600
    }

    pub fn hash_password(&self, password: &str) -> ApiResult<String> {
        hash(password, self.bcrypt_cost)
            .map_err(|_| ApiError::InternalServerError("Failed to hash password".to_string()))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> ApiResult<bool> {
        verify(password, hash)
            .map_err(|_| ApiError::InternalServerError("Password verification failed".to_string()))
    }

    pub fn generate_token(&self, user: &User) -> ApiResult<(String, Claims)> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.expiration_hours);

        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.get_role(),
            jti: Uuid::new_v4().to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| ApiError::InternalServerError("Failed to generate token".to_string()))?;
        Ok((token, claims))
    }

    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature =>
                        ApiError::Unauthorized("Session expired. Please sign in again".to_string()),
                    _ =>
                        ApiError::Unauthorized("Invalid session".to_string()),
                }
            })
    }

    /// Verifies a token and rejects it if it has been signed out.
    pub async fn authenticate(&self, token: &str, sessions: &SessionHub) -> ApiResult<Claims> {
        let claims = self.verify_token(token)?;
        if sessions.is_revoked(&claims.jti).await {
            return Err(ApiError::Unauthorized("Session expired. Please sign in again".to_string()));
        }
        Ok(claims)
    }
}

// ======== USER METHODS ========

impl User {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> ApiResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| ApiError::not_found("User"))
    }

    pub async fn find_by_email(pool: &SqlitePool, email: &str) -> ApiResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(normalize_email(email))
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }

    /// Creates the user and its profile in one transaction. The request is
    /// expected to be validated already.
    pub async fn create(
        pool: &SqlitePool,
        request: &SignUpRequest,
        auth_service: &AuthService,
    ) -> ApiResult<(User, Profile)> {
        let email = normalize_email(&request.email);
        if User::find_by_email(pool, &email).await?.is_some() {
            return Err(ApiError::email_taken());
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            password_hash: auth_service.hash_password(&request.password)?,
            role: UserRole::Farmer.as_str().to_string(),
            is_active: true,
            last_login: None,
            failed_login_attempts: 0,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };
        let clean = |value: &Option<String>| {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
        };
        let profile = Profile {
            id: user.id.clone(),
            email,
            full_name: request.full_name.trim().to_string(),
            phone: clean(&request.phone),
            location: clean(&request.location),
            farm_size: clean(&request.farm_size),
            avatar_url: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO users (
                id, email, password_hash, role, is_active,
                failed_login_attempts, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#
        )
            .bind(&user.id)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.role)
            .bind(user.is_active)
            .bind(user.failed_login_attempts)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => ApiError::email_taken(),
                other => ApiError::DatabaseError(other),
            })?;

        sqlx::query(
            r#"INSERT INTO profiles (
                id, email, full_name, phone, location, farm_size, avatar_url, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        )
            .bind(&profile.id)
            .bind(&profile.email)
            .bind(&profile.full_name)
            .bind(&profile.phone)
            .bind(&profile.location)
            .bind(&profile.farm_size)
            .bind(&profile.avatar_url)
            .bind(profile.created_at)
            .bind(profile.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((user, profile))
    }

    pub async fn update_last_login(&self, pool: &SqlitePool) -> ApiResult<()> {
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&self.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn change_password(
        &self,
        pool: &SqlitePool,
        current_password: &str,
        new_password: &str,
        auth_service: &AuthService
    ) -> ApiResult<()> {
        if !auth_service.verify_password(current_password, &self.password_hash)? {
            return Err(ApiError::AuthError("Current password is incorrect".to_string()));
        }

        let new_hash = auth_service.hash_password(new_password)?;

        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(&new_hash)
            .bind(Utc::now())
            .bind(&self.id)
            .execute(pool)
            .await?;

        Ok(())
    }

    // Methods for lock management
    pub fn is_locked(&self) -> bool {
        if let Some(locked_until) = self.locked_until {
            Utc::now() < locked_until
        } else {
            false
        }
    }

    pub async fn increment_failed_attempts(&mut self, pool: &SqlitePool) -> ApiResult<()> {
        self.failed_login_attempts += 1;
        sqlx::query("UPDATE users SET failed_login_attempts = ? WHERE id = ?")
            .bind(self.failed_login_attempts)
            .bind(&self.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn lock_for_duration(&mut self, pool: &SqlitePool, duration: Duration) -> ApiResult<()> {
        self.locked_until = Some(Utc::now() + duration);
        sqlx::query("UPDATE users SET locked_until = ? WHERE id = ?")
            .bind(self.locked_until)
            .bind(&self.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn reset_failed_attempts(&mut self, pool: &SqlitePool) -> ApiResult<()> {
        self.failed_login_attempts = 0;
        self.locked_until = None;
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, locked_until = NULL WHERE id = ?"
        )
            .bind(&self.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub fn get_role(&self) -> UserRole {
        UserRole::from_str(&self.role).unwrap_or(UserRole::Farmer)
    }
}

// ======== HELPER FUNCTIONS ========

pub fn get_current_user(req: &HttpRequest) -> ApiResult<Claims> {
    req.extensions()
        .get::<Claims>().cloned()
        .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))
}

pub fn check_permission<F>(claims: &Claims, check: F) -> ApiResult<()>
where
    F: Fn(&UserRole) -> bool,
{
    if check(&claims.role) {
        Ok(())
    } else {
        Err(ApiError::insufficient_permissions())
    }
}

/// Bearer token from the `Authorization` header, falling back to the session cookie.
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    from_header.or_else(|| req.cookie(SESSION_COOKIE).map(|c| c.value().to_string()))
}

// ======== JWT MIDDLEWARE ========

/// Guards `/api/v1`. The bearer header wins; browsers fall back to the session cookie.
pub async fn jwt_middleware(
    req: ServiceRequest,
    credentials: Option<BearerAuth>,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let token = credentials
        .map(|c| c.token().trim().to_string())
        .filter(|token| !token.is_empty())
        .or_else(|| extract_token(req.request()));
    let token = match token {
        Some(token) => token,
        None => {
            return Err((ApiError::Unauthorized("Authentication required".to_string()).into(), req));
        }
    };

    let auth_service = match req.app_data::<web::Data<Arc<AuthService>>>() {
        Some(svc) => svc.clone(),
        None => {
            log::error!("AuthService not found in app data");
            return Err((
                ApiError::InternalServerError("Auth service not available".to_string()).into(),
                req,
            ));
        }
    };
    let sessions = match req.app_data::<web::Data<Arc<SessionHub>>>() {
        Some(hub) => hub.clone(),
        None => {
            log::error!("SessionHub not found in app data");
            return Err((
                ApiError::InternalServerError("Session hub not available".to_string()).into(),
                req,
            ));
        }
    };

    match auth_service.authenticate(&token, &sessions).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            Ok(req)
        }
        Err(err) => {
            log::warn!("JWT verification failed: {}", err);
            Err((err.into(), req))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn service() -> AuthService {
        AuthService::new(&AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        })
    }

    fn signup(email: &str) -> SignUpRequest {
        SignUpRequest {
            email: email.to_string(),
            password: "harvest2024".to_string(),
            full_name: "Ama Mensah".to_string(),
            phone: Some(" ".to_string()),
            location: Some("Kumasi".to_string()),
            farm_size: None,
        }
    }

    #[test]
    fn test_role_permissions() {
        assert!(!UserRole::Farmer.can_advance_soil_tests());
        assert!(UserRole::LabTechnician.can_record_results());
        assert!(UserRole::Admin.can_view_all_soil_tests());
        assert_eq!(UserRole::from_str("lab_technician"), Some(UserRole::LabTechnician));
        assert_eq!(UserRole::from_str("viewer"), None);
    }

    #[actix_rt::test]
    async fn test_create_user_with_profile() {
        let pool = test_pool().await;
        let auth = service();

        let (user, profile) = User::create(&pool, &signup(" Grower@Farm.io "), &auth).await.unwrap();
        assert_eq!(user.email, "grower@farm.io");
        assert_eq!(user.get_role(), UserRole::Farmer);
        assert_eq!(profile.id, user.id);
        assert_eq!(profile.phone, None);
        assert_eq!(profile.location.as_deref(), Some("Kumasi"));

        let stored = Profile::find_by_id(&pool, &user.id).await.unwrap();
        assert_eq!(stored.full_name, "Ama Mensah");
        assert!(auth.verify_password("harvest2024", &user.password_hash).unwrap());
    }

    #[actix_rt::test]
    async fn test_duplicate_email_is_rejected() {
        let pool = test_pool().await;
        let auth = service();

        User::create(&pool, &signup("grower@farm.io"), &auth).await.unwrap();
        let err = User::create(&pool, &signup("GROWER@farm.io"), &auth).await.unwrap_err();
        assert_eq!(err.user_message(), "An account with this email already exists");
    }

    #[actix_rt::test]
    async fn test_token_round_trip_and_revocation() {
        let pool = test_pool().await;
        let auth = service();
        let hub = SessionHub::new(pool.clone());
        let (user, _) = User::create(&pool, &signup("grower@farm.io"), &auth).await.unwrap();

        let (token, claims) = auth.generate_token(&user).unwrap();
        let verified = auth.authenticate(&token, &hub).await.unwrap();
        assert_eq!(verified.sub, user.id);
        assert_eq!(verified.jti, claims.jti);

        hub.revoke(&claims.jti, &claims.sub, claims.expires_at()).await.unwrap();
        let err = auth.authenticate(&token, &hub).await.unwrap_err();
        assert_eq!(err.user_message(), "Session expired. Please sign in again");

        let err = auth.verify_token("not-a-token").unwrap_err();
        assert_eq!(err.user_message(), "Invalid session");
    }

    #[actix_rt::test]
    async fn test_signed_out_token_stays_rejected_after_restart() {
        let pool = test_pool().await;
        let auth = service();
        let (user, _) = User::create(&pool, &signup("grower@farm.io"), &auth).await.unwrap();
        let (token, claims) = auth.generate_token(&user).unwrap();

        let running = SessionHub::new(pool.clone());
        running.register_session(&claims.jti, &claims.sub, claims.expires_at()).await.unwrap();
        running.revoke(&claims.jti, &claims.sub, claims.expires_at()).await.unwrap();
        drop(running);

        let restarted = SessionHub::new(pool);
        restarted.restore().await.unwrap();
        let err = auth.authenticate(&token, &restarted).await.unwrap_err();
        assert_eq!(err.user_message(), "Session expired. Please sign in again");
    }

    #[actix_rt::test]
    async fn test_lockout_bookkeeping() {
        let pool = test_pool().await;
        let auth = service();
        let (mut user, _) = User::create(&pool, &signup("grower@farm.io"), &auth).await.unwrap();

        user.increment_failed_attempts(&pool).await.unwrap();
        user.lock_for_duration(&pool, Duration::minutes(15)).await.unwrap();
        let stored = User::find_by_id(&pool, &user.id).await.unwrap();
        assert_eq!(stored.failed_login_attempts, 1);
        assert!(stored.is_locked());

        user.reset_failed_attempts(&pool).await.unwrap();
        let stored = User::find_by_id(&pool, &user.id).await.unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(!stored.is_locked());
    }

    #[test]
    fn test_permission_check() {
        let claims = Claims {
            sub: "u1".into(),
            email: "grower@farm.io".into(),
            role: UserRole::Farmer,
            jti: "j".into(),
            exp: 0,
            iat: 0,
        };
        assert!(check_permission(&claims, |r| r.can_advance_soil_tests()).is_err());
        assert!(check_permission(&claims, |_| true).is_ok());
    }
}
