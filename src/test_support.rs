// src/test_support.rs - Shared fixtures for handler tests
use actix_web::test::TestRequest;
use actix_web::{HttpMessage, HttpRequest, HttpResponse};
use std::sync::Arc;

use crate::auth::{Claims, SignUpRequest, User, UserRole};
use crate::config::Config;
use crate::db::test_pool;
use crate::AppState;

pub const TEST_PASSWORD: &str = "harvest1";

pub async fn test_state() -> Arc<AppState> {
    test_state_with(Config::default()).await
}

pub async fn test_state_with(mut config: Config) -> Arc<AppState> {
    config.auth.bcrypt_cost = 4;
    let pool = test_pool().await;
    Arc::new(AppState::new(pool, config).expect("app state"))
}

/// Creates an account with `role` and returns the claims of a live session.
pub async fn create_user(state: &AppState, email: &str, role: UserRole) -> Claims {
    let request = SignUpRequest {
        email: email.to_string(),
        password: TEST_PASSWORD.to_string(),
        full_name: "Test Grower".to_string(),
        phone: None,
        location: Some("Test Farm".to_string()),
        farm_size: None,
    };
    let (user, _) = User::create(&state.db_pool, &request, &state.auth_service)
        .await
        .expect("create user");

    sqlx::query("UPDATE users SET role = ? WHERE id = ?")
        .bind(role.as_str())
        .bind(&user.id)
        .execute(&state.db_pool)
        .await
        .expect("set role");

    let user = User::find_by_id(&state.db_pool, &user.id).await.expect("reload user");
    let (_, claims) = state.auth_service.generate_token(&user).expect("token");
    state
        .sessions
        .register_session(&claims.jti, &claims.sub, claims.expires_at())
        .await
        .expect("register session");
    claims
}

/// A request that already passed the bearer middleware as `claims`.
pub fn request_as(claims: &Claims) -> HttpRequest {
    let request = TestRequest::default().to_http_request();
    request.extensions_mut().insert(claims.clone());
    request
}

pub async fn body_json(response: HttpResponse) -> serde_json::Value {
    let bytes = actix_web::body::to_bytes(response.into_body())
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json body")
}
