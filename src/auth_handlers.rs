// src/auth_handlers.rs - Sign up, sign in and account route handlers

use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Duration;
use std::sync::Arc;

use crate::audit::audit;
use crate::auth::{
    get_current_user, ChangePasswordRequest, Claims, SessionResponse, SignInRequest,
    SignUpRequest, UpdateProfileRequest, User, SESSION_COOKIE,
};
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiResponse;
use crate::models::Profile;
use crate::session::AuthEvent;
use crate::validator::CustomValidate;
use crate::AppState;

fn session_cookie(token: &str, max_age_seconds: i64, secure: bool) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, token.to_string())
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(max_age_seconds))
        .finish()
}

fn removal_cookie() -> Cookie<'static> {
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    cookie
}

/// Issues a token for `user`, registers it as a live session and builds the response body.
async fn open_session(
    app_state: &AppState,
    user: User,
    profile: Option<Profile>,
) -> ApiResult<(SessionResponse, Claims)> {
    let (token, claims) = app_state.auth_service.generate_token(&user)?;
    app_state
        .sessions
        .register_session(&claims.jti, &claims.sub, claims.expires_at())
        .await?;

    let response = SessionResponse {
        token,
        expires_in: app_state.auth_service.expires_in_seconds(),
        user: user.into(),
        profile,
    };
    Ok((response, claims))
}

// ======== PUBLIC ENDPOINTS ========

pub async fn signup(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<SignUpRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.custom_validate().into_result()?;

    let (user, profile) = User::create(&app_state.db_pool, &request, &app_state.auth_service).await?;
    log::info!("New account created: {}", user.email);

    audit(
        &app_state.db_pool,
        &user.id,
        "sign_up",
        "user",
        &user.id,
        "Account created",
        &http_request,
    ).await;

    let (response, _) = open_session(&app_state, user, Some(profile)).await?;
    let cookie = session_cookie(&response.token, response.expires_in, app_state.config.security.require_https);

    Ok(HttpResponse::Created()
        .cookie(cookie)
        .json(ApiResponse::success_with_message(response, "Account created successfully".to_string())))
}

pub async fn signin(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<SignInRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.custom_validate().into_result()?;
    let pool = &app_state.db_pool;
    let auth_config = &app_state.config.auth;

    let mut user = User::find_by_email(pool, &request.email)
        .await?
        .ok_or_else(ApiError::invalid_credentials)?;

    if user.is_locked() {
        return Err(ApiError::too_many_attempts());
    }

    if !user.is_active {
        return Err(ApiError::AuthError("This account has been disabled".to_string()));
    }

    if !app_state.auth_service.verify_password(&request.password, &user.password_hash)? {
        user.increment_failed_attempts(pool).await?;

        if user.failed_login_attempts >= auth_config.max_login_attempts {
            user.lock_for_duration(pool, Duration::minutes(auth_config.lockout_duration_minutes)).await?;
            log::warn!("Account {} locked after {} failed sign in attempts", user.email, user.failed_login_attempts);
            return Err(ApiError::too_many_attempts());
        }

        return Err(ApiError::invalid_credentials());
    }

    user.reset_failed_attempts(pool).await?;
    user.update_last_login(pool).await?;

    audit(pool, &user.id, "sign_in", "user", &user.id, "Signed in", &http_request).await;
    log::info!("User {} signed in", user.email);

    let profile = Profile::find_by_id(pool, &user.id).await.ok();
    let user = User::find_by_id(pool, &user.id).await?;
    let (response, _) = open_session(&app_state, user, profile).await?;
    let cookie = session_cookie(&response.token, response.expires_in, app_state.config.security.require_https);

    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .json(ApiResponse::success_with_message(response, "Signed in successfully".to_string())))
}

// ======== PROTECTED ENDPOINTS ========

pub async fn signout(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    app_state.sessions.revoke(&claims.jti, &claims.sub, claims.expires_at()).await?;

    audit(
        &app_state.db_pool,
        &claims.sub,
        "sign_out",
        "user",
        &claims.sub,
        "Signed out",
        &http_request,
    ).await;

    Ok(HttpResponse::Ok()
        .cookie(removal_cookie())
        .json(ApiResponse::success_with_message((), "Signed out".to_string())))
}

pub async fn session(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let user = User::find_by_id(&app_state.db_pool, &claims.sub).await?;
    let profile = Profile::find_by_id(&app_state.db_pool, &claims.sub).await.ok();

    let token = crate::auth::extract_token(&http_request).unwrap_or_default();
    let expires_in = (claims.expires_at() - chrono::Utc::now()).num_seconds().max(0);

    Ok(HttpResponse::Ok().json(ApiResponse::success(SessionResponse {
        token,
        expires_in,
        user: user.into(),
        profile,
    })))
}

pub async fn update_profile(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<UpdateProfileRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    request.custom_validate().into_result()?;

    if request.is_empty() {
        return Err(ApiError::bad_request("No profile fields to update"));
    }

    let profile = Profile::update(&app_state.db_pool, &claims.sub, &request).await?;
    app_state.sessions.publish(AuthEvent::ProfileUpdated { user_id: claims.sub.clone() });

    audit(
        &app_state.db_pool,
        &claims.sub,
        "update",
        "profile",
        &claims.sub,
        "Profile updated",
        &http_request,
    ).await;

    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        profile,
        "Profile updated successfully".to_string(),
    )))
}

pub async fn change_password(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<ChangePasswordRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    request.custom_validate().into_result()?;

    let user = User::find_by_id(&app_state.db_pool, &claims.sub).await?;
    user.change_password(
        &app_state.db_pool,
        &request.current_password,
        &request.new_password,
        &app_state.auth_service,
    ).await?;

    // Every other session of this user ends with the old password.
    let revoked = app_state.sessions.revoke_user(&claims.sub).await?;
    app_state.sessions.publish(AuthEvent::PasswordChanged { user_id: claims.sub.clone() });
    log::info!("User {} changed password, {} session(s) revoked", user.email, revoked);

    audit(
        &app_state.db_pool,
        &claims.sub,
        "change_password",
        "user",
        &claims.sub,
        "Password changed",
        &http_request,
    ).await;

    Ok(HttpResponse::Ok()
        .cookie(removal_cookie())
        .json(ApiResponse::success_with_message((), "Password changed successfully".to_string())))
}
