// src/recommendation_handlers.rs
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use validator::Validate;

use crate::audit::audit;
use crate::auth::get_current_user;
use crate::classifier::{treatment_plan, TreatmentPlanRequest};
use crate::error::{ApiError, ApiResult};
use crate::handlers::{ApiResponse, PaginatedResponse};
use crate::models::{
    CreateRecommendationRequest, CropRecommendation, FeatureVector, RecommendationQuery,
    RecommendationSource,
};
use crate::prediction::{fallback_crop, is_supported_image, PredictionError, UploadOutcome, UNABLE_TO_PREDICT};
use crate::soil_handlers::load_accessible;
use crate::AppState;

pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct RecommendationResponse {
    pub recommended_crop: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RecommendationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<CropRecommendation>,
}

impl RecommendationResponse {
    fn unavailable(error: &PredictionError) -> Self {
        Self {
            recommended_crop: UNABLE_TO_PREDICT.to_string(),
            source: None,
            error: Some(error.to_string()),
            recommendation: None,
        }
    }
}

fn validate_features(features: &FeatureVector) -> ApiResult<()> {
    if !features.is_finite() {
        return Err(ApiError::ValidationError("All values must be valid numbers".to_string()));
    }
    features.validate()?;
    Ok(())
}

// ==================== FEATURE VECTOR ====================

pub async fn create_recommendation(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateRecommendationRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let request = request.into_inner();
    validate_features(&request.features)?;

    if let Some(ref soil_test_id) = request.soil_test_id {
        load_accessible(&app_state.db_pool, soil_test_id, &claims).await?;
    }

    let (crop, source, warning) = match app_state.prediction.predict(&request.features).await {
        Ok(crop) => (crop, RecommendationSource::Model, None),
        Err(e) if app_state.config.prediction.fallback_enabled => {
            log::warn!("Prediction failed, using fallback rules: {}", e);
            (fallback_crop(&request.features).to_string(), RecommendationSource::Fallback, Some(e.to_string()))
        }
        Err(e) => {
            log::error!("Prediction failed for user {}: {}", claims.sub, e);
            return Ok(HttpResponse::Ok().json(ApiResponse::success(RecommendationResponse::unavailable(&e))));
        }
    };

    let recommendation = CropRecommendation::new(
        &claims.sub,
        request.soil_test_id,
        &crop,
        source,
        &request.features,
    );
    recommendation.insert(&app_state.db_pool).await?;

    audit(
        &app_state.db_pool,
        &claims.sub,
        "recommend",
        "crop_recommendation",
        &recommendation.id,
        &format!("Recommended {}", crop),
        &http_request,
    ).await;

    Ok(HttpResponse::Ok().json(ApiResponse::success(RecommendationResponse {
        recommended_crop: crop,
        source: Some(source),
        error: warning,
        recommendation: Some(recommendation),
    })))
}

// ==================== IMAGE UPLOAD ====================

struct UploadedImage {
    filename: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Exactly one `image` part is accepted; other fields are skipped.
async fn read_image(mut payload: Multipart) -> ApiResult<UploadedImage> {
    let mut image: Option<UploadedImage> = None;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| ApiError::bad_request(&format!("Multipart error: {}", e)))?;

        let content_disposition = field.content_disposition();
        if content_disposition.get_name() != Some("image") {
            // Drain fields we do not use.
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| ApiError::bad_request(&format!("Read error: {}", e)))?;
            }
            continue;
        }
        if image.is_some() {
            return Err(ApiError::bad_request("Only one image can be uploaded"));
        }

        let filename = content_disposition
            .get_filename()
            .unwrap_or_default()
            .to_string();
        if !is_supported_image(&filename) {
            return Err(ApiError::bad_request("Unsupported file format"));
        }
        let content_type = field.content_type().map(|m| m.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::bad_request(&format!("Read error: {}", e)))?;
            bytes.extend_from_slice(&chunk);
            if bytes.len() > MAX_IMAGE_SIZE {
                return Err(ApiError::bad_request("Image exceeds the 10 MB limit"));
            }
        }

        image = Some(UploadedImage { filename, content_type, bytes });
    }

    image.ok_or_else(|| ApiError::bad_request("No image uploaded"))
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub outcome: UploadOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<CropRecommendation>,
}

pub async fn upload_soil_report(
    app_state: web::Data<Arc<AppState>>,
    payload: Multipart,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let image = read_image(payload).await?;
    log::info!("User {} uploaded soil report {} ({} bytes)", claims.sub, image.filename, image.bytes.len());

    let outcome = match app_state
        .prediction
        .upload_form(&image.filename, image.content_type.as_deref(), image.bytes)
        .await
    {
        Ok(outcome) => outcome,
        Err(PredictionError::Rejected(message)) => return Err(ApiError::BadRequest(message)),
        Err(e) => {
            log::error!("Soil report upload failed for user {}: {}", claims.sub, e);
            return Ok(HttpResponse::Ok().json(ApiResponse::success(RecommendationResponse::unavailable(&e))));
        }
    };

    let recommendation = match outcome.form_data {
        Some(ref features) if outcome.error.is_none() && outcome.recommended_crop != UNABLE_TO_PREDICT => {
            let recommendation = CropRecommendation::new(
                &claims.sub,
                None,
                &outcome.recommended_crop,
                RecommendationSource::Image,
                features,
            );
            recommendation.insert(&app_state.db_pool).await?;
            Some(recommendation)
        }
        _ => None,
    };

    Ok(HttpResponse::Ok().json(ApiResponse::success(UploadResponse { outcome, recommendation })))
}

// ==================== HISTORY / HEALTH ====================

pub async fn get_recommendations(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<RecommendationQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    let (page, per_page, offset) = query.normalize();

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crop_recommendations WHERE user_id = ?")
        .bind(&claims.sub)
        .fetch_one(&app_state.db_pool)
        .await?;

    let items = sqlx::query_as::<_, CropRecommendation>(
        "SELECT * FROM crop_recommendations WHERE user_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"
    )
        .bind(&claims.sub)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&app_state.db_pool)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(PaginatedResponse::new(items, total, page, per_page))))
}

pub async fn prediction_service_health(app_state: web::Data<Arc<AppState>>) -> ApiResult<HttpResponse> {
    let health = app_state.prediction.health().await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "prediction_service": health,
        "fallback_enabled": app_state.config.prediction.fallback_enabled,
    }))))
}

// ==================== TREATMENT PLANS ====================

pub async fn create_treatment_plan(request: web::Json<TreatmentPlanRequest>) -> ApiResult<HttpResponse> {
    request.validate()?;
    let plan = treatment_plan(&request);
    Ok(HttpResponse::Ok().json(ApiResponse::success(plan)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::config::Config;
    use crate::test_support::{body_json, create_user, request_as, test_state, test_state_with};
    use actix_web::error::PayloadError;
    use actix_web::http::header::{self, HeaderMap, HeaderValue};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BOUNDARY: &str = "agrisense-upload";

    struct Part<'a> {
        name: &'a str,
        filename: Option<&'a str>,
        bytes: Vec<u8>,
    }

    fn multipart(parts: Vec<Part<'_>>) -> Multipart {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
                ),
            }
            body.extend_from_slice(&part.bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={}", BOUNDARY)).unwrap(),
        );
        let stream = futures_util::stream::once(async move { Ok::<_, PayloadError>(web::Bytes::from(body)) });
        Multipart::new(&headers, stream)
    }

    fn image(filename: &str, bytes: Vec<u8>) -> Part<'_> {
        Part { name: "image", filename: Some(filename), bytes }
    }

    fn request() -> web::Json<CreateRecommendationRequest> {
        web::Json(CreateRecommendationRequest {
            features: FeatureVector {
                n: 90.0, p: 42.0, k: 43.0,
                temperature: 20.8, humidity: 82.0, ph: 6.5, rainfall: 202.9,
            },
            soil_test_id: None,
        })
    }

    fn config_for(server: &MockServer, fallback_enabled: bool) -> Config {
        let mut config = Config::default();
        config.prediction.base_url = server.uri();
        config.prediction.fallback_enabled = fallback_enabled;
        config
    }

    #[actix_rt::test]
    async fn test_model_prediction_is_stored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "crop": "rice" })))
            .mount(&server)
            .await;

        let state = test_state_with(config_for(&server, false)).await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;

        let resp = create_recommendation(web::Data::new(state.clone()), request(), request_as(&farmer))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["recommended_crop"], "rice");
        assert_eq!(body["data"]["source"], "model");

        let latest = CropRecommendation::latest_for_user(&state.db_pool, &farmer.sub).await.unwrap().unwrap();
        assert_eq!(latest.crop_name, "rice");
        assert_eq!(latest.n, 90.0);
    }

    #[actix_rt::test]
    async fn test_failed_prediction_reports_unable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let state = test_state_with(config_for(&server, false)).await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;

        let resp = create_recommendation(web::Data::new(state.clone()), request(), request_as(&farmer))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["recommended_crop"], "Unable to predict crop");
        assert!(body["data"]["error"].as_str().unwrap().starts_with("Prediction service HTTP error"));

        let stored = CropRecommendation::latest_for_user(&state.db_pool, &farmer.sub).await.unwrap();
        assert!(stored.is_none());
    }

    #[actix_rt::test]
    async fn test_fallback_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let state = test_state_with(config_for(&server, true)).await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;

        let resp = create_recommendation(web::Data::new(state.clone()), request(), request_as(&farmer))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["recommended_crop"], "wheat");
        assert_eq!(body["data"]["source"], "fallback");
    }

    #[actix_rt::test]
    async fn test_invalid_features_never_reach_service() {
        let state = test_state().await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;

        let mut bad = request();
        bad.features.humidity = 140.0;
        let err = create_recommendation(web::Data::new(state.clone()), bad, request_as(&farmer))
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "humidity must be between 0 and 100");
    }

    #[actix_rt::test]
    async fn test_upload_stores_image_recommendation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload-form"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "form_data": {
                    "N": 90, "P": 42, "K": 43,
                    "temperature": 20.8, "humidity": 82.0, "ph": 6.5, "rainfall": 202.9
                },
                "recommended_crop": "rice"
            })))
            .mount(&server)
            .await;

        let state = test_state_with(config_for(&server, false)).await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;
        let payload = multipart(vec![
            Part { name: "note", filename: None, bytes: b"north field".to_vec() },
            image("report.PNG", vec![0x89, 0x50, 0x4e, 0x47]),
        ]);

        let resp = upload_soil_report(web::Data::new(state.clone()), payload, request_as(&farmer))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["recommended_crop"], "rice");
        assert_eq!(body["data"]["form_data"]["N"], 90.0);
        assert_eq!(body["data"]["recommendation"]["source"], "image");

        let latest = CropRecommendation::latest_for_user(&state.db_pool, &farmer.sub).await.unwrap().unwrap();
        assert_eq!(latest.source, RecommendationSource::Image);
        assert_eq!(latest.crop_name, "rice");
    }

    async fn upload_error(parts: Vec<Part<'_>>) -> String {
        let state = test_state().await;
        let farmer = create_user(&state, "farmer@farm.io", UserRole::Farmer).await;
        let err = upload_soil_report(web::Data::new(state.clone()), multipart(parts), request_as(&farmer))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let stored = CropRecommendation::latest_for_user(&state.db_pool, &farmer.sub).await.unwrap();
        assert!(stored.is_none());
        err.user_message()
    }

    #[actix_rt::test]
    async fn test_upload_rejects_unsupported_format() {
        let message = upload_error(vec![image("report.pdf", b"%PDF-1.4".to_vec())]).await;
        assert_eq!(message, "Unsupported file format");
    }

    #[actix_rt::test]
    async fn test_upload_requires_image_field() {
        let message = upload_error(vec![Part { name: "note", filename: None, bytes: b"no photo".to_vec() }]).await;
        assert_eq!(message, "No image uploaded");
    }

    #[actix_rt::test]
    async fn test_upload_rejects_oversized_image() {
        let message = upload_error(vec![image("report.jpg", vec![0u8; MAX_IMAGE_SIZE + 1])]).await;
        assert_eq!(message, "Image exceeds the 10 MB limit");
    }

    #[actix_rt::test]
    async fn test_upload_rejects_second_image() {
        let message = upload_error(vec![
            image("first.jpg", vec![1, 2, 3]),
            image("second.jpg", vec![4, 5, 6]),
        ])
        .await;
        assert_eq!(message, "Only one image can be uploaded");
    }

    #[actix_rt::test]
    async fn test_treatment_plan_endpoint() {
        let resp = create_treatment_plan(web::Json(TreatmentPlanRequest {
            crop: "Rice".into(),
            nitrogen: 30.0,
            phosphorus: 25.0,
            potassium: 25.0,
            ph: 6.0,
            moisture: 75.0,
            organic_matter: 4.0,
        }))
        .await
        .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["suitable"], true);
        assert_eq!(body["data"]["tips"]["irrigation"], "Maintain flooded conditions during most growth stages");
    }
}
