// src/geocoding.rs - Reverse geocoding for the location field
use actix_web::{web, HttpResponse};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use validator::Validate;

use crate::config::GeocodingConfig;
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiResponse;
use crate::AppState;

pub const LOCATION_NOT_FOUND: &str = "Location not found";

#[derive(Debug, Error)]
pub enum GeocodingError {
    #[error("Failed to get location details")]
    Request(#[from] reqwest::Error),

    #[error("Failed to get location details")]
    Status(u16),

    #[error("Invalid geocoding URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

pub struct GeocodingClient {
    http_client: Client,
    base_url: Url,
}

impl GeocodingClient {
    pub fn new(config: &GeocodingConfig) -> Result<Self, GeocodingError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http_client, base_url })
    }

    /// Human-readable address for a coordinate pair.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<String, GeocodingError> {
        let mut url = self.base_url.join("reverse")?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("lat", &lat.to_string())
            .append_pair("lon", &lon.to_string());

        let response = self.http_client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GeocodingError::Status(response.status().as_u16()));
        }

        let body: ReverseResponse = response.json().await?;
        Ok(body
            .display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| LOCATION_NOT_FOUND.to_string()))
    }
}

// ==================== HANDLER ====================

#[derive(Debug, Deserialize, Validate)]
pub struct ReverseQuery {
    #[validate(range(min = -90.0, max = 90.0, message = "Latitude must be between -90 and 90"))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0, message = "Longitude must be between -180 and 180"))]
    pub lon: f64,
}

#[derive(Debug, Serialize)]
pub struct ReverseGeocodeResponse {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
}

pub async fn reverse_geocode(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ReverseQuery>,
) -> ApiResult<HttpResponse> {
    query.validate()?;

    let display_name = app_state
        .geocoding
        .reverse(query.lat, query.lon)
        .await
        .map_err(|e| {
            log::warn!("Reverse geocoding failed for {},{}: {:?}", query.lat, query.lon, e);
            ApiError::ServiceUnavailable(e.to_string())
        })?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(ReverseGeocodeResponse {
        lat: query.lat,
        lon: query.lon,
        display_name,
    })))
}
