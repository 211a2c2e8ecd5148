// src/models/recommendation.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiResult;

/// The seven inputs the prediction model was trained on. Serialized with the
/// key names the service expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct FeatureVector {
    #[serde(rename = "N")]
    #[validate(range(min = 0.0, message = "N must be a non-negative number"))]
    pub n: f64,
    #[serde(rename = "P")]
    #[validate(range(min = 0.0, message = "P must be a non-negative number"))]
    pub p: f64,
    #[serde(rename = "K")]
    #[validate(range(min = 0.0, message = "K must be a non-negative number"))]
    pub k: f64,
    #[validate(range(min = -90.0, max = 70.0, message = "temperature must be between -90 and 70"))]
    pub temperature: f64,
    #[validate(range(min = 0.0, max = 100.0, message = "humidity must be between 0 and 100"))]
    pub humidity: f64,
    #[validate(range(min = 0.0, max = 14.0, message = "ph must be between 0 and 14"))]
    pub ph: f64,
    #[validate(range(min = 0.0, message = "rainfall must be a non-negative number"))]
    pub rainfall: f64,
}

impl FeatureVector {
    pub fn is_finite(&self) -> bool {
        [self.n, self.p, self.k, self.temperature, self.humidity, self.ph, self.rainfall]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    Model,
    Fallback,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CropRecommendation {
    pub id: String,
    pub user_id: String,
    pub soil_test_id: Option<String>,
    pub crop_name: String,
    pub source: RecommendationSource,
    pub n: f64,
    pub p: f64,
    pub k: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub ph: f64,
    pub rainfall: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecommendationRequest {
    #[serde(flatten)]
    pub features: FeatureVector,
    pub soil_test_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl RecommendationQuery {
    pub fn normalize(&self) -> (i64, i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(20).clamp(1, 100);
        (page, per_page, (page - 1).saturating_mul(per_page))
    }
}

impl CropRecommendation {
    pub fn new(
        user_id: &str,
        soil_test_id: Option<String>,
        crop_name: &str,
        source: RecommendationSource,
        features: &FeatureVector,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            soil_test_id,
            crop_name: crop_name.to_string(),
            source,
            n: features.n,
            p: features.p,
            k: features.k,
            temperature: features.temperature,
            humidity: features.humidity,
            ph: features.ph,
            rainfall: features.rainfall,
            created_at: Utc::now(),
        }
    }

    pub async fn insert(&self, pool: &SqlitePool) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO crop_recommendations (
                id, user_id, soil_test_id, crop_name, source,
                n, p, k, temperature, humidity, ph, rainfall, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        )
            .bind(&self.id)
            .bind(&self.user_id)
            .bind(&self.soil_test_id)
            .bind(&self.crop_name)
            .bind(self.source)
            .bind(self.n)
            .bind(self.p)
            .bind(self.k)
            .bind(self.temperature)
            .bind(self.humidity)
            .bind(self.ph)
            .bind(self.rainfall)
            .bind(self.created_at)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn latest_for_user(pool: &SqlitePool, user_id: &str) -> ApiResult<Option<CropRecommendation>> {
        let latest = sqlx::query_as::<_, CropRecommendation>(
            "SELECT * FROM crop_recommendations WHERE user_id = ? ORDER BY created_at DESC LIMIT 1"
        )
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feature_vector_wire_names() {
        let features: FeatureVector = serde_json::from_value(json!({
            "N": 90, "P": 42, "K": 43,
            "temperature": 20.8, "humidity": 82.0, "ph": 6.5, "rainfall": 202.9
        }))
        .unwrap();

        assert_eq!(features.n, 90.0);
        let value = serde_json::to_value(features).unwrap();
        assert_eq!(value["N"], json!(90.0));
        assert!(value.get("n").is_none());
    }

    #[test]
    fn test_normalize_saturates_huge_page() {
        let query = RecommendationQuery { page: Some(i64::MAX), per_page: Some(50) };
        assert_eq!(query.normalize(), (i64::MAX, 50, i64::MAX));
        let query = RecommendationQuery { page: None, per_page: None };
        assert_eq!(query.normalize(), (1, 20, 0));
    }

    #[test]
    fn test_feature_vector_ranges() {
        let mut features = FeatureVector {
            n: 90.0, p: 42.0, k: 43.0,
            temperature: -5.0, humidity: 82.0, ph: 6.5, rainfall: 202.9,
        };
        assert!(features.validate().is_ok());

        features.humidity = 120.0;
        assert!(features.validate().is_err());

        features.humidity = 50.0;
        features.ph = 15.0;
        assert!(features.validate().is_err());

        features.ph = 6.0;
        features.k = -1.0;
        assert!(features.validate().is_err());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let parsed: Result<CreateRecommendationRequest, _> = serde_json::from_value(json!({
            "N": 90, "P": 42, "temperature": 20.8, "humidity": 82.0, "ph": 6.5, "rainfall": 202.9
        }));
        assert!(parsed.is_err());
    }
}
