// src/prediction.rs - Client for the external crop-prediction service
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::PredictionConfig;
use crate::models::FeatureVector;

/// Shown to the user when no crop could be predicted.
pub const UNABLE_TO_PREDICT: &str = "Unable to predict crop";

pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".tiff", ".bmp"];

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Failed to connect to prediction service")]
    Connect,

    #[error("Prediction service timed out")]
    Timeout,

    #[error("Prediction service HTTP error: {0}")]
    Http(String),

    #[error("Prediction error: {0}")]
    Other(String),

    /// The service understood the request but refused it with a message.
    #[error("{0}")]
    Rejected(String),
}

impl From<reqwest::Error> for PredictionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PredictionError::Timeout
        } else if err.is_connect() {
            PredictionError::Connect
        } else if let Some(status) = err.status() {
            PredictionError::Http(status.to_string())
        } else {
            PredictionError::Other(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy(u16),
    Unavailable,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceHealth::Healthy)
    }

    pub fn describe(&self) -> String {
        match self {
            ServiceHealth::Healthy => "healthy".to_string(),
            ServiceHealth::Unhealthy(code) => format!("unhealthy (status code: {})", code),
            ServiceHealth::Unavailable => "unavailable".to_string(),
        }
    }
}

impl Serialize for ServiceHealth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.describe())
    }
}

/// Result of forwarding a photographed soil report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub form_data: Option<FeatureVector>,
    pub recommended_crop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    error: String,
}

pub fn is_supported_image(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    SUPPORTED_IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Rule of thumb used when the model is out of reach.
pub fn fallback_crop(features: &FeatureVector) -> &'static str {
    let (n, p, k) = (features.n, features.p, features.k);

    if (10.0..=20.0).contains(&n) && (35.0..=45.0).contains(&p) && (10.0..=20.0).contains(&k) {
        "mungbean"
    } else if n > 100.0 && p > 100.0 && k > 100.0 {
        "rice"
    } else if n > 80.0 && p > 40.0 && k > 40.0 {
        "wheat"
    } else if n > 40.0 && p > 60.0 && k > 80.0 {
        "cotton"
    } else if features.ph < 6.0 {
        "blueberries"
    } else {
        "maize"
    }
}

fn crop_from_body(body: &Value) -> Result<String> {
    body.get("crop")
        .or_else(|| body.get("recommended_crop"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| match body.get("error").and_then(Value::as_str) {
            Some(message) => PredictionError::Other(message.to_string()),
            None => PredictionError::Other("response did not include a crop".to_string()),
        })
}

pub struct PredictionClient {
    http_client: Client,
    base_url: Url,
}

impl PredictionClient {
    pub fn new(config: &PredictionConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PredictionError::Other(e.to_string()))?;
        Self::with_client(&config.base_url, http_client)
    }

    pub fn with_client(base_url: &str, http_client: Client) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| PredictionError::Other(e.to_string()))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http_client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PredictionError::Other(e.to_string()))
    }

    /// Asks the model for one crop.
    pub async fn predict(&self, features: &FeatureVector) -> Result<String> {
        let url = self.endpoint("predict")?;
        let response = self.http_client.post(url).json(features).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictionError::Http(status.to_string()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PredictionError::Other(e.to_string()))?;
        crop_from_body(&body)
    }

    pub async fn health(&self) -> ServiceHealth {
        let url = match self.endpoint("health") {
            Ok(url) => url,
            Err(_) => return ServiceHealth::Unavailable,
        };

        match self.http_client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => ServiceHealth::Healthy,
            Ok(response) => ServiceHealth::Unhealthy(response.status().as_u16()),
            Err(_) => ServiceHealth::Unavailable,
        }
    }

    /// Sends a photo of a soil report; the service reads the values off it
    /// and predicts a crop.
    pub async fn upload_form(
        &self,
        filename: &str,
        content_type: Option<&str>,
        image: Vec<u8>,
    ) -> Result<UploadOutcome> {
        let url = self.endpoint("upload-form")?;

        let mut part = Part::bytes(image).file_name(filename.to_string());
        if let Some(mime) = content_type {
            part = part
                .mime_str(mime)
                .map_err(|e| PredictionError::Other(e.to_string()))?;
        }
        let form = Form::new().part("image", part);

        let response = self.http_client.post(url).multipart(form).send().await?;
        let status = response.status();

        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<ServiceErrorBody>(&text) {
                Ok(body) => Err(PredictionError::Rejected(body.error)),
                Err(_) => Err(PredictionError::Http(status.to_string())),
            };
        }
        if !status.is_success() {
            return Err(PredictionError::Http(status.to_string()));
        }

        response
            .json::<UploadOutcome>()
            .await
            .map_err(|e| PredictionError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn features() -> FeatureVector {
        FeatureVector {
            n: 90.0, p: 42.0, k: 43.0,
            temperature: 20.8, humidity: 82.0, ph: 6.5, rainfall: 202.9,
        }
    }

    fn client(uri: &str, timeout_seconds: u64) -> PredictionClient {
        PredictionClient::new(&PredictionConfig {
            base_url: uri.to_string(),
            timeout_seconds,
            fallback_enabled: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_predict_reads_crop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_json(json!({
                "N": 90.0, "P": 42.0, "K": 43.0,
                "temperature": 20.8, "humidity": 82.0, "ph": 6.5, "rainfall": 202.9
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "crop": "rice" })))
            .mount(&server)
            .await;

        let crop = client(&server.uri(), 10).predict(&features()).await.unwrap();
        assert_eq!(crop, "rice");
    }

    #[tokio::test]
    async fn test_predict_accepts_proxy_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recommended_crop": "jute" })))
            .mount(&server)
            .await;

        let crop = client(&server.uri(), 10).predict(&features()).await.unwrap();
        assert_eq!(crop, "jute");
    }

    #[tokio::test]
    async fn test_predict_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 10).predict(&features()).await.unwrap_err();
        assert!(matches!(err, PredictionError::Http(_)));
        assert!(err.to_string().starts_with("Prediction service HTTP error: 500"));
    }

    #[tokio::test]
    async fn test_predict_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "crop": "rice" }))
                    .set_delay(Duration::from_millis(2500)),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri(), 1).predict(&features()).await.unwrap_err();
        assert_eq!(err.to_string(), "Prediction service timed out");
    }

    #[tokio::test]
    async fn test_predict_connection_refused() {
        // Bind and drop a listener to get a port nobody is serving.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = client(&format!("http://127.0.0.1:{}", port), 5)
            .predict(&features())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to connect to prediction service");
    }

    #[tokio::test]
    async fn test_predict_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "model not loaded" })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 10).predict(&features()).await.unwrap_err();
        assert_eq!(err.to_string(), "Prediction error: model not loaded");
    }

    #[tokio::test]
    async fn test_health_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let health = client(&server.uri(), 10).health().await;
        assert_eq!(health, ServiceHealth::Unhealthy(503));
        assert_eq!(health.describe(), "unhealthy (status code: 503)");

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "healthy" })))
            .mount(&server)
            .await;
        assert!(client(&server.uri(), 10).health().await.is_healthy());
    }

    #[tokio::test]
    async fn test_upload_form() {
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

        let outcome = client(&server.uri(), 10)
            .upload_form("report.png", Some("image/png"), vec![0x89, 0x50, 0x4e, 0x47])
            .await
            .unwrap();
        assert_eq!(outcome.recommended_crop, "rice");
        assert_eq!(outcome.form_data.unwrap().k, 43.0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_upload_form_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload-form"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "Could not extract values from image. Please check image quality or enter values manually."
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 10)
            .upload_form("blurry.jpg", None, vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, PredictionError::Rejected(_)));
        assert!(err.to_string().starts_with("Could not extract values"));
    }

    #[test]
    fn test_base_url_with_path_prefix() {
        let client = PredictionClient::with_client("http://ml.internal/api", Client::new()).unwrap();
        assert_eq!(client.endpoint("predict").unwrap().as_str(), "http://ml.internal/api/predict");
    }

    #[test]
    fn test_fallback_rules_in_order() {
        let mut f = features();
        (f.n, f.p, f.k) = (15.0, 40.0, 15.0);
        assert_eq!(fallback_crop(&f), "mungbean");
        (f.n, f.p, f.k) = (120.0, 110.0, 101.0);
        assert_eq!(fallback_crop(&f), "rice");
        (f.n, f.p, f.k) = (90.0, 42.0, 43.0);
        assert_eq!(fallback_crop(&f), "wheat");
        (f.n, f.p, f.k) = (50.0, 70.0, 90.0);
        assert_eq!(fallback_crop(&f), "cotton");
        (f.n, f.p, f.k, f.ph) = (10.0, 10.0, 10.0, 5.5);
        assert_eq!(fallback_crop(&f), "blueberries");
        f.ph = 6.5;
        assert_eq!(fallback_crop(&f), "maize");
    }

    #[test]
    fn test_supported_images() {
        assert!(is_supported_image("Report.JPEG"));
        assert!(is_supported_image("scan.tiff"));
        assert!(!is_supported_image("notes.pdf"));
        assert!(!is_supported_image("png"));
    }
}
