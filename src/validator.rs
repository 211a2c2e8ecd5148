// src/validator.rs - Form validation shared by the auth and profile endpoints
use serde::Serialize;
use regex::Regex;
use lazy_static::lazy_static;
use crate::error::ApiError;
use crate::auth::{ChangePasswordRequest, SignInRequest, SignUpRequest, UpdateProfileRequest};

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref PHONE_REGEX: Regex = Regex::new(r"^\+?[\d\s\-()]{10,}$").unwrap();
    static ref LETTER_REGEX: Regex = Regex::new(r"[A-Za-z]").unwrap();
    static ref DIGIT_REGEX: Regex = Regex::new(r"\d").unwrap();
}

pub const PASSWORD_MIN_LEN: usize = 6;
pub const PASSWORD_MAX_LEN: usize = 72;
pub const EMAIL_MAX_LEN: usize = 255;
pub const PHONE_MAX_LEN: usize = 32;

// ==================== VALIDATION RESULT ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Collected form errors, kept in the order they were found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn messages(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.message.as_str()).collect()
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::ValidationError(self.messages().join("; "))
    }

    /// `Ok(())` when valid, otherwise the joined messages as a 422.
    pub fn into_result(self) -> Result<(), ApiError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(self.to_api_error())
        }
    }
}

// ==================== FIELD VALIDATORS ====================

pub struct FieldValidator;

impl FieldValidator {
    pub fn email(value: &str) -> Result<(), String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("Email is required".to_string());
        }
        if !EMAIL_REGEX.is_match(value) {
            return Err("Please enter a valid email address".to_string());
        }
        Self::length(value, "Email", EMAIL_MAX_LEN)
    }

    /// Every broken password rule, not just the first.
    pub fn password(value: &str) -> Vec<String> {
        if value.is_empty() {
            return vec!["Password is required".to_string()];
        }

        let mut errors = Vec::new();
        let len = value.chars().count();
        if len < PASSWORD_MIN_LEN {
            errors.push(format!("Password must be at least {} characters long", PASSWORD_MIN_LEN));
        }
        if len > PASSWORD_MAX_LEN {
            errors.push(format!("Password must be less than {} characters long", PASSWORD_MAX_LEN));
        }
        if !LETTER_REGEX.is_match(value) {
            errors.push("Password must contain at least one letter".to_string());
        }
        if !DIGIT_REGEX.is_match(value) {
            errors.push("Password must contain at least one number".to_string());
        }
        errors
    }

    pub fn full_name(value: &str) -> Result<(), String> {
        if value.trim().chars().count() < 2 {
            return Err("Full name must be at least 2 characters long".to_string());
        }
        if value.trim().chars().count() > 255 {
            return Err("Full name must not exceed 255 characters".to_string());
        }
        Ok(())
    }

    pub fn phone(value: &str) -> Result<(), String> {
        let value = value.trim();
        if !PHONE_REGEX.is_match(value) {
            return Err("Please enter a valid phone number".to_string());
        }
        Self::length(value, "Phone number", PHONE_MAX_LEN)
    }

    pub fn length(value: &str, field: &str, max: usize) -> Result<(), String> {
        if value.chars().count() > max {
            Err(format!("{} must not exceed {} characters", field, max))
        } else {
            Ok(())
        }
    }
}

/// Lower-cased, trimmed e-mail as stored in `users.email`.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ==================== CUSTOM VALIDATION ====================

pub trait CustomValidate {
    fn custom_validate(&self) -> ValidationResult;
}

fn validate_optional_profile_fields(
    result: &mut ValidationResult,
    phone: Option<&str>,
    location: Option<&str>,
    farm_size: Option<&str>,
) {
    if let Some(phone) = phone.filter(|p| !p.trim().is_empty()) {
        if let Err(e) = FieldValidator::phone(phone) {
            result.add_error("phone", e);
        }
    }
    if let Some(location) = location {
        if let Err(e) = FieldValidator::length(location, "Location", 500) {
            result.add_error("location", e);
        }
    }
    if let Some(farm_size) = farm_size {
        if let Err(e) = FieldValidator::length(farm_size, "Farm size", 100) {
            result.add_error("farm_size", e);
        }
    }
}

impl CustomValidate for SignUpRequest {
    fn custom_validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = FieldValidator::email(&self.email) {
            result.add_error("email", e);
        }
        for e in FieldValidator::password(&self.password) {
            result.add_error("password", e);
        }
        if let Err(e) = FieldValidator::full_name(&self.full_name) {
            result.add_error("full_name", e);
        }
        validate_optional_profile_fields(
            &mut result,
            self.phone.as_deref(),
            self.location.as_deref(),
            self.farm_size.as_deref(),
        );

        result
    }
}

impl CustomValidate for SignInRequest {
    fn custom_validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = FieldValidator::email(&self.email) {
            result.add_error("email", e);
        }
        if self.password.is_empty() {
            result.add_error("password", "Password is required");
        }

        result
    }
}

impl CustomValidate for ChangePasswordRequest {
    fn custom_validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.current_password.is_empty() {
            result.add_error("current_password", "Current password is required");
        }
        for e in FieldValidator::password(&self.new_password) {
            result.add_error("new_password", e);
        }

        result
    }
}

impl CustomValidate for UpdateProfileRequest {
    fn custom_validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Some(ref full_name) = self.full_name {
            if let Err(e) = FieldValidator::full_name(full_name) {
                result.add_error("full_name", e);
            }
        }
        validate_optional_profile_fields(
            &mut result,
            self.phone.as_deref(),
            self.location.as_deref(),
            self.farm_size.as_deref(),
        );
        if let Some(ref avatar_url) = self.avatar_url {
            if let Err(e) = FieldValidator::length(avatar_url, "Avatar URL", 1000) {
                result.add_error("avatar_url", e);
            }
        }

        result
    }
}
