// src/models/profile.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub farm_size: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update. Absent fields are left alone; an empty string clears an
/// optional field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub farm_size: Option<String>,
    pub avatar_url: Option<String>,
}

impl UpdateProfileRequest {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.phone.is_none()
            && self.location.is_none()
            && self.farm_size.is_none()
            && self.avatar_url.is_none()
    }
}

fn merge_optional(current: Option<String>, update: Option<&String>) -> Option<String> {
    match update {
        None => current,
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        }
    }
}

impl Profile {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> ApiResult<Profile> {
        sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| ApiError::not_found("Profile"))
    }

    /// Applies `request` on top of the stored profile.
    pub fn merged(mut self, request: &UpdateProfileRequest) -> Profile {
        if let Some(ref full_name) = request.full_name {
            self.full_name = full_name.trim().to_string();
        }
        self.phone = merge_optional(self.phone, request.phone.as_ref());
        self.location = merge_optional(self.location, request.location.as_ref());
        self.farm_size = merge_optional(self.farm_size, request.farm_size.as_ref());
        self.avatar_url = merge_optional(self.avatar_url, request.avatar_url.as_ref());
        self
    }

    pub async fn update(pool: &SqlitePool, id: &str, request: &UpdateProfileRequest) -> ApiResult<Profile> {
        let mut profile = Profile::find_by_id(pool, id).await?.merged(request);
        profile.updated_at = Utc::now();

        sqlx::query(
            r#"UPDATE profiles
               SET full_name = ?, phone = ?, location = ?, farm_size = ?, avatar_url = ?, updated_at = ?
               WHERE id = ?"#
        )
            .bind(&profile.full_name)
            .bind(&profile.phone)
            .bind(&profile.location)
            .bind(&profile.farm_size)
            .bind(&profile.avatar_url)
            .bind(profile.updated_at)
            .bind(id)
            .execute(pool)
            .await?;

        Ok(profile)
    }
}
