//! Object storage collaborator. Sandbox containers read and write their
//! cold-tier data directly against the configured S3 bucket; the daemon's
//! only obligation is to hand each container the right bucket/region
//! pair and to validate the bucket name shape at startup (see
//! `config::validate_bucket_name`). No prefix management, credential
//! minting, or lifecycle policy is implemented here.

use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub bucket: String,
    pub region: String,
}

impl ObjectStorageConfig {
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        if settings.s3_bucket.is_empty() {
            return None;
        }
        Some(Self {
            bucket: settings.s3_bucket.clone(),
            region: settings.s3_region.clone(),
        })
    }
}
