//! Manual build uploads and triggered build records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::release::PlatformName;
use crate::task::TaskStage;
use crate::{Error, Result};

/// File extensions accepted for manual build artifacts
pub const ALLOWED_BUILD_EXTENSIONS: &[&str] = &[".ipa", ".apk", ".aab"];

/// A staged manual build artifact for one `(release, stage, platform)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseUpload {
    pub id: String,
    pub release_id: String,
    pub stage: TaskStage,
    pub platform: PlatformName,
    pub artifact_path: String,
    pub download_url: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl ReleaseUpload {
    pub fn new(
        release_id: String,
        stage: TaskStage,
        platform: PlatformName,
        artifact_path: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            stage,
            platform,
            artifact_path,
            download_url: None,
            uploaded_at: Utc::now(),
        }
    }
}

/// Validate a manual build filename against the accepted extensions.
pub fn validate_build_extension(filename: &str) -> Result<()> {
    let lower = filename.to_lowercase();
    if ALLOWED_BUILD_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Unsupported build artifact extension for '{}'; expected one of {:?}",
            filename, ALLOWED_BUILD_EXTENSIONS
        )))
    }
}

/// Result of a manual build upload, reporting platform readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub uploaded_platforms: Vec<PlatformName>,
    pub missing_platforms: Vec<PlatformName>,
    pub all_platforms_ready: bool,
}

/// A build triggered against a CI/CD workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub release_id: String,
    pub regression_id: Option<String>,
    pub platform: PlatformName,
    pub build_number: String,
    pub workflow_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn new(release_id: String, platform: PlatformName, build_number: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            regression_id: None,
            platform,
            build_number,
            workflow_run_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_cycle(mut self, regression_id: String) -> Self {
        self.regression_id = Some(regression_id);
        self
    }
}
