//! Deployed inference endpoint record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The inference endpoint and the image it currently serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceDeployment {
    /// Fixed endpoint identifier (e.g. `inference-lambda`)
    pub endpoint: String,

    /// Image reference the endpoint is bound to
    pub image_ref: String,

    pub created_at: DateTime<Utc>,

    /// Last time the bound image changed
    pub last_updated: DateTime<Utc>,
}

impl InferenceDeployment {
    /// A new endpoint bound to `image_ref`
    pub fn create(endpoint: impl Into<String>, image_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            endpoint: endpoint.into(),
            image_ref: image_ref.into(),
            created_at: now,
            last_updated: now,
        }
    }

    /// Rebind to `image_ref`. Returns false (and leaves the record as is)
    /// when it already serves that image.
    pub fn rebind(&mut self, image_ref: &str) -> bool {
        if self.image_ref == image_ref {
            return false;
        }
        self.image_ref = image_ref.to_string();
        self.last_updated = Utc::now();
        true
    }
}

/// What a deploy call did to the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployAction {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for DeployAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}
