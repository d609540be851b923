//! Endpoint registry kept on the local filesystem.
//!
//! Each endpoint is one JSON record at `{endpoints_dir}/{endpoint}.json`,
//! replaced atomically under an exclusive lock on `{endpoint}.lock`.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::{info, warn};

use crate::domain::{DeployAction, InferenceDeployment};
use crate::store::fs::replace_file;

use super::{DeployError, DeployOutcome, Deployer};

/// Deploys by rebinding the endpoint record directly
#[derive(Debug, Clone)]
pub struct RegistryDeployer {
    dir: PathBuf,
    endpoint: String,
}

impl RegistryDeployer {
    pub fn new(endpoints_dir: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            dir: endpoints_dir.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Path of the endpoint record
    pub fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.endpoint))
    }

    fn validate(&self) -> Result<(), DeployError> {
        let name = self.endpoint.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(DeployError::Backend(format!(
                "invalid endpoint name {:?}",
                name
            )));
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<InferenceDeployment>, DeployError> {
    match std::fs::read(path) {
        Ok(content) => serde_json::from_slice(&content).map(Some).map_err(|e| {
            DeployError::Backend(format!("corrupt endpoint record {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(DeployError::Unauthorized {
            endpoint: path.display().to_string(),
            message: e.to_string(),
        }),
        Err(e) => Err(DeployError::Backend(format!("{}: {}", path.display(), e))),
    }
}

fn io_error(endpoint: &str, path: &Path, e: std::io::Error) -> DeployError {
    if e.kind() == ErrorKind::PermissionDenied {
        DeployError::Unauthorized {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        }
    } else {
        DeployError::Backend(format!("{}: {}", path.display(), e))
    }
}

/// Read-decide-write under the endpoint lock
fn deploy_blocking(dir: &Path, endpoint: &str, image_ref: &str) -> Result<DeployOutcome, DeployError> {
    std::fs::create_dir_all(dir).map_err(|e| io_error(endpoint, dir, e))?;

    let lock_path = dir.join(format!("{}.lock", endpoint));
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| io_error(endpoint, &lock_path, e))?;
    lock.lock_exclusive()
        .map_err(|e| io_error(endpoint, &lock_path, e))?;

    let record_path = dir.join(format!("{}.json", endpoint));
    let outcome = match read_record(&record_path)? {
        None => DeployOutcome {
            deployment: InferenceDeployment::create(endpoint, image_ref),
            action: DeployAction::Created,
        },
        Some(mut deployment) => {
            let action = if deployment.rebind(image_ref) {
                DeployAction::Updated
            } else {
                DeployAction::Unchanged
            };
            DeployOutcome { deployment, action }
        }
    };

    if outcome.action != DeployAction::Unchanged {
        let json = serde_json::to_vec_pretty(&outcome.deployment)
            .map_err(|e| DeployError::Backend(e.to_string()))?;
        replace_file(&record_path, &json).map_err(|e| DeployError::Backend(e.to_string()))?;
    }

    if let Err(e) = lock.unlock() {
        warn!(path = %lock_path.display(), error = %e, "Failed to release endpoint lock");
    }
    Ok(outcome)
}

#[async_trait]
impl Deployer for RegistryDeployer {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn current(&self) -> Result<Option<InferenceDeployment>, DeployError> {
        self.validate()?;
        let path = self.record_path();
        tokio::task::spawn_blocking(move || read_record(&path))
            .await
            .map_err(|e| DeployError::Backend(e.to_string()))?
    }

    async fn deploy(&self, image_ref: &str) -> Result<DeployOutcome, DeployError> {
        self.validate()?;
        if image_ref.trim().is_empty() {
            return Err(DeployError::Backend("empty image reference".to_string()));
        }

        let dir = self.dir.clone();
        let endpoint = self.endpoint.clone();
        let image = image_ref.to_string();

        let outcome = tokio::task::spawn_blocking(move || deploy_blocking(&dir, &endpoint, &image))
            .await
            .map_err(|e| DeployError::Backend(e.to_string()))??;

        info!(
            endpoint = %self.endpoint,
            image_ref,
            action = ?outcome.action,
            "Endpoint deployed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const IMAGE_A: &str = "1234.dkr.ecr.us-east-1.amazonaws.com/inference-ecr:abc";
    const IMAGE_B: &str = "1234.dkr.ecr.us-east-1.amazonaws.com/inference-ecr:def";

    #[tokio::test]
    async fn test_create_then_update() {
        let temp = TempDir::new().unwrap();
        let deployer = RegistryDeployer::new(temp.path(), "inference-lambda");

        assert!(deployer.current().await.unwrap().is_none());

        let created = deployer.deploy(IMAGE_A).await.unwrap();
        assert_eq!(created.action, DeployAction::Created);
        assert_eq!(created.deployment.image_ref, IMAGE_A);

        let updated = deployer.deploy(IMAGE_B).await.unwrap();
        assert_eq!(updated.action, DeployAction::Updated);
        assert_eq!(updated.deployment.created_at, created.deployment.created_at);

        let current = deployer.current().await.unwrap().unwrap();
        assert_eq!(current.image_ref, IMAGE_B);
    }

    #[tokio::test]
    async fn test_redeploy_same_image_is_unchanged() {
        let temp = TempDir::new().unwrap();
        let deployer = RegistryDeployer::new(temp.path(), "inference-lambda");

        deployer.deploy(IMAGE_A).await.unwrap();
        let before = deployer.current().await.unwrap().unwrap();

        let again = deployer.deploy(IMAGE_A).await.unwrap();
        assert_eq!(again.action, DeployAction::Unchanged);
        assert_eq!(deployer.current().await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_backend_error() {
        let temp = TempDir::new().unwrap();
        let deployer = RegistryDeployer::new(temp.path(), "inference-lambda");
        std::fs::write(deployer.record_path(), "{not json").unwrap();

        let err = deployer.deploy(IMAGE_A).await.unwrap_err();
        assert!(matches!(err, DeployError::Backend(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_like_endpoint() {
        let temp = TempDir::new().unwrap();
        let deployer = RegistryDeployer::new(temp.path(), "../escape");
        assert!(deployer.deploy(IMAGE_A).await.is_err());
    }
}
