//! Per-invocation secret mounts
//!
//! Each logical secret name maps to exactly one mount path inside a scope
//! directory that exists only for the duration of one invocation. The
//! runtime never hands secret bytes to callers; handlers read the files at
//! the mount paths they are given.

use crate::descriptor::CapabilityDescriptor;
use crate::error::CapabilityError;
use crate::invocation::{ExecutionContext, SecretRef};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Failure to materialize a secret
#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    /// Reference does not resolve
    #[error("secret reference `{0}` does not resolve")]
    NotFound(String),

    /// Writing the mount failed
    #[error("secret mount failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of secret material
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Write the material behind `reference` to `target`
    async fn materialize(&self, reference: &SecretRef, target: &Path)
        -> Result<(), SecretStoreError>;
}

/// Store whose references are paths of files holding the material
#[derive(Debug, Clone, Default)]
pub struct FileSecretStore;

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn materialize(
        &self,
        reference: &SecretRef,
        target: &Path,
    ) -> Result<(), SecretStoreError> {
        let source = Path::new(reference.as_str());
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(SecretStoreError::NotFound(reference.to_string()));
        }
        tokio::fs::copy(source, target).await?;
        restrict_permissions(target).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// A mounted secret: its logical name and where the material lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    /// Logical name
    pub name: String,
    /// File holding the material
    pub path: PathBuf,
}

/// Secrets mounted for one invocation
#[derive(Debug, Clone, Default)]
pub struct SecretMounts {
    scope: Option<PathBuf>,
    mounts: BTreeMap<String, PathBuf>,
}

impl SecretMounts {
    /// Mount path of `name`
    #[must_use]
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.mounts.get(name).map(PathBuf::as_path)
    }

    /// All mounts
    pub fn iter(&self) -> impl Iterator<Item = SecretMount> + '_ {
        self.mounts.iter().map(|(name, path)| SecretMount {
            name: name.clone(),
            path: path.clone(),
        })
    }

    /// Number of mounted secrets
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether nothing is mounted
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Remove the scope directory and everything in it
    pub(crate) async fn discard(self) {
        let Some(scope) = self.scope else {
            return;
        };
        match tokio::fs::remove_dir_all(&scope).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(scope = %scope.display(), error = %e, "failed to discard secret mounts");
            }
        }
    }
}

/// Resolve the context's references into mounts under `root`
///
/// Fails closed: a required secret without a reference, or a reference the
/// store cannot materialize, yields `MISSING_SECRET` and nothing is left
/// mounted.
pub(crate) async fn mount_secrets(
    store: &dyn SecretStore,
    root: &Path,
    descriptor: &CapabilityDescriptor,
    context: &ExecutionContext,
) -> Result<SecretMounts, CapabilityError> {
    for required in descriptor.required_secrets() {
        if !context.secret_refs.contains_key(&required) {
            tracing::warn!(capability = descriptor.id(), secret = %required, "required secret has no reference");
            return Err(CapabilityError::missing_secret(descriptor.id(), &required));
        }
    }

    let wanted: Vec<(&String, &SecretRef)> = descriptor
        .declared_secrets()
        .into_iter()
        .filter_map(|name| context.secret_refs.get_key_value(&name))
        .collect();
    if wanted.is_empty() {
        return Ok(SecretMounts::default());
    }

    let scope = root.join(uuid::Uuid::new_v4().to_string());
    let mut mounts = SecretMounts {
        scope: Some(scope.clone()),
        mounts: BTreeMap::new(),
    };
    if let Err(e) = create_scope(&scope).await {
        tracing::error!(scope = %scope.display(), error = %e, "cannot create secret scope");
        mounts.discard().await;
        return Err(CapabilityError::runner("secret scope could not be created"));
    }

    for (name, reference) in wanted {
        let target = scope.join(name);
        if let Err(e) = store.materialize(reference, &target).await {
            tracing::warn!(
                capability = descriptor.id(),
                secret = %name,
                reference = %reference,
                error = %e,
                "secret could not be materialized"
            );
            mounts.discard().await;
            return Err(CapabilityError::missing_secret(descriptor.id(), name));
        }
        tracing::debug!(capability = descriptor.id(), secret = %name, path = %target.display(), "secret mounted");
        mounts.mounts.insert(name.clone(), target);
    }

    Ok(mounts)
}

async fn create_scope(scope: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(scope).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(scope, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CapabilityVersion;
    use crate::error::ErrorKind;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("registry.push", CapabilityVersion::new(1, 0, 0))
            .secrets_schema(serde_json::json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "ca_bundle": { "type": "string" }
                },
                "required": ["token"]
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_required_secret_fails_closed() {
        let root = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new("shop", "prod", "alice");

        let err = mount_secrets(&FileSecretStore, root.path(), &descriptor(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingSecret);
        assert!(err.message.contains("token"));
    }

    #[tokio::test]
    async fn mounts_each_secret_once_and_discards_scope() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source-token");
        tokio::fs::write(&source, "s3cr3t").await.unwrap();

        let ctx = ExecutionContext::new("shop", "prod", "alice")
            .with_secret_ref("token", SecretRef::new(source.to_string_lossy()));
        let mounts = mount_secrets(&FileSecretStore, root.path(), &descriptor(), &ctx)
            .await
            .unwrap();

        assert_eq!(mounts.len(), 1);
        let path = mounts.path("token").unwrap().to_path_buf();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "s3cr3t");
        assert!(mounts.path("ca_bundle").is_none());

        mounts.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unresolvable_reference_is_missing_secret() {
        let root = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new("shop", "prod", "alice")
            .with_secret_ref("token", SecretRef::new("/definitely/not/here"));

        let err = mount_secrets(&FileSecretStore, root.path(), &descriptor(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingSecret);
    }
}
