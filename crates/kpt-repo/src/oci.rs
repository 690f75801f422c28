//! OCI upstream fetcher
//!
//! A package published to a registry is an image whose layers are tar
//! archives of the package tree. Layers are unpacked in manifest order, so
//! later layers overwrite earlier ones.

use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use kpt_core::{OciLock, OciUpstream};

use crate::error::{RepoError, Result};
use crate::fs::{copy_dir, extract_archive};
use crate::upstream::OCI_SCHEME;

/// Layer media types holding package content
pub mod media_types {
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    pub const ALL: [&str; 4] = [OCI_LAYER_TAR, OCI_LAYER_TAR_GZIP, DOCKER_LAYER_TAR, DOCKER_LAYER_GZIP];
}

#[derive(Debug, Clone)]
pub struct OciFetcher {
    image: String,
}

impl OciFetcher {
    pub fn new(upstream: &OciUpstream) -> Self {
        Self {
            image: upstream.image.clone(),
        }
    }

    /// Fetcher pinned to the digest recorded in a lock
    pub fn at_lock(lock: &OciLock) -> Self {
        let name = lock.image.split('@').next().unwrap_or(&lock.image);
        let image = if lock.digest.is_empty() {
            lock.image.clone()
        } else {
            format!("{}@{}", strip_tag(name), lock.digest)
        };
        Self { image }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn validate(&self) -> Result<()> {
        parse_reference(&self.image).map(|_| ())
    }

    /// Pull the image into `dest` and return the resolved lock
    pub async fn fetch(&self, cancel: &CancellationToken, dest: &Path) -> Result<OciLock> {
        let reference = parse_reference(&self.image)?;
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });

        tracing::info!(image = %self.image, "pulling package image");
        let pull = client.pull(&reference, &RegistryAuth::Anonymous, media_types::ALL.to_vec());
        let image = tokio::select! {
            image = pull => image.map_err(|e| RepoError::Oci {
                image: self.image.clone(),
                message: format!("failed to pull: {}", e),
            })?,
            _ = cancel.cancelled() => return Err(RepoError::Cancelled),
        };

        if image.layers.is_empty() {
            return Err(RepoError::Oci {
                image: self.image.clone(),
                message: "image has no package layers".to_string(),
            });
        }

        let staging = tempfile::tempdir()?;
        for layer in &image.layers {
            tracing::debug!(
                image = %self.image,
                media_type = %layer.media_type,
                size = layer.data.len(),
                "extracting layer"
            );
            extract_archive(&layer.data, staging.path())?;
        }
        copy_dir(staging.path(), dest)?;

        let digest = image
            .digest
            .or_else(|| reference.digest().map(str::to_string))
            .unwrap_or_default();
        Ok(OciLock {
            image: self.image.clone(),
            digest,
        })
    }
}

/// Parse an image reference, with or without the `oci://` scheme
pub fn parse_reference(image: &str) -> Result<Reference> {
    let clean = image.trim_start_matches(OCI_SCHEME);
    Reference::try_from(clean).map_err(|e| RepoError::InvalidUpstream {
        arg: image.to_string(),
        reason: e.to_string(),
    })
}

/// Drop a `:tag` from the last path segment
pub(crate) fn strip_tag(name: &str) -> &str {
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[last_slash..].rfind(':') {
        Some(colon) => &name[..last_slash + colon],
        None => name,
    }
}
