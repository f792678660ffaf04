//! Content-addressed staging of uploaded files in an S3-compatible store.
//!
//! Staging must complete before parsing begins; the raw object outlives the
//! job so retries re-run from the original bytes. Nothing here deletes.

use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::ObjectStore;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub allow_http: bool,
}

impl ObjectStorageConfig {
    pub fn from_core(config: &crate::config::CoreConfig) -> Self {
        Self {
            endpoint: config.s3_endpoint.clone(),
            bucket: config.s3_bucket.clone(),
            access_key_id: config.s3_access_key.clone(),
            secret_access_key: config.s3_secret_key.clone(),
            region: config.s3_region.clone(),
            allow_http: config.s3_allow_http,
        }
    }
}

#[derive(Debug)]
pub struct ObjectStorage {
    store: AmazonS3,
}

impl ObjectStorage {
    pub fn new(config: &ObjectStorageConfig) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(config.endpoint.as_str())
            .with_bucket_name(config.bucket.as_str())
            .with_access_key_id(config.access_key_id.as_str())
            .with_secret_access_key(config.secret_access_key.as_str())
            .with_region(config.region.as_str())
            .with_allow_http(config.allow_http)
            .build()
            .context("failed to build S3 object store client")?;
        Ok(Self { store })
    }

    pub fn raw_upload_key(dataset_id: Uuid, original_filename: &str) -> String {
        format!("raw-uploads/{dataset_id}/{original_filename}")
    }

    pub async fn stage(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = ObjectPath::from(key);
        self.store
            .put(&path, bytes.into())
            .await
            .with_context(|| format!("failed to stage object {key}"))?;
        Ok(())
    }

    pub async fn fetch(&self, key: &str) -> Result<Bytes> {
        let path = ObjectPath::from(key);
        let result = self
            .store
            .get(&path)
            .await
            .with_context(|| format!("failed to fetch object {key}"))?;
        result
            .bytes()
            .await
            .with_context(|| format!("failed to read object body for {key}"))
    }

    pub async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = ObjectPath::from(key);
        let url = self
            .store
            .signed_url(reqwest::Method::GET, &path, ttl)
            .await
            .with_context(|| format!("failed to presign object {key}"))?;
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_upload_keys_are_stable() {
        let id = Uuid::nil();
        assert_eq!(
            ObjectStorage::raw_upload_key(id, "argo_profile.nc"),
            "raw-uploads/00000000-0000-0000-0000-000000000000/argo_profile.nc"
        );
    }
}
