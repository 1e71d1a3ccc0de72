//! Presigned PUT URLs for direct client uploads to S3.

use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region},
    presigning::PresigningConfig,
};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::S3UploadConfig;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Signed upload target handed to the client
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUpload {
    pub url: String,
    pub object_key: String,
}

pub struct ObjectUploads {
    client: Client,
    config: S3UploadConfig,
}

impl ObjectUploads {
    pub fn new(config: S3UploadConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "medease-config",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn expires_in_seconds(&self) -> u64 {
        self.config.expires_in_seconds
    }

    /// Sign a PUT of `object_key`. Signing is local, no request reaches S3.
    pub async fn presign_put(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> anyhow::Result<PresignedUpload> {
        let presigning =
            PresigningConfig::expires_in(Duration::from_secs(self.config.expires_in_seconds))?;
        let request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(object_key)
            .content_type(content_type)
            .presigned(presigning)
            .await?;
        debug!(object_key = %object_key, "Presigned upload URL");
        Ok(PresignedUpload {
            url: request.uri().to_string(),
            object_key: object_key.to_string(),
        })
    }
}

/// `uploads/<user>/<uuid>-<name>`; characters outside `[A-Za-z0-9._-]` become `_`
pub fn object_key_for(user_id: &str, file_name: &str) -> String {
    let name: String = file_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("uploads/{}/{}-{}", user_id, Uuid::new_v4(), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> S3UploadConfig {
        S3UploadConfig {
            bucket: "medease-test-bucket".into(),
            region: "eu-west-2".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            expires_in_seconds: 900,
        }
    }

    #[test]
    fn object_keys_are_scoped_and_sanitized() {
        let key = object_key_for("u1", " lab results (May).pdf ");
        assert!(key.starts_with("uploads/u1/"));
        assert!(key.ends_with("-lab_results__May_.pdf"));
        assert_ne!(key, object_key_for("u1", "lab results (May).pdf"));
    }

    #[tokio::test]
    async fn presigned_put_is_signed_for_bucket_and_expiry() {
        let uploads = ObjectUploads::new(test_config());
        let upload = uploads
            .presign_put("uploads/u1/scan.pdf", "application/pdf")
            .await
            .unwrap();

        assert_eq!(upload.object_key, "uploads/u1/scan.pdf");
        assert!(upload.url.starts_with("https://"));
        assert!(upload.url.contains("medease-test-bucket"));
        assert!(upload.url.contains("uploads/u1/scan.pdf"));
        assert!(upload.url.contains("X-Amz-Expires=900"));
        assert!(upload.url.contains("X-Amz-Credential=AKIDEXAMPLE"));
        assert!(upload.url.contains("X-Amz-Signature="));
        assert!(upload.url.contains("content-type"));
    }
}
