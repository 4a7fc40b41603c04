//! Object store construction for local paths and S3 URIs.
//!
//! Both the training source and the checkpoint are single named objects. A
//! URI is split into a store rooted at the object's parent and the object's
//! path inside that store.

use crate::config::CredentialsConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    let (bucket, key) = without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))?;
    if bucket.is_empty() || key.is_empty() {
        anyhow::bail!("Invalid S3 URI: empty bucket or key in '{}'", uri);
    }
    Ok((bucket, key))
}

/// Where a named object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A file on the local filesystem
    Local(PathBuf),
    /// An object in an S3 bucket
    S3 { bucket: String, key: String },
}

/// Classify a URI as a local path (`file://` or bare) or an S3 object.
pub fn parse_location(uri: &str) -> Result<StoreLocation> {
    if uri.starts_with("s3://") {
        let (bucket, key) = parse_s3_uri(uri)?;
        return Ok(StoreLocation::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        if scheme != "file" {
            anyhow::bail!("Unsupported URI scheme '{}' in '{}'", scheme, uri);
        }
    }
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    if path.is_empty() {
        anyhow::bail!("Empty path in URI '{}'", uri);
    }
    Ok(StoreLocation::Local(PathBuf::from(path)))
}

/// Client options for a handful of large sequential transfers.
fn create_client_options(allow_http: bool) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Checkpoints and source tables can be large; allow long transfers
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(16)
        .with_allow_http(allow_http)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// Create an S3 client for `bucket`.
///
/// Anything not set in `credentials` is taken from the AWS environment
/// (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`, ...) and,
/// failing that, the instance profile.
pub fn create_s3_store(
    bucket: &str,
    credentials: Option<&CredentialsConfig>,
) -> Result<Arc<dyn ObjectStore>> {
    let creds = credentials.cloned().unwrap_or_default();
    tracing::info!(
        "Creating {} S3 client for bucket: {}",
        if creds.anonymous { "anonymous" } else { "authenticated" },
        bucket
    );

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(creds.allow_http))
        .with_retry(create_retry_config());

    if let Some(key) = &creds.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &creds.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }
    if let Some(token) = &creds.session_token {
        builder = builder.with_token(token);
    }
    if let Some(region) = &creds.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &creds.endpoint_url {
        // Custom endpoints (MinIO, LocalStack) generally need path-style requests
        builder = builder
            .with_endpoint(endpoint)
            .with_virtual_hosted_style_request(false);
    }
    if creds.anonymous {
        builder = builder.with_skip_signature(true);
    }

    Ok(Arc::new(builder.build()?))
}

/// Open the store holding the object named by `uri`.
///
/// Local stores are rooted at the file's parent directory, which is created
/// if missing.
pub fn open_object(
    uri: &str,
    credentials: Option<&CredentialsConfig>,
) -> Result<(Arc<dyn ObjectStore>, ObjectPath)> {
    match parse_location(uri)? {
        StoreLocation::Local(path) => {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("'{}' does not name a file", uri))?
                .to_string();
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !parent.exists() {
                std::fs::create_dir_all(&parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            tracing::debug!("Creating LocalFileSystem store at: {}", parent.display());
            let store = LocalFileSystem::new_with_prefix(&parent)?;
            Ok((Arc::new(store), ObjectPath::from(file_name)))
        }
        StoreLocation::S3 { bucket, key } => {
            let store = create_s3_store(&bucket, credentials)?;
            Ok((store, ObjectPath::from(key)))
        }
    }
}
