// redis-backup-sidecar/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::S3Config;
use crate::errors::{AppError, Result as AppResult};

/// Part size for multipart uploads. Files up to this size go in one PUT.
pub const MULTIPART_PART_SIZE: u64 = 8 * 1024 * 1024;

/// S3 rejects part numbers above this.
pub const MAX_PARTS: u64 = 10_000;

/// Ships an encrypted artifact to remote storage.
#[async_trait]
pub trait ArchiveUploader: Send + Sync {
    /// Uploads the file and returns where it landed, for logging.
    async fn upload(&self, artifact_path: &Path) -> AppResult<String>;
}

#[async_trait]
impl<T: ArchiveUploader + ?Sized> ArchiveUploader for &T {
    async fn upload(&self, artifact_path: &Path) -> AppResult<String> {
        (**self).upload(artifact_path).await
    }
}

/// Object key for an artifact: the folder prefix joined with its file name.
pub fn object_key(folder_prefix: &str, artifact_path: &Path) -> Result<String> {
    let file_name = artifact_path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Artifact path has no file name: {}", artifact_path.display()))?;

    let prefix = folder_prefix.trim_matches('/');
    if prefix.is_empty() {
        Ok(file_name.to_string())
    } else {
        Ok(format!("{}/{}", prefix, file_name))
    }
}

/// One slice of the artifact sent as a multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: i32,
    pub offset: u64,
    pub length: u64,
}

pub fn needs_multipart(size: u64) -> bool {
    size > MULTIPART_PART_SIZE
}

/// `MULTIPART_PART_SIZE`, grown when the file would otherwise need more
/// than `MAX_PARTS` parts.
pub fn part_size_for(size: u64) -> u64 {
    MULTIPART_PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

/// Splits `size` bytes into consecutive parts numbered from 1.
pub fn plan_parts(size: u64) -> Vec<PartRange> {
    let part_size = part_size_for(size);
    let mut parts = Vec::new();
    let mut offset = 0u64;
    let mut part_number = 1i32;
    while offset < size {
        let length = part_size.min(size - offset);
        parts.push(PartRange {
            part_number,
            offset,
            length,
        });
        offset += length;
        part_number += 1;
    }
    parts
}

/// The multipart calls, kept behind a trait so the part loop and the abort
/// path run without a live bucket.
#[async_trait]
pub(crate) trait MultipartTarget: Sync {
    /// Starts an upload and returns its id.
    async fn start(&self, key: &str) -> Result<String>;

    /// Sends one part and returns its ETag.
    async fn send_part(
        &self,
        key: &str,
        upload_id: &str,
        artifact_path: &Path,
        part: PartRange,
    ) -> Result<String>;

    /// Completes the upload from `(part_number, etag)` pairs and returns the
    /// object location.
    async fn finish(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<String>;

    async fn abort(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Runs a multipart upload, aborting it if any part or the completion fails
/// so no orphaned parts keep accruing storage.
pub(crate) async fn upload_in_parts<T>(
    target: &T,
    artifact_path: &Path,
    key: &str,
    size: u64,
) -> Result<String>
where
    T: MultipartTarget + ?Sized,
{
    let upload_id = target.start(key).await?;

    match send_parts(target, artifact_path, key, &upload_id, size).await {
        Ok(location) => Ok(location),
        Err(err) => {
            if let Err(abort_err) = target.abort(key, &upload_id).await {
                warn!(
                    key,
                    upload_id = %upload_id,
                    error = format!("{:#}", abort_err),
                    "failed to abort multipart upload"
                );
            }
            Err(err)
        }
    }
}

async fn send_parts<T>(
    target: &T,
    artifact_path: &Path,
    key: &str,
    upload_id: &str,
    size: u64,
) -> Result<String>
where
    T: MultipartTarget + ?Sized,
{
    let mut completed = Vec::new();
    for part in plan_parts(size) {
        let e_tag = target.send_part(key, upload_id, artifact_path, part).await?;
        debug!(part_number = part.part_number, length = part.length, "uploaded part");
        completed.push((part.part_number, e_tag));
    }
    target.finish(key, upload_id, completed).await
}

fn sdk_error<E>(err: E) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    anyhow::anyhow!("{}", s3::error::DisplayErrorContext(err))
}

/// Uploads to S3 or an S3-compatible service using the default AWS
/// credential chain.
pub struct S3Uploader {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: String,
}

impl S3Uploader {
    pub async fn new(s3_config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(s3_config.region.clone()));
        if let Some(endpoint) = &s3_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = s3::config::Builder::from(&sdk_config);
        if s3_config.endpoint_url.is_some() {
            // S3-compatible services rarely support virtual-hosted buckets.
            builder = builder.force_path_style(true);
        }

        S3Uploader {
            client: s3::Client::from_conf(builder.build()),
            bucket_name: s3_config.bucket_name.clone(),
            folder_prefix: s3_config.folder_prefix.clone(),
        }
    }

    /// Checks the target bucket with a HEAD request. Failures only warn, since
    /// PutObject may still be allowed when HeadBucket is denied.
    pub async fn check_bucket(&self) {
        match self.client.head_bucket().bucket(&self.bucket_name).send().await {
            Ok(_) => info!(bucket = %self.bucket_name, "✓ target bucket is accessible"),
            Err(e) => warn!(
                bucket = %self.bucket_name,
                error = %s3::error::DisplayErrorContext(e),
                "could not verify target bucket, uploads may fail"
            ),
        }
    }

    fn s3_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, key)
    }

    async fn put_whole(&self, artifact_path: &Path, key: &str) -> Result<String> {
        let body = ByteStream::from_path(artifact_path).await.with_context(|| {
            format!("Failed to create ByteStream from file: {}", artifact_path.display())
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(sdk_error)
            .with_context(|| {
                format!(
                    "Failed to upload {} to {}",
                    artifact_path.display(),
                    self.s3_uri(key)
                )
            })?;

        Ok(self.s3_uri(key))
    }

    async fn upload_file(&self, artifact_path: &Path) -> Result<String> {
        let key = object_key(&self.folder_prefix, artifact_path)?;
        let size = tokio::fs::metadata(artifact_path)
            .await
            .with_context(|| format!("Failed to stat artifact: {}", artifact_path.display()))?
            .len();

        info!(
            artifact = %artifact_path.display(),
            bucket = %self.bucket_name,
            key = %key,
            size,
            "uploading artifact"
        );

        if needs_multipart(size) {
            upload_in_parts(self, artifact_path, &key, size).await
        } else {
            self.put_whole(artifact_path, &key).await
        }
    }
}

#[async_trait]
impl MultipartTarget for S3Uploader {
    async fn start(&self, key: &str) -> Result<String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)
            .with_context(|| format!("Failed to start multipart upload for {}", self.s3_uri(key)))?;

        Ok(created
            .upload_id()
            .context("CreateMultipartUpload returned no upload id")?
            .to_string())
    }

    async fn send_part(
        &self,
        key: &str,
        upload_id: &str,
        artifact_path: &Path,
        part: PartRange,
    ) -> Result<String> {
        let body = ByteStream::read_from()
            .path(artifact_path)
            .offset(part.offset)
            .length(Length::Exact(part.length))
            .build()
            .await
            .with_context(|| {
                format!(
                    "Failed to read part {} of {}",
                    part.part_number,
                    artifact_path.display()
                )
            })?;

        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part.part_number)
            .body(body)
            .send()
            .await
            .map_err(sdk_error)
            .with_context(|| {
                format!("Failed to upload part {} of {}", part.part_number, self.s3_uri(key))
            })?;

        Ok(uploaded.e_tag().unwrap_or_default().to_string())
    }

    async fn finish(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<String> {
        let completed_parts = parts
            .into_iter()
            .map(|(part_number, e_tag)| {
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(e_tag)
                    .build()
            })
            .collect();

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .with_context(|| {
                format!("Failed to complete multipart upload for {}", self.s3_uri(key))
            })?;

        Ok(completed
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| self.s3_uri(key)))
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error)
            .with_context(|| format!("Failed to abort multipart upload for {}", self.s3_uri(key)))?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveUploader for S3Uploader {
    async fn upload(&self, artifact_path: &Path) -> AppResult<String> {
        self.upload_file(artifact_path).await.map_err(AppError::Upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const MIB_8: u64 = MULTIPART_PART_SIZE;

    #[test]
    fn test_object_key_joins_prefix_and_file_name() -> anyhow::Result<()> {
        let artifact = PathBuf::from("/var/backups/dump-2024-05-01T12:00:00Z.rdb.age");
        assert_eq!(
            object_key("redis/prod", &artifact)?,
            "redis/prod/dump-2024-05-01T12:00:00Z.rdb.age"
        );
        assert_eq!(
            object_key("/redis/prod/", &artifact)?,
            "redis/prod/dump-2024-05-01T12:00:00Z.rdb.age"
        );
        Ok(())
    }

    #[test]
    fn test_object_key_without_prefix() -> anyhow::Result<()> {
        let artifact = PathBuf::from("dump-2024-05-01T12:00:00Z.rdb.age");
        assert_eq!(object_key("", &artifact)?, "dump-2024-05-01T12:00:00Z.rdb.age");
        Ok(())
    }

    #[test]
    fn test_object_key_requires_file_name() {
        assert!(object_key("redis", Path::new("/")).is_err());
    }

    #[test]
    fn test_single_put_up_to_one_part() {
        assert!(!needs_multipart(0));
        assert!(!needs_multipart(MIB_8));
        assert!(needs_multipart(MIB_8 + 1));
    }

    #[test]
    fn test_plan_parts_boundaries() {
        assert!(plan_parts(0).is_empty());

        assert_eq!(
            plan_parts(MIB_8),
            vec![PartRange { part_number: 1, offset: 0, length: MIB_8 }]
        );

        assert_eq!(
            plan_parts(MIB_8 + 1),
            vec![
                PartRange { part_number: 1, offset: 0, length: MIB_8 },
                PartRange { part_number: 2, offset: MIB_8, length: 1 },
            ]
        );

        assert_eq!(
            plan_parts(3 * MIB_8 + 5),
            vec![
                PartRange { part_number: 1, offset: 0, length: MIB_8 },
                PartRange { part_number: 2, offset: MIB_8, length: MIB_8 },
                PartRange { part_number: 3, offset: 2 * MIB_8, length: MIB_8 },
                PartRange { part_number: 4, offset: 3 * MIB_8, length: 5 },
            ]
        );
    }

    #[test]
    fn test_part_size_grows_to_stay_under_part_limit() {
        assert_eq!(part_size_for(MAX_PARTS * MIB_8), MIB_8);

        let huge = 100 * 1024 * 1024 * 1024u64;
        assert!(part_size_for(huge) > MIB_8);

        let parts = plan_parts(huge);
        assert!(parts.len() as u64 <= MAX_PARTS);
        let last = parts[parts.len() - 1];
        assert_eq!(last.offset + last.length, huge);
    }

    /// Records multipart calls; can fail a given part or the abort.
    #[derive(Default)]
    struct RecordingTarget {
        calls: Mutex<Vec<String>>,
        fail_part: Option<i32>,
        fail_abort: bool,
    }

    impl RecordingTarget {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MultipartTarget for RecordingTarget {
        async fn start(&self, key: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("start {}", key));
            Ok("upload-1".into())
        }

        async fn send_part(
            &self,
            _key: &str,
            upload_id: &str,
            _artifact_path: &Path,
            part: PartRange,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("part {} {} {}", upload_id, part.part_number, part.length));
            if self.fail_part == Some(part.part_number) {
                anyhow::bail!("connection reset on part {}", part.part_number);
            }
            Ok(format!("etag-{}", part.part_number))
        }

        async fn finish(
            &self,
            key: &str,
            _upload_id: &str,
            parts: Vec<(i32, String)>,
        ) -> Result<String> {
            let tags: Vec<String> = parts.into_iter().map(|(_, tag)| tag).collect();
            self.calls
                .lock()
                .unwrap()
                .push(format!("finish {}", tags.join(",")));
            Ok(format!("https://backups.example/{}", key))
        }

        async fn abort(&self, _key: &str, upload_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("abort {}", upload_id));
            if self.fail_abort {
                anyhow::bail!("abort denied");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_multipart_sends_every_part_then_completes() -> anyhow::Result<()> {
        let target = RecordingTarget::default();

        let location =
            upload_in_parts(&target, Path::new("dump.rdb.age"), "redis/dump.rdb.age", 2 * MIB_8 + 3)
                .await?;

        assert_eq!(location, "https://backups.example/redis/dump.rdb.age");
        assert_eq!(
            target.calls(),
            vec![
                "start redis/dump.rdb.age".to_string(),
                format!("part upload-1 1 {}", MIB_8),
                format!("part upload-1 2 {}", MIB_8),
                "part upload-1 3 3".to_string(),
                "finish etag-1,etag-2,etag-3".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let target = RecordingTarget {
            fail_part: Some(2),
            ..Default::default()
        };

        let err = upload_in_parts(&target, Path::new("a.age"), "a.age", 3 * MIB_8)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("connection reset on part 2"));
        let calls = target.calls();
        assert_eq!(calls.last().map(String::as_str), Some("abort upload-1"));
        assert!(!calls.iter().any(|c| c.starts_with("finish")));
        assert!(!calls.iter().any(|c| c.starts_with("part upload-1 3")));
    }

    #[tokio::test]
    async fn test_abort_failure_keeps_original_error() {
        let target = RecordingTarget {
            fail_part: Some(1),
            fail_abort: true,
            ..Default::default()
        };

        let err = upload_in_parts(&target, Path::new("a.age"), "a.age", MIB_8 + 1)
            .await
            .unwrap_err();

        let chain = format!("{:#}", err);
        assert!(chain.contains("connection reset on part 1"));
        assert!(!chain.contains("abort denied"));
    }
}
