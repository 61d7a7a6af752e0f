// redis-backup-sidecar/src/backup/encrypt.rs
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

pub const ARTIFACT_PREFIX: &str = "dump-";
pub const ARTIFACT_SUFFIX: &str = ".rdb.age";

/// Name of the encrypted artifact for a snapshot taken at `at`, e.g.
/// `dump-2024-05-01T12:00:00Z.rdb.age`. Names sort chronologically.
pub fn artifact_file_name(at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        ARTIFACT_PREFIX,
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ARTIFACT_SUFFIX
    )
}

/// Streams the raw snapshot through an age encryptor into a new
/// timestamped artifact inside `output_dir`.
///
/// The recipient key is parsed before anything touches the disk. If the copy
/// fails half way the partial artifact is removed, so a failed run leaves
/// nothing behind.
///
/// # Arguments
/// * `public_key` - age X25519 recipient (`age1...`).
/// * `snapshot_path` - The raw `dump.rdb` written by the store.
/// * `output_dir` - Directory the artifact is created in.
///
/// # Returns
/// Path to the created artifact.
pub fn encrypt_snapshot(
    public_key: &str,
    snapshot_path: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    let recipient = age::x25519::Recipient::from_str(public_key.trim())
        .map_err(|e| anyhow::anyhow!("Failed to parse recipient public key: {}", e))?;

    let artifact_path = output_dir.join(artifact_file_name(Utc::now()));
    info!(
        source = %snapshot_path.display(),
        artifact = %artifact_path.display(),
        "encrypting snapshot"
    );

    let source = File::open(snapshot_path)
        .with_context(|| format!("Failed to open snapshot file: {}", snapshot_path.display()))?;
    let destination = File::create(&artifact_path).with_context(|| {
        format!("Failed to create artifact file: {}", artifact_path.display())
    })?;

    let written = stream_encrypted(&recipient, BufReader::new(source), BufWriter::new(destination));
    match written {
        Ok(bytes) => {
            info!(bytes, artifact = %artifact_path.display(), "✓ snapshot encrypted");
            Ok(artifact_path)
        }
        Err(err) => {
            if let Err(rm_err) = std::fs::remove_file(&artifact_path) {
                warn!(
                    artifact = %artifact_path.display(),
                    error = %rm_err,
                    "failed to remove partial artifact"
                );
            }
            Err(err.context(format!(
                "Failed to encrypt {} into {}",
                snapshot_path.display(),
                artifact_path.display()
            )))
        }
    }
}

/// Copies `source` into `destination` through the age stream cipher. The
/// destination is flushed and dropped on every path.
fn stream_encrypted<R, W>(
    recipient: &age::x25519::Recipient,
    mut source: R,
    destination: W,
) -> Result<u64>
where
    R: io::Read,
    W: Write,
{
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
            .context("Failed to set up age encryptor")?;
    let mut writer = encryptor
        .wrap_output(destination)
        .context("Failed to write age header")?;

    let bytes = io::copy(&mut source, &mut writer).context("Failed to stream snapshot")?;

    let mut inner = writer.finish().context("Failed to finalize age stream")?;
    inner.flush().context("Failed to flush artifact")?;
    Ok(bytes)
}
