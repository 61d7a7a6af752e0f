mod logic;
pub(crate) mod encrypt;
pub(crate) mod s3_upload;
pub(crate) mod snapshot;

pub use logic::{BackupReport, perform_backup_cycle};
pub use s3_upload::{ArchiveUploader, S3Uploader};

#[cfg(test)]
pub(crate) use logic::tests as cycle_tests;
