//! Custom resources spoken by KDMP

mod backup_location;
mod data_export;
mod types;
mod volume_backup;

pub use backup_location::{
    AzureConfig, BackupLocation, BackupLocationItem, BackupLocationType, GoogleConfig, S3Config,
};
pub use data_export::{
    DataExport, DataExportSpec, DataExportStage, DataExportStatus, DataExportType, StageStatus,
};
pub use types::{Reference, ReferenceKind};
pub use volume_backup::{VolumeBackup, VolumeBackupSpec, VolumeBackupStatus};
