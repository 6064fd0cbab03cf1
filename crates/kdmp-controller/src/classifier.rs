//! Request classification
//!
//! Maps the engine type and the kinds of the source and destination
//! references onto a transfer driver.

use kdmp_common::crd::{DataExportSpec, DataExportType, ReferenceKind};
use kdmp_drivers::DriverName;

use crate::Error;

/// What a DataExport asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub driver: DriverName,
    /// Snapshot the source before transferring
    pub with_snapshot: bool,
}

/// Pick the driver for a request.
///
/// rsync copies PVC to PVC. restic and kopia back a PVC up into a
/// BackupLocation, or restore a VolumeBackup into a PVC.
pub fn classify(spec: &DataExportSpec) -> Result<Classification, Error> {
    let source = spec.source.kind();
    let destination = spec.destination.kind();

    let driver = match spec.type_ {
        DataExportType::Rsync => match (&source, &destination) {
            (ReferenceKind::PersistentVolumeClaim, ReferenceKind::PersistentVolumeClaim) => {
                DriverName::Rsync
            }
            _ => return Err(unsupported(spec, &source, &destination)),
        },
        DataExportType::Restic => engine_driver(
            spec,
            &source,
            &destination,
            DriverName::ResticBackup,
            DriverName::ResticRestore,
        )?,
        DataExportType::Kopia => engine_driver(
            spec,
            &source,
            &destination,
            DriverName::KopiaBackup,
            DriverName::KopiaRestore,
        )?,
    };

    let with_snapshot = spec.snapshot_class().is_some();
    if with_snapshot && source != ReferenceKind::PersistentVolumeClaim {
        return Err(Error::validation(format!(
            "snapshot storage class {} requires a PersistentVolumeClaim source",
            spec.snapshot_class().unwrap_or_default()
        )));
    }

    Ok(Classification {
        driver,
        with_snapshot,
    })
}

fn engine_driver(
    spec: &DataExportSpec,
    source: &ReferenceKind,
    destination: &ReferenceKind,
    backup: DriverName,
    restore: DriverName,
) -> Result<DriverName, Error> {
    match (source, destination) {
        (ReferenceKind::PersistentVolumeClaim, ReferenceKind::BackupLocation) => Ok(backup),
        (ReferenceKind::VolumeBackup, ReferenceKind::PersistentVolumeClaim) => Ok(restore),
        _ => Err(unsupported(spec, source, destination)),
    }
}

fn unsupported(spec: &DataExportSpec, source: &ReferenceKind, destination: &ReferenceKind) -> Error {
    Error::validation(format!(
        "{} does not support {} to {}",
        spec.type_,
        kind_name(source),
        kind_name(destination)
    ))
}

fn kind_name(kind: &ReferenceKind) -> &str {
    match kind {
        ReferenceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
        ReferenceKind::BackupLocation => "BackupLocation",
        ReferenceKind::VolumeBackup => "VolumeBackup",
        ReferenceKind::Unsupported(gvk) => gvk,
    }
}
