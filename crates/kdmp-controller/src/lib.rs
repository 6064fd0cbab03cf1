//! DataExport reconciler
//!
//! Walks each DataExport through its stages, composing the transfer drivers
//! from `kdmp-drivers` with the snapshot backends from `kdmp-snapshot`:
//!
//! - **Classifier**: maps a request to a transfer driver
//! - **Validation**: checks the referenced claims before anything is created
//! - **Stages**: one handler per stage, each returning a [`stages::StageOutcome`]
//! - **Controller**: reconcile loop, finalizer cleanup and error policy

pub mod classifier;
pub mod controller;
pub mod error;
pub mod stages;
pub mod validation;

#[cfg(test)]
mod testing;

pub use classifier::{classify, Classification};
pub use controller::{
    cleanup, error_policy, reconcile, ExportContext, ExportKubeClient, ExportKubeClientImpl,
    CLEANUP_FINALIZER,
};
pub use error::{Error, ReasonKind};
