//! Driver lookup by name

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::kopia::{KopiaBackup, KopiaDelete, KopiaMaintenance, KopiaRestore};
use crate::restic::{ResticBackup, ResticRestore};
use crate::rsync::Rsync;
use crate::{DriverContext, DriverError, DriverName, TransferDriver};

/// Drivers available to the reconciler, built once at startup
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<DriverName, Arc<dyn TransferDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every driver KDMP ships, sharing one context
    pub fn with_defaults(ctx: DriverContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Rsync::new(ctx.clone())));
        registry.register(Arc::new(ResticBackup::new(ctx.clone())));
        registry.register(Arc::new(ResticRestore::new(ctx.clone())));
        registry.register(Arc::new(KopiaBackup::new(ctx.clone())));
        registry.register(Arc::new(KopiaRestore::new(ctx.clone())));
        registry.register(Arc::new(KopiaDelete::new(ctx.clone())));
        registry.register(Arc::new(KopiaMaintenance::new(ctx)));
        registry
    }

    /// Add or replace the driver registered under its name
    pub fn register(&mut self, driver: Arc<dyn TransferDriver>) {
        self.drivers.insert(driver.name(), driver);
    }

    pub fn get(&self, name: DriverName) -> Result<Arc<dyn TransferDriver>, DriverError> {
        self.drivers
            .get(&name)
            .cloned()
            .ok_or_else(|| DriverError::NotRegistered(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = DriverName> + '_ {
        self.drivers.keys().copied()
    }
}
