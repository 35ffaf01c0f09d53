//! Upgrades for snapshot bodies written by older format versions.
//!
//! Each step turns a body of version `n` into a body of version `n + 1`.
//! [`MigrationRegistry::migrate`] chains the steps; a gap anywhere in the
//! chain fails the whole upgrade before any step runs.

use std::collections::BTreeMap;

use crate::serialize::DeserializeError;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("no migration path from version {from} to version {to}")]
    NoMigrationPath { from: u32, to: u32 },
    #[error("migration from version {from} to version {to} failed: {reason}")]
    MigrationFailed { from: u32, to: u32, reason: String },
    #[error("deserialization error: {0}")]
    DeserializeError(#[from] DeserializeError),
}

/// One upgrade step over a snapshot body (header excluded).
pub type MigrationFn = fn(&[u8]) -> Result<Vec<u8>, MigrationError>;

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationFn>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step from `from_version` to `from_version + 1`,
    /// replacing any earlier registration.
    pub fn register(&mut self, from_version: u32, step: MigrationFn) {
        self.steps.insert(from_version, step);
    }

    pub fn can_migrate(&self, from: u32, to: u32) -> bool {
        match from.cmp(&to) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Less => (from..to).all(|v| self.steps.contains_key(&v)),
        }
    }

    /// Run every step from `from` up to `to`. Equal versions return the
    /// body unchanged.
    pub fn migrate(&self, body: &[u8], from: u32, to: u32) -> Result<Vec<u8>, MigrationError> {
        if !self.can_migrate(from, to) {
            return Err(MigrationError::NoMigrationPath { from, to });
        }
        let mut current = body.to_vec();
        for version in from..to {
            let step = self
                .steps
                .get(&version)
                .ok_or(MigrationError::NoMigrationPath { from, to })?;
            current = step(&current)?;
            tracing::debug!(from = version, to = version + 1, "snapshot body migrated");
        }
        Ok(current)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}
