//! Swapping the live parameters for another copy (the Lookahead slow weights)
//! around an evaluation pass, without losing the fast-weight trajectory.

use std::ops::Deref;

use log::{debug, error};

use crate::{
    error::{OptimError, Result},
    optimization::Optimizer,
    storage::{Parameter, ParameterStore, check_layout},
};

/// A full copy of the live (fast) parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    params: Vec<Parameter>,
}

impl Backup {
    /// Copies every live value of `store`.
    pub fn capture(store: &ParameterStore) -> Self {
        Self {
            params: store.snapshot(),
        }
    }

    /// Writes the backed up values back into `store`.
    ///
    /// # Returns
    /// An error if the layout of `store` changed since the capture, in which case
    /// nothing is written.
    pub fn restore_into(&self, store: &mut ParameterStore) -> Result<()> {
        store.load_from(&self.params)
    }
}

/// The snapshot/restore protocol around an evaluation pass.
///
/// At most one backup is outstanding at a time.
#[derive(Debug, Default)]
pub struct CheckpointSwap {
    backup: Option<Backup>,
}

impl CheckpointSwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a snapshot was taken and not restored yet.
    pub fn is_outstanding(&self) -> bool {
        self.backup.is_some()
    }

    /// Backs up the live values of `store` and overwrites them with `replacement`.
    ///
    /// # Arguments
    /// * `store` - The live parameters.
    /// * `replacement` - The values to load, with the same layout as `store`.
    ///
    /// # Returns
    /// A `DuplicateSnapshot` if a backup is already outstanding, or a layout error if
    /// `replacement` doesn't match `store`. On error `store` is untouched.
    pub fn snapshot_and_load(
        &mut self,
        store: &mut ParameterStore,
        replacement: &[Parameter],
    ) -> Result<()> {
        if self.is_outstanding() {
            return Err(OptimError::DuplicateSnapshot);
        }

        check_layout(store.entries(), replacement)?;

        let backup = Backup::capture(store);
        store.load_from(replacement)?;
        self.backup = Some(backup);

        debug!(params = store.len(); "live parameters swapped out");
        Ok(())
    }

    /// Restores the backed up values into `store` and discards the backup.
    ///
    /// # Returns
    /// An `UnpairedRestore` if there's no outstanding backup. If the restore fails the
    /// backup is kept so the caller can retry.
    pub fn restore_from_backup(&mut self, store: &mut ParameterStore) -> Result<()> {
        let backup = self.backup.as_ref().ok_or(OptimError::UnpairedRestore)?;
        backup.restore_into(store)?;
        self.backup = None;

        debug!(params = store.len(); "live parameters restored");
        Ok(())
    }
}

/// Keeps the evaluation weights loaded for as long as it lives.
///
/// Created through `EvalGuard::begin`, it dereferences to the store holding the
/// evaluation weights. Dropping it, including during unwinding, puts the fast
/// weights back.
pub struct EvalGuard<'a, O: Optimizer + ?Sized> {
    optimizer: &'a mut O,
    store: &'a mut ParameterStore,
    released: bool,
}

impl<'a, O: Optimizer + ?Sized> EvalGuard<'a, O> {
    /// Loads the evaluation weights of `optimizer` into `store`.
    pub fn begin(optimizer: &'a mut O, store: &'a mut ParameterStore) -> Result<Self> {
        optimizer.begin_evaluation(store)?;

        Ok(Self {
            optimizer,
            store,
            released: false,
        })
    }

    /// Restores the fast weights, surfacing any error instead of logging it.
    pub fn finish(mut self) -> Result<()> {
        self.released = true;
        self.optimizer.end_evaluation(self.store)
    }
}

impl<O: Optimizer + ?Sized> Deref for EvalGuard<'_, O> {
    type Target = ParameterStore;

    fn deref(&self) -> &Self::Target {
        &*self.store
    }
}

impl<O: Optimizer + ?Sized> Drop for EvalGuard<'_, O> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(e) = self.optimizer.end_evaluation(self.store) {
            error!("failed to restore the fast weights after evaluation: {e}");
        }
    }
}
