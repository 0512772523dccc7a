use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{OptimError, Result},
    initialization::ParamGen,
    storage::ParameterKey,
};

/// A single named parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    key: ParameterKey,
    values: Box<[f32]>,
}

impl Parameter {
    /// Creates a new `Parameter`.
    ///
    /// # Arguments
    /// * `key` - The identity of the parameter.
    /// * `values` - The initial values of the parameter.
    pub fn new(key: ParameterKey, values: Vec<f32>) -> Self {
        Self {
            key,
            values: values.into_boxed_slice(),
        }
    }

    pub fn key(&self) -> &ParameterKey {
        &self.key
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub(crate) fn split_mut(&mut self) -> (&ParameterKey, &mut [f32]) {
        (&self.key, &mut self.values)
    }
}

/// Holds the live parameter vectors being optimized.
///
/// Iteration follows insertion order so that updates are reproducible. The shape
/// of every vector is fixed once inserted; only the update rules mutate values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Parameter>", into = "Vec<Parameter>")]
pub struct ParameterStore {
    entries: Vec<Parameter>,
    index: HashMap<ParameterKey, usize>,
}

impl ParameterStore {
    /// Creates a new empty `ParameterStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a layout, drawing the initial values from a generator.
    ///
    /// # Arguments
    /// * `layout` - The key and length of every parameter, in insertion order.
    /// * `param_gen` - The generator of initial values.
    ///
    /// # Returns
    /// A `ShapeMismatch` if the generator runs out of values before the layout is
    /// filled, or a `DuplicateKey` if a key is repeated.
    pub fn from_param_gen<I, K, P>(layout: I, param_gen: &mut P) -> Result<Self>
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<ParameterKey>,
        P: ParamGen + ?Sized,
    {
        let mut store = Self::new();

        for (key, len) in layout {
            let key = key.into();
            let values = param_gen.sample(len).unwrap_or_default();

            if values.len() != len {
                return Err(OptimError::shape(&key, "initial values", values.len(), len));
            }

            store.insert(key, values)?;
        }

        Ok(store)
    }

    /// Inserts a new parameter vector.
    ///
    /// # Arguments
    /// * `key` - The identity of the parameter, must not be present yet.
    /// * `values` - The initial values.
    ///
    /// # Returns
    /// A `DuplicateKey` error if `key` is already in the store.
    pub fn insert(&mut self, key: impl Into<ParameterKey>, values: Vec<f32>) -> Result<()> {
        let key = key.into();

        if self.index.contains_key(&key) {
            return Err(OptimError::DuplicateKey(key));
        }

        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(Parameter::new(key, values));
        Ok(())
    }

    /// Returns the amount of parameter vectors in the store.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the total amount of scalar values across every vector.
    pub fn numel(&self) -> usize {
        self.entries.iter().map(|p| p.values.len()).sum()
    }

    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the values of the parameter identified by `key`.
    pub fn get(&self, key: &ParameterKey) -> Option<&[f32]> {
        self.index.get(key).map(|&i| self.entries[i].values())
    }

    /// Iterates the keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &ParameterKey> {
        self.entries.iter().map(Parameter::key)
    }

    /// Iterates the parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ParameterKey, &[f32])> {
        self.entries.iter().map(|p| (p.key(), p.values()))
    }

    pub(crate) fn entries(&self) -> &[Parameter] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [Parameter] {
        &mut self.entries
    }

    /// Copies the live values of every parameter.
    pub(crate) fn snapshot(&self) -> Vec<Parameter> {
        self.entries.clone()
    }

    /// Overwrites every live value with the contents of `src`.
    ///
    /// The whole layout of `src` is checked before anything is written, so on error
    /// the store is left untouched.
    ///
    /// # Arguments
    /// * `src` - A copy of the parameters with the same keys, order and shapes.
    pub(crate) fn load_from(&mut self, src: &[Parameter]) -> Result<()> {
        check_layout(&self.entries, src)?;

        self.entries
            .par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(dst, src)| dst.values.copy_from_slice(&src.values));

        Ok(())
    }
}

/// Checks that `other` has the same keys, order and shapes as `live`.
pub(crate) fn check_layout(live: &[Parameter], other: &[Parameter]) -> Result<()> {
    if live.len() != other.len() {
        return Err(OptimError::ParameterSetMismatch {
            got: other.len(),
            expected: live.len(),
        });
    }

    for (p, o) in live.iter().zip(other) {
        if p.key != o.key {
            return Err(OptimError::UnknownKey(o.key.clone()));
        }

        if p.values.len() != o.values.len() {
            return Err(OptimError::shape(
                &p.key,
                "stored copy",
                o.values.len(),
                p.values.len(),
            ));
        }
    }

    Ok(())
}

impl TryFrom<Vec<Parameter>> for ParameterStore {
    type Error = OptimError;

    fn try_from(entries: Vec<Parameter>) -> Result<Self> {
        let mut store = Self::new();

        for Parameter { key, values } in entries {
            store.insert(key, values.into_vec())?;
        }

        Ok(store)
    }
}

impl From<ParameterStore> for Vec<Parameter> {
    fn from(store: ParameterStore) -> Self {
        store.entries
    }
}
