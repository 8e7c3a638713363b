//! Positional error container for batched operations.
//!
//! Every batched call reports one slot per input item, `None` for success.
//! A container with no populated slot is equivalent to no error at all, so
//! callers fold it through [`MultiError::into_result`].

use std::fmt;
use std::ops::{Index, Range};

use crate::{LockstepError, LockstepResult};

/// One optional error per input position, in input order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiError {
    slots: Vec<Option<LockstepError>>,
}

impl MultiError {
    /// Create a container of `len` empty (successful) slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    /// Wrap an already positional slot vector.
    pub fn from_slots(slots: Vec<Option<LockstepError>>) -> Self {
        Self { slots }
    }

    /// A container where every position carries the same error.
    pub fn repeat(err: &LockstepError, len: usize) -> Self {
        Self {
            slots: vec![Some(err.clone()); len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set(&mut self, index: usize, err: LockstepError) {
        self.slots[index] = Some(err);
    }

    pub fn get(&self, index: usize) -> Option<&LockstepError> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    /// Number of populated slots.
    pub fn error_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn has_errors(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_some())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Option<LockstepError>> {
        self.slots.iter()
    }

    /// Copy `other` into the slot range starting at `range.start`.
    pub fn copy_into(&mut self, range: Range<usize>, other: &MultiError) {
        self.slots[range].clone_from_slice(&other.slots);
    }

    /// Fill every slot in `range` with `err`.
    pub fn fill(&mut self, range: Range<usize>, err: &LockstepError) {
        for slot in &mut self.slots[range] {
            *slot = Some(err.clone());
        }
    }

    pub fn into_slots(self) -> Vec<Option<LockstepError>> {
        self.slots
    }

    /// `Ok(())` when every slot is empty, otherwise the container itself.
    pub fn into_result(self) -> LockstepResult<()> {
        if self.has_errors() {
            Err(LockstepError::Multi(self))
        } else {
            Ok(())
        }
    }
}

impl Index<usize> for MultiError {
    type Output = Option<LockstepError>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.slots[index]
    }
}

impl<'a> IntoIterator for &'a MultiError {
    type Item = &'a Option<LockstepError>;
    type IntoIter = std::slice::Iter<'a, Option<LockstepError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

impl FromIterator<Option<LockstepError>> for MultiError {
    fn from_iter<I: IntoIterator<Item = Option<LockstepError>>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.slots.iter().flatten().next();
        match (self.error_count(), first) {
            (0, _) | (_, None) => write!(f, "no errors in {} operations", self.len()),
            (1, Some(err)) => write!(f, "{}", err),
            (n, Some(err)) => write!(f, "{} (and {} other errors)", err, n - 1),
        }
    }
}

impl std::error::Error for MultiError {}
