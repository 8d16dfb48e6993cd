//! Static-or-active sub-object slots.

use crate::error::RtError;

/// A context's handle on one of its sub-objects.
///
/// The static variant stands in before init and after free. It rejects use with
/// [`ErrorKind::InvalidState`](exo_svc::error::ErrorKind::InvalidState).
#[derive(Debug)]
pub enum Subsystem<T> {
    Static,
    Active(T),
}

impl<T> Default for Subsystem<T> {
    fn default() -> Self {
        Self::Static
    }
}

impl<T> Subsystem<T> {
    #[inline]
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static)
    }

    /// The active sub-object.
    pub fn get(&self) -> Result<&T, RtError> {
        match self {
            Self::Static => Err(RtError::invalid_state()),
            Self::Active(value) => Ok(value),
        }
    }

    /// Turns the slot back to static, returning the active sub-object if there was one.
    pub fn take(&mut self) -> Option<T> {
        match core::mem::replace(self, Self::Static) {
            Self::Static => None,
            Self::Active(value) => Some(value),
        }
    }

    /// Activates the slot. Fails with `InvalidState` if it is already active.
    pub fn activate(&mut self, value: T) -> Result<&T, RtError> {
        if !self.is_static() {
            return Err(RtError::invalid_state());
        }
        *self = Self::Active(value);
        self.get()
    }
}
