//! Extension slot for collaborators
//!
//! Facilities such as call mocking attach typed state to a running test
//! through its context. Each installed extension is reset when the test is
//! torn down, newest first, so nothing it intercepted outlives the test.

use std::any::{Any, TypeId};

/// State a collaborator attaches to a running test
pub trait TestExtension: Any + Send {
    /// Undo everything this extension installed
    fn reset(&mut self);
}

struct Slot {
    type_id: TypeId,
    value: Box<dyn Any + Send>,
    reset: fn(&mut (dyn Any + Send)),
}

#[derive(Default)]
pub struct Extensions {
    slots: Vec<Slot>,
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("installed", &self.slots.len())
            .finish()
    }
}

impl Extensions {
    /// Install `ext`, replacing (and resetting) any extension of the same type
    pub fn insert<T: TestExtension>(&mut self, ext: T) {
        self.remove::<T>();
        self.slots.push(Slot {
            type_id: TypeId::of::<T>(),
            value: Box::new(ext),
            reset: |value| {
                if let Some(ext) = value.downcast_mut::<T>() {
                    ext.reset();
                }
            },
        });
    }

    pub fn get_mut<T: TestExtension>(&mut self) -> Option<&mut T> {
        self.slots
            .iter_mut()
            .find(|slot| slot.type_id == TypeId::of::<T>())
            .and_then(|slot| slot.value.downcast_mut::<T>())
    }

    pub fn contains<T: TestExtension>(&self) -> bool {
        self.slots.iter().any(|slot| slot.type_id == TypeId::of::<T>())
    }

    fn remove<T: TestExtension>(&mut self) {
        if let Some(pos) = self
            .slots
            .iter()
            .position(|slot| slot.type_id == TypeId::of::<T>())
        {
            let mut slot = self.slots.remove(pos);
            (slot.reset)(slot.value.as_mut());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reset and drop every extension, newest first
    pub fn reset_all(&mut self) {
        while let Some(mut slot) = self.slots.pop() {
            (slot.reset)(slot.value.as_mut());
        }
    }
}
