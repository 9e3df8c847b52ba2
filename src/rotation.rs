//! Rotating Slot Sets
//!
//! Resources reused every cycle (command lists, uniform buffers, readback
//! targets) must not be written while the GPU may still read them. Rotating
//! between several instances keeps the "read" slot and the "write" slot
//! apart.
//!
//! - [`DoubleBuffered`]: classic front/back pair.
//! - [`RotatingSlots`]: N-slot ring with a depletion callback that fires once
//!   every slot has been both front and back.
//!
//! # Ring Rotation (N = 3)
//!
//! ```text
//!   start     front=A  back=B  spare=[C]
//!   swap #1   front=B  back=C  spare=[A]
//!   swap #2   front=C  back=A  spare=[B]
//!   swap #3   front=A  back=B  spare=[C]   → depletion callback, countdown = 3
//! ```
//!
//! Both types guard reads and rotation with one mutex per instance. The
//! guards returned by `front()`/`back()` hold it, so calling `swap()` while
//! holding one on the same thread deadlocks.
//!
//! The depletion callback runs with no lock held. It may swap the ring or
//! replace itself through [`RotatingSlots::set_depletion_callback`]; a
//! depletion reached while the callback is already running is not reported
//! to it a second time.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::errors::{Error, Result};

// ─── Two-slot ─────────────────────────────────────────────────────────────────

struct Pair<T> {
    slots: [T; 2],
    front: usize,
}

/// A front (read) / back (write) pair.
pub struct DoubleBuffered<T> {
    pair: Mutex<Pair<T>>,
}

impl<T> DoubleBuffered<T> {
    #[must_use]
    pub fn new(front: T, back: T) -> Self {
        Self {
            pair: Mutex::new(Pair {
                slots: [front, back],
                front: 0,
            }),
        }
    }

    /// Builds both slots with `factory`; the first call becomes the front.
    pub fn from_factory(mut factory: impl FnMut() -> T) -> Self {
        let front = factory();
        let back = factory();
        Self::new(front, back)
    }

    /// Locks the pair and returns the read slot.
    pub fn front(&self) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.pair.lock(), |pair| &mut pair.slots[pair.front])
    }

    /// Locks the pair and returns the write slot.
    pub fn back(&self) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.pair.lock(), |pair| &mut pair.slots[1 - pair.front])
    }

    /// Runs `f` on the back slot, then swaps, under a single lock.
    pub fn write_and_swap<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut pair = self.pair.lock();
        let back = 1 - pair.front;
        let result = f(&mut pair.slots[back]);
        pair.front = back;
        result
    }

    /// Exchanges the front and back roles.
    pub fn swap(&self) {
        let mut pair = self.pair.lock();
        pair.front = 1 - pair.front;
    }

    pub fn into_inner(self) -> (T, T) {
        let Pair { slots: [a, b], front } = self.pair.into_inner();
        if front == 0 { (a, b) } else { (b, a) }
    }
}

impl<F: FnMut()> DoubleBuffered<Option<F>> {
    /// Runs the front unit, if any, while holding the lock so a concurrent
    /// `swap` cannot replace it mid-run. Returns whether anything ran.
    pub fn run(&self) -> bool {
        let mut front = self.front();
        match front.as_mut() {
            Some(unit) => {
                unit();
                true
            }
            None => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for DoubleBuffered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pair = self.pair.lock();
        f.debug_struct("DoubleBuffered")
            .field("front", &pair.slots[pair.front])
            .field("back", &pair.slots[1 - pair.front])
            .finish()
    }
}

// ─── N-slot ring ──────────────────────────────────────────────────────────────

struct Ring<T> {
    front: T,
    back: T,
    spare: VecDeque<T>,
    countdown: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn rotate(&mut self) {
        match self.spare.pop_front() {
            Some(next) => {
                let old_back = std::mem::replace(&mut self.back, next);
                let old_front = std::mem::replace(&mut self.front, old_back);
                self.spare.push_back(old_front);
            }
            None => std::mem::swap(&mut self.front, &mut self.back),
        }
    }
}

/// Point-in-time copy of a ring's roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotsSnapshot<T> {
    pub front: T,
    pub back: T,
    pub spare: Vec<T>,
}

type DepletionCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct DepletionSlot {
    callback: Option<DepletionCallback>,
    /// Bumped by every setter so a running callback is not put back over a
    /// replacement installed while it ran.
    generation: u64,
}

impl DepletionSlot {
    fn set(&mut self, callback: Option<DepletionCallback>) {
        self.callback = callback;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// An N-slot ring (N ≥ 2) with a front slot, a back slot and N-2 spares.
pub struct RotatingSlots<T> {
    ring: Mutex<Ring<T>>,
    on_depleted: Mutex<DepletionSlot>,
}

impl<T> RotatingSlots<T> {
    /// Builds a ring from explicit slots; the first is front, the second back.
    pub fn from_slots(slots: impl IntoIterator<Item = T>) -> Result<Self> {
        let mut spare: VecDeque<T> = slots.into_iter().collect();
        let len = spare.len();
        let (Some(front), Some(back)) = (spare.pop_front(), spare.pop_front()) else {
            return Err(Error::InvalidSlotCount(len));
        };
        Ok(Self {
            ring: Mutex::new(Ring {
                front,
                back,
                spare,
                countdown: len,
                len,
            }),
            on_depleted: Mutex::new(DepletionSlot::default()),
        })
    }

    /// Builds `count` slots with `factory`.
    pub fn from_factory(count: usize, factory: impl FnMut() -> T) -> Result<Self> {
        if count < 2 {
            return Err(Error::InvalidSlotCount(count));
        }
        Self::from_slots(std::iter::repeat_with(factory).take(count))
    }

    /// Sets the callback fired after every full rotation.
    #[must_use]
    pub fn with_depletion_callback(self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_depleted.lock().set(Some(Box::new(callback)));
        self
    }

    /// Replaces (or clears) the depletion callback. Safe to call from inside
    /// the callback itself.
    pub fn set_depletion_callback(&self, callback: Option<DepletionCallback>) {
        self.on_depleted.lock().set(callback);
    }

    /// Locks the ring and returns the read slot.
    pub fn front(&self) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.ring.lock(), |ring| &mut ring.front)
    }

    /// Locks the ring and returns the write slot.
    pub fn back(&self) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.ring.lock(), |ring| &mut ring.back)
    }

    /// Rotates roles: old front joins the spare tail, back becomes front,
    /// the spare head becomes back.
    ///
    /// Returns `true` when this swap completed a full rotation and fired the
    /// depletion callback.
    pub fn swap(&self) -> bool {
        let depleted = {
            let mut ring = self.ring.lock();
            ring.rotate();
            ring.countdown -= 1;
            if ring.countdown == 0 {
                ring.countdown = ring.len;
                true
            } else {
                false
            }
        };

        if depleted {
            self.fire_depleted();
        }
        depleted
    }

    /// Runs the callback with neither lock held, then puts it back unless a
    /// setter ran in the meantime.
    fn fire_depleted(&self) {
        let (mut callback, generation) = {
            let mut slot = self.on_depleted.lock();
            match slot.callback.take() {
                Some(callback) => (callback, slot.generation),
                None => return,
            }
        };

        callback();

        let mut slot = self.on_depleted.lock();
        if slot.generation == generation {
            slot.callback = Some(callback);
        }
    }

    /// Swaps remaining before the next depletion, in `1..=len`.
    #[must_use]
    pub fn countdown(&self) -> usize {
        self.ring.lock().countdown
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// Always `false`; a ring holds at least two slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Copies the current roles.
    #[must_use]
    pub fn snapshot(&self) -> SlotsSnapshot<T>
    where
        T: Clone,
    {
        let ring = self.ring.lock();
        SlotsSnapshot {
            front: ring.front.clone(),
            back: ring.back.clone(),
            spare: ring.spare.iter().cloned().collect(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RotatingSlots<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("RotatingSlots")
            .field("front", &ring.front)
            .field("back", &ring.back)
            .field("spare", &ring.spare)
            .field("countdown", &ring.countdown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_slot_ring_swaps_roles() {
        let ring = RotatingSlots::from_slots(['a', 'b']).unwrap();
        assert!(!ring.swap());
        assert_eq!(*ring.front(), 'b');
        assert_eq!(*ring.back(), 'a');
        assert!(ring.swap());
        assert_eq!(*ring.front(), 'a');
    }

    #[test]
    fn test_into_inner_respects_roles() {
        let pair = DoubleBuffered::new(1, 2);
        pair.swap();
        assert_eq!(pair.into_inner(), (2, 1));
    }
}
