//! Generational arena backing the liaison graph.
//!
//! Provides `UnitId` and `AttachmentId` (dense, total-orderable identifiers)
//! and `Arena` (contiguous storage with free-list reuse). Every slot carries a
//! generation counter, so an id handed out before a removal never resolves to
//! the value that later reuses its slot.
//!
//! # Determinism
//! - Id ordering is by slot index, then generation.
//! - Iteration order over live slots is by index (0..capacity).
//! - Free-list reuse is LIFO; the same sequence of allocations and
//!   deallocations always yields the same ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Key type that can address an [`Arena`] slot.
pub trait ArenaKey: Copy + Eq + Hash + Ord + fmt::Debug {
    /// Builds a key from a slot index and the slot's current generation.
    fn from_parts(index: u32, generation: u32) -> Self;
    /// Slot index.
    fn index(&self) -> u32;
    /// Generation the key was issued for.
    fn generation(&self) -> u32;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl $name {
            /// Creates an id from raw parts.
            ///
            /// Ids are normally issued by the owning graph; a hand-built id
            /// only resolves if its generation matches the live slot.
            #[inline]
            pub const fn new(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }
        }

        impl ArenaKey for $name {
            #[inline]
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            #[inline]
            fn index(&self) -> u32 {
                self.index
            }

            #[inline]
            fn generation(&self) -> u32 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.generation == 0 {
                    write!(f, "{}({})", stringify!($name), self.index)
                } else {
                    write!(f, "{}({}@{})", stringify!($name), self.index, self.generation)
                }
            }
        }
    };
}

arena_key!(
    /// Identifier of a placed unit.
    UnitId
);

arena_key!(
    /// Identifier of a realised attachment between two edge slots.
    AttachmentId
);

#[derive(Debug, Clone)]
struct Slot<T> {
    data: Option<T>,
    generation: u32,
    next_free: Option<u32>,
}

/// Contiguous storage with free-list reuse and generation-checked keys.
#[derive(Debug, Clone)]
pub struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free_list_head: Option<u32>,
    /// Number of live values (slots with `data.is_some()`).
    live_count: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    /// Creates a new empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list_head: None,
            live_count: 0,
            _key: PhantomData,
        }
    }

    /// Stores `data` and returns its key.
    ///
    /// If a free slot is available it is reused (most recently freed first)
    /// under its bumped generation; otherwise a new slot is pushed.
    pub fn allocate(&mut self, data: T) -> K {
        self.live_count += 1;
        if let Some(idx) = self.free_list_head {
            let slot = &mut self.slots[idx as usize];
            debug_assert!(slot.data.is_none(), "free slot should have no data");
            self.free_list_head = slot.next_free;
            slot.data = Some(data);
            slot.next_free = None;
            K::from_parts(idx, slot.generation)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                data: Some(data),
                generation: 0,
                next_free: None,
            });
            K::from_parts(idx, 0)
        }
    }

    /// Removes the value addressed by `key` and returns it.
    ///
    /// Returns `None` when the key is stale or was never issued.
    pub fn deallocate(&mut self, key: K) -> Option<T> {
        let idx = key.index();
        let slot = self.slots.get_mut(idx as usize)?;
        if slot.generation != key.generation() {
            return None;
        }
        let data = slot.data.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_list_head;
        self.free_list_head = Some(idx);
        self.live_count -= 1;
        Some(data)
    }

    /// Returns a reference to the value at `key`, if live.
    pub fn get(&self, key: K) -> Option<&T> {
        self.slots
            .get(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.data.as_ref())
    }

    /// Returns a mutable reference to the value at `key`, if live.
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slots
            .get_mut(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.data.as_mut())
    }

    /// Returns `true` if `key` addresses a live value.
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live values.
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Total number of slots, including free ones.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.data
                .as_ref()
                .map(|data| (K::from_parts(idx as u32, slot.generation), data))
        })
    }

    /// Iterates over live values mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(idx, slot)| {
            let generation = slot.generation;
            slot.data
                .as_mut()
                .map(|data| (K::from_parts(idx as u32, generation), data))
        })
    }

    /// Keys of all live values in slot order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(key, _)| key)
    }
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
