//! Generation-checked slot map used for every handle that crosses the
//! host/interpreter boundary.
//!
//! A handle is an index into an owned arena plus the generation the slot had
//! when the value was inserted. Removing a value bumps the slot's generation,
//! so a handle that outlives its value can never resolve to whatever gets
//! stored in the slot next.

use std::fmt;
use std::marker::PhantomData;

/// Index + generation pair backing every typed handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

impl RawHandle {
    /// Pack into the plain integer exchanged with the host.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Typed key for a [`SlotMap`].
pub trait SlotKey: Copy {
    fn from_raw(raw: RawHandle) -> Self;
    fn raw(self) -> RawHandle;
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(RawHandle);

        impl $name {
            /// Integer form used on the wire.
            pub fn as_u64(self) -> u64 {
                self.0.to_bits()
            }

            pub fn from_u64(bits: u64) -> Self {
                Self(RawHandle::from_bits(bits))
            }
        }

        impl SlotKey for $name {
            fn from_raw(raw: RawHandle) -> Self {
                Self(raw)
            }

            fn raw(self) -> RawHandle {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_u64())
            }
        }
    };
}

handle_type!(
    /// Identifies an entry in the foreign function table.
    ForeignHandle
);

handle_type!(
    /// Identifies a submitted promise until it is retired.
    PromiseId
);

/// Identifies the single in-flight foreign call.
///
/// Frames are never stored in a table (at most one is live), so a monotonic
/// counter is enough to make every frame id unique for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameHandle(u64);

impl FrameHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generation-checked keys.
pub struct SlotMap<K: SlotKey, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: SlotKey, T> SlotMap<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return K::from_raw(RawHandle {
                index,
                generation: slot.generation,
            });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        K::from_raw(RawHandle {
            index,
            generation: 1,
        })
    }

    fn slot(&self, key: K) -> Option<&Slot<T>> {
        let raw = key.raw();
        self.slots
            .get(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.slot(key).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let raw = key.raw();
        self.slots
            .get_mut(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let raw = key.raw();
        let slot = self.slots.get_mut(raw.index as usize)?;
        if slot.generation != raw.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(raw.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    K::from_raw(RawHandle {
                        index: index as u32,
                        generation: slot.generation,
                    }),
                    value,
                )
            })
        })
    }

    /// Remove every live value, invalidating all outstanding keys.
    pub fn drain(&mut self) -> Vec<(K, T)> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                drained.push((
                    K::from_raw(RawHandle {
                        index: index as u32,
                        generation: slot.generation,
                    }),
                    value,
                ));
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        drained
    }
}

impl<K: SlotKey, T> Default for SlotMap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut map: SlotMap<ForeignHandle, &str> = SlotMap::new();
        let a = map.insert("a");
        let b = map.insert("b");

        assert_ne!(a, b);
        assert_eq!(map.get(a), Some(&"a"));
        assert_eq!(map.get(b), Some(&"b"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut map: SlotMap<ForeignHandle, u32> = SlotMap::new();
        let first = map.insert(1);
        assert_eq!(map.remove(first), Some(1));

        let second = map.insert(2);
        // Same slot, new generation.
        assert_eq!(first.raw().index(), second.raw().index());
        assert_ne!(first, second);

        assert_eq!(map.get(first), None);
        assert_eq!(map.remove(first), None);
        assert_eq!(map.get(second), Some(&2));
    }

    #[test]
    fn test_remove_twice() {
        let mut map: SlotMap<PromiseId, u32> = SlotMap::new();
        let key = map.insert(7);
        assert_eq!(map.remove(key), Some(7));
        assert_eq!(map.remove(key), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_wire_round_trip() {
        let mut map: SlotMap<PromiseId, ()> = SlotMap::new();
        map.insert(());
        let key = map.insert(());
        let bits = key.as_u64();
        assert_eq!(PromiseId::from_u64(bits), key);
        assert!(map.contains(PromiseId::from_u64(bits)));
    }

    #[test]
    fn test_drain_invalidates_keys() {
        let mut map: SlotMap<ForeignHandle, &str> = SlotMap::new();
        let a = map.insert("a");
        let b = map.insert("b");

        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
        assert!(!map.contains(a));
        assert!(!map.contains(b));

        let c = map.insert("c");
        assert!(c != a && c != b);
        assert_eq!(map.iter().count(), 1);
    }
}
