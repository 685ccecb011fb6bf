//! Opaque handles and the generational tables behind them.
//!
//! A [`Handle`] packs `{kind: 8 bits, generation: 24 bits, index: 32 bits}`
//! into a `u64`. Zero is the null handle. Destroying an object bumps the
//! generation of its slot, so a stale handle is detected instead of aliasing
//! whatever reuses the slot.

use std::fmt;

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Kinds of object reachable through a handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Interpreter = 1,
    Session = 2,
    Tensor = 3,
    Module = 4,
    Variable = 5,
    RuntimeManager = 6,
    Matrix = 7,
    ImageProcessor = 8,
    GenerationEngine = 9,
}

impl HandleKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use HandleKind::*;
        Some(match value {
            1 => Interpreter,
            2 => Session,
            3 => Tensor,
            4 => Module,
            5 => Variable,
            6 => RuntimeManager,
            7 => Matrix,
            8 => ImageProcessor,
            9 => GenerationEngine,
            _ => return None,
        })
    }
}

/// Boundary-stable reference to one runtime object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    fn pack(kind: HandleKind, generation: u32, index: u32) -> Self {
        Handle(
            ((kind as u64) << (INDEX_BITS + GENERATION_BITS))
                | (((generation & GENERATION_MASK) as u64) << INDEX_BITS)
                | index as u64,
        )
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn kind(&self) -> Option<HandleKind> {
        HandleKind::from_u8((self.0 >> (INDEX_BITS + GENERATION_BITS)) as u8)
    }

    pub fn generation(&self) -> u32 {
        ((self.0 >> INDEX_BITS) as u32) & GENERATION_MASK
    }

    pub fn index(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Handle(null)");
        }
        write!(f, "Handle({:?}#{}@{})", self.kind(), self.index(), self.generation())
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot table for one handle kind.
#[derive(Debug)]
pub struct HandleTable<T> {
    kind: HandleKind,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::pack(self.kind, slot.generation, index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::pack(self.kind, 1, index)
    }

    fn slot_index(&self, handle: Handle) -> Option<usize> {
        if handle.kind() != Some(self.kind) {
            return None;
        }
        let index = handle.index() as usize;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation() && slot.value.is_some()).then_some(index)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slot_index(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let index = self.slot_index(handle)?;
        self.slots[index].value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = self.slot_index(handle)?;
        self.slots[index].value.as_mut()
    }

    /// Remove the object and retire the handle.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.slot_index(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take();
        slot.generation = (slot.generation % GENERATION_MASK) + 1;
        self.free.push(index as u32);
        self.live -= 1;
        value
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live handles and their values.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        let kind = self.kind;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::pack(kind, slot.generation, i as u32), v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing() {
        let h = Handle::pack(HandleKind::Tensor, 0xABCDEF, 42);
        assert_eq!(h.kind(), Some(HandleKind::Tensor));
        assert_eq!(h.generation(), 0xABCDEF);
        assert_eq!(h.index(), 42);
        assert!(!h.is_null());
        assert_eq!(Handle::NULL.kind(), None);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = HandleTable::new(HandleKind::Matrix);
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));
        let b = table.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let mut matrices = HandleTable::new(HandleKind::Matrix);
        let mut vars: HandleTable<&str> = HandleTable::new(HandleKind::Variable);
        let m = matrices.insert("m");
        vars.insert("v");
        assert!(!vars.contains(m));
        assert!(!vars.contains(Handle::NULL));
    }

    #[test]
    fn test_generation_wraps_without_zero() {
        let mut table = HandleTable::new(HandleKind::Session);
        table.slots.push(Slot {
            generation: GENERATION_MASK,
            value: Some(1),
        });
        table.live = 1;
        let h = Handle::pack(HandleKind::Session, GENERATION_MASK, 0);
        assert_eq!(table.remove(h), Some(1));
        assert_eq!(table.slots[0].generation, 1);
    }
}
