// Storage buffer and per-workgroup shared memory.
//
// Both are arrays of 64-bit cells, one scalar per cell, so every supported
// scalar type (including f64) fits without aliasing games. Plain reads and
// writes are sequentially consistent loads/stores of the cell; the atomic
// integer ops are CAS loops over the low 32 bits. Mutation discipline
// beyond that is the shader's responsibility.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared array of typed 64-bit cells. Backing store for both the storage
/// buffer and workgroup shared memory.
pub struct AtomicWords {
    words: Arc<Vec<AtomicU64>>,
}

impl Clone for AtomicWords {
    fn clone(&self) -> Self {
        AtomicWords {
            words: Arc::clone(&self.words),
        }
    }
}

impl AtomicWords {
    fn zeroed(len: usize) -> Self {
        AtomicWords {
            words: Arc::new((0..len).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    fn from_words(words: &[u64]) -> Self {
        AtomicWords {
            words: Arc::new(words.iter().map(|&w| AtomicU64::new(w)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn load(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::SeqCst)
    }

    fn store(&self, index: usize, word: u64) {
        self.words[index].store(word, Ordering::SeqCst);
    }

    /// Sequentially consistent read-modify-write of the low 32 bits.
    /// Returns the previous value.
    fn rmw_u32(&self, index: usize, f: impl Fn(u32) -> u32) -> u32 {
        let cell = &self.words[index];
        let mut current = cell.load(Ordering::SeqCst);
        loop {
            let next = f(current as u32) as u64;
            match cell.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(previous) => return previous as u32,
                Err(actual) => current = actual,
            }
        }
    }

    // Typed plain access. Each cell holds exactly one scalar, stored in its
    // natural bit pattern (zero-extended for 32-bit types).

    pub fn read_u32(&self, index: usize) -> u32 {
        self.load(index) as u32
    }

    pub fn write_u32(&self, index: usize, value: u32) {
        self.store(index, value as u64);
    }

    pub fn read_i32(&self, index: usize) -> i32 {
        self.load(index) as u32 as i32
    }

    pub fn write_i32(&self, index: usize, value: i32) {
        self.store(index, value as u32 as u64);
    }

    pub fn read_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load(index) as u32)
    }

    pub fn write_f32(&self, index: usize, value: f32) {
        self.store(index, value.to_bits() as u64);
    }

    pub fn read_f64(&self, index: usize) -> f64 {
        f64::from_bits(self.load(index))
    }

    pub fn write_f64(&self, index: usize, value: f64) {
        self.store(index, value.to_bits());
    }

    pub fn read_bool(&self, index: usize) -> bool {
        self.load(index) != 0
    }

    pub fn write_bool(&self, index: usize, value: bool) {
        self.store(index, value as u64);
    }

    // Atomic integer ops, all sequentially consistent, all returning the
    // previous value (GLSL atomic semantics).

    pub fn atomic_add_u32(&self, index: usize, value: u32) -> u32 {
        self.rmw_u32(index, |w| w.wrapping_add(value))
    }

    pub fn atomic_add_i32(&self, index: usize, value: i32) -> i32 {
        self.rmw_u32(index, |w| (w as i32).wrapping_add(value) as u32) as i32
    }

    pub fn atomic_and_u32(&self, index: usize, value: u32) -> u32 {
        self.rmw_u32(index, |w| w & value)
    }

    pub fn atomic_and_i32(&self, index: usize, value: i32) -> i32 {
        self.rmw_u32(index, |w| w & value as u32) as i32
    }

    pub fn atomic_or_u32(&self, index: usize, value: u32) -> u32 {
        self.rmw_u32(index, |w| w | value)
    }

    pub fn atomic_or_i32(&self, index: usize, value: i32) -> i32 {
        self.rmw_u32(index, |w| w | value as u32) as i32
    }

    pub fn atomic_xor_u32(&self, index: usize, value: u32) -> u32 {
        self.rmw_u32(index, |w| w ^ value)
    }

    pub fn atomic_xor_i32(&self, index: usize, value: i32) -> i32 {
        self.rmw_u32(index, |w| w ^ value as u32) as i32
    }

    pub fn atomic_exchange_u32(&self, index: usize, value: u32) -> u32 {
        self.rmw_u32(index, |_| value)
    }

    pub fn atomic_exchange_i32(&self, index: usize, value: i32) -> i32 {
        self.rmw_u32(index, |_| value as u32) as i32
    }

    pub fn atomic_comp_swap_u32(&self, index: usize, compare: u32, value: u32) -> u32 {
        match self.words[index].compare_exchange(
            compare as u64,
            value as u64,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(previous) | Err(previous) => previous as u32,
        }
    }

    pub fn atomic_comp_swap_i32(&self, index: usize, compare: i32, value: i32) -> i32 {
        self.atomic_comp_swap_u32(index, compare as u32, value as u32) as i32
    }
}

/// The dispatch-wide storage buffer. One instance is shared by every
/// invocation of a dispatch; effects of `run_compute` land here.
#[derive(Clone)]
pub struct StorageBuffer {
    cells: AtomicWords,
}

impl StorageBuffer {
    pub fn zeroed(len: usize) -> Self {
        StorageBuffer {
            cells: AtomicWords::zeroed(len),
        }
    }

    pub fn from_words(words: &[u64]) -> Self {
        StorageBuffer {
            cells: AtomicWords::from_words(words),
        }
    }
}

impl Deref for StorageBuffer {
    type Target = AtomicWords;

    fn deref(&self) -> &AtomicWords {
        &self.cells
    }
}

/// Caller-provided template for workgroup shared memory. The dispatcher
/// instantiates one independent copy per concurrent workgroup slot; the
/// seed itself is owned plain data, so the copy is deep by construction.
#[derive(Clone, Debug, Default)]
pub struct SharedSeed {
    words: Vec<u64>,
}

impl SharedSeed {
    /// Zero-sized placeholder used when a dispatch needs no shared memory.
    pub fn empty() -> Self {
        SharedSeed { words: Vec::new() }
    }

    pub fn zeroed(len: usize) -> Self {
        SharedSeed {
            words: vec![0; len],
        }
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        SharedSeed { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Deep-copies the seed into a fresh workgroup instance.
    pub(crate) fn instantiate(&self) -> SharedMemory {
        SharedMemory {
            cells: AtomicWords::from_words(&self.words),
        }
    }
}

/// One workgroup's shared memory: visible to every invocation of that
/// workgroup and to nothing else.
#[derive(Clone)]
pub struct SharedMemory {
    cells: AtomicWords,
}

impl Deref for SharedMemory {
    type Target = AtomicWords;

    fn deref(&self) -> &AtomicWords {
        &self.cells
    }
}
