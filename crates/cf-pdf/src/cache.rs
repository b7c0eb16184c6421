//! Per-dataset value caching shared by all models of one fit session.
//!
//! Protocol:
//! 1. A session coordinator (usually the minimizer adapter) creates one [`CacheAllocator`].
//! 2. Every model is asked for its `cache_real` / `cache_complex` maps. A model that is
//!    cacheable computes one value per dataset entry, then claims a slot from the allocator
//!    and returns `{slot index -> values}`; a model with floating inputs returns an empty
//!    map and clears its slot.
//! 3. The coordinator merges all maps into a [`CacheRegistry`] and freezes it into an
//!    immutable, entry-major [`CacheTable`].
//! 4. During evaluation each model reads its own slots from the [`CacheRow`] of the entry,
//!    but only when it holds a slot from step 2. A table built for a session rejects slots
//!    issued by any other session.
//!
//! Slots are claimed only after the whole sequence was computed, so a failing model never
//! publishes a partial sequence.

use cf_core::{Error, Result};
use num_complex::Complex64;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-entry cached values of one model, keyed by slot index.
pub type CacheMap<T> = BTreeMap<u32, Vec<T>>;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Which of the two registries a slot lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Real-valued sequences.
    Real,
    /// Complex-valued sequences.
    Complex,
}

/// A cache slot handed out by a [`CacheAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSlot {
    session: u64,
    kind: CacheKind,
    index: u32,
}

impl CacheSlot {
    /// Index of the slot within its registry.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Registry kind.
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Session that issued the slot.
    pub fn session(&self) -> u64 {
        self.session
    }
}

/// Session-scoped allocator of collision-free cache slots.
///
/// Indices increase monotonically within a session, separately for real and complex slots.
/// Claiming again with a slot issued by the same session returns that slot unchanged, so
/// re-caching within a session overwrites the previous sequence instead of leaking a new
/// index.
#[derive(Debug)]
pub struct CacheAllocator {
    session: u64,
    next_real: u32,
    next_complex: u32,
}

impl CacheAllocator {
    /// Start a new session.
    pub fn new() -> Self {
        Self { session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed), next_real: 0, next_complex: 0 }
    }

    /// Identifier of this session.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Number of real slots issued so far.
    pub fn n_real(&self) -> u32 {
        self.next_real
    }

    /// Number of complex slots issued so far.
    pub fn n_complex(&self) -> u32 {
        self.next_complex
    }

    /// Whether `slot` was issued by this session.
    pub fn owns(&self, slot: &CacheSlot) -> bool {
        slot.session == self.session
    }

    /// Claim a real slot, reusing `previous` if it belongs to this session.
    pub fn claim_real(&mut self, previous: Option<CacheSlot>) -> CacheSlot {
        self.claim(CacheKind::Real, previous)
    }

    /// Claim a complex slot, reusing `previous` if it belongs to this session.
    pub fn claim_complex(&mut self, previous: Option<CacheSlot>) -> CacheSlot {
        self.claim(CacheKind::Complex, previous)
    }

    fn claim(&mut self, kind: CacheKind, previous: Option<CacheSlot>) -> CacheSlot {
        if let Some(prev) = previous {
            if prev.session == self.session && prev.kind == kind {
                log::debug!("reusing {kind:?} cache slot {} in session {}", prev.index, self.session);
                return prev;
            }
        }
        let counter = match kind {
            CacheKind::Real => &mut self.next_real,
            CacheKind::Complex => &mut self.next_complex,
        };
        let index = *counter;
        *counter += 1;
        CacheSlot { session: self.session, kind, index }
    }
}

impl Default for CacheAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable collection point for the cache maps of all models in a session.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    session: Option<u64>,
    real: CacheMap<f64>,
    complex: CacheMap<Complex64>,
}

impl CacheRegistry {
    /// Empty registry that accepts slots of any session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose table only serves slots issued by `alloc`.
    pub fn for_session(alloc: &CacheAllocator) -> Self {
        Self { session: Some(alloc.session), ..Self::default() }
    }

    /// Merge real sequences; an existing index is overwritten.
    pub fn merge_real(&mut self, map: CacheMap<f64>) {
        self.real.extend(map);
    }

    /// Merge complex sequences; an existing index is overwritten.
    pub fn merge_complex(&mut self, map: CacheMap<Complex64>) {
        self.complex.extend(map);
    }

    /// Number of real sequences.
    pub fn n_real(&self) -> usize {
        self.real.len()
    }

    /// Number of complex sequences.
    pub fn n_complex(&self) -> usize {
        self.complex.len()
    }

    /// Real sequence stored under `index`.
    pub fn real(&self, index: u32) -> Option<&[f64]> {
        self.real.get(&index).map(|v| v.as_slice())
    }

    /// Complex sequence stored under `index`.
    pub fn complex(&self, index: u32) -> Option<&[Complex64]> {
        self.complex.get(&index).map(|v| v.as_slice())
    }

    /// Drop every sequence.
    pub fn clear(&mut self) {
        self.real.clear();
        self.complex.clear();
    }

    /// Transpose into an immutable entry-major table.
    ///
    /// Every sequence must hold exactly one value per entry. Unused indices below the
    /// largest one are filled with NaN.
    pub fn freeze(&self, n_entries: usize) -> Result<CacheTable> {
        for (idx, seq) in &self.real {
            if seq.len() != n_entries {
                return Err(Error::Validation(format!(
                    "real cache slot {idx} holds {} values, expected {n_entries}",
                    seq.len()
                )));
            }
        }
        for (idx, seq) in &self.complex {
            if seq.len() != n_entries {
                return Err(Error::Validation(format!(
                    "complex cache slot {idx} holds {} values, expected {n_entries}",
                    seq.len()
                )));
            }
        }

        let real_width = self.real.keys().next_back().map_or(0, |&k| k as usize + 1);
        let complex_width = self.complex.keys().next_back().map_or(0, |&k| k as usize + 1);

        let mut real = vec![f64::NAN; n_entries * real_width];
        for (&idx, seq) in &self.real {
            for (entry, &v) in seq.iter().enumerate() {
                real[entry * real_width + idx as usize] = v;
            }
        }
        let mut complex = vec![Complex64::new(f64::NAN, f64::NAN); n_entries * complex_width];
        for (&idx, seq) in &self.complex {
            for (entry, &v) in seq.iter().enumerate() {
                complex[entry * complex_width + idx as usize] = v;
            }
        }

        Ok(CacheTable {
            session: self.session,
            n_entries,
            real_width,
            complex_width,
            real,
            complex,
        })
    }
}

/// Immutable, entry-major view of a frozen [`CacheRegistry`].
#[derive(Debug, Clone, Default)]
pub struct CacheTable {
    session: Option<u64>,
    n_entries: usize,
    real_width: usize,
    complex_width: usize,
    real: Vec<f64>,
    complex: Vec<Complex64>,
}

impl CacheTable {
    /// Number of entries covered by the table.
    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    /// Cached values of one entry.
    pub fn row(&self, entry: usize) -> Result<CacheRow<'_>> {
        if entry >= self.n_entries {
            return Err(Error::Validation(format!(
                "cache row {entry} out of range (n_entries = {})",
                self.n_entries
            )));
        }
        Ok(CacheRow {
            session: self.session,
            real: &self.real[entry * self.real_width..(entry + 1) * self.real_width],
            complex: &self.complex[entry * self.complex_width..(entry + 1) * self.complex_width],
        })
    }
}

/// Cached values of a single dataset entry, indexed by slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheRow<'a> {
    session: Option<u64>,
    real: &'a [f64],
    complex: &'a [Complex64],
}

impl<'a> CacheRow<'a> {
    /// A row without any cached value.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Row over explicit per-entry slices (`real[i]` is the value of real slot `i`).
    pub fn from_slices(real: &'a [f64], complex: &'a [Complex64]) -> Self {
        Self { session: None, real, complex }
    }

    fn check_session(&self, slot: &CacheSlot) -> Result<()> {
        match self.session {
            Some(session) if session != slot.session => Err(Error::Validation(format!(
                "cache slot {} of session {} read from a table of session {session}",
                slot.index, slot.session
            ))),
            _ => Ok(()),
        }
    }

    /// Real value stored in `slot`.
    pub fn real(&self, slot: &CacheSlot) -> Result<f64> {
        if slot.kind != CacheKind::Real {
            return Err(Error::Validation(format!("slot {} is not a real slot", slot.index)));
        }
        self.check_session(slot)?;
        self.real.get(slot.index as usize).copied().ok_or_else(|| {
            Error::Validation(format!("cache row has no real slot {}", slot.index))
        })
    }

    /// Complex value stored in `slot`.
    pub fn complex(&self, slot: &CacheSlot) -> Result<Complex64> {
        if slot.kind != CacheKind::Complex {
            return Err(Error::Validation(format!("slot {} is not a complex slot", slot.index)));
        }
        self.check_session(slot)?;
        self.complex.get(slot.index as usize).copied().ok_or_else(|| {
            Error::Validation(format!("cache row has no complex slot {}", slot.index))
        })
    }
}
