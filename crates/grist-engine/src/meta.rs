//! Per-block metadata
//!
//! Tools register metadata descriptors at initialisation; every block then
//! carries a [`BlockMeta`] with one slot per descriptor. Indexable slots
//! contribute to block identity (two blocks with equal indexable metadata
//! are interchangeable translations); mutable slots carry runtime state and
//! are irrelevant to identity. Descriptor 0 is always the built-in
//! `app.start_pc`.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};

/// Identifies a registered metadata descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaId(pub u16);

/// The built-in `app.start_pc` descriptor.
pub const APP_PC: MetaId = MetaId(0);

/// Whether a descriptor participates in block identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// Contributes to the identity hash.
    Indexable,
    /// Runtime state; irrelevant to identity.
    Mutable,
}

/// How an indexable descriptor compares during index lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    /// Values must match exactly or the candidate is rejected.
    Exact,
    /// A mismatch makes the candidate adaptable (usable through a
    /// register-remapping compensation shim) rather than rejected.
    Adaptable,
}

/// Result of comparing two blocks' indexable metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMatch {
    /// Reusable as-is.
    Accept,
    /// Compatible after a compensation shim.
    Adapt,
    /// Not interchangeable.
    Reject,
}

/// A registered descriptor.
#[derive(Debug, Clone)]
pub struct MetaDesc {
    pub name: String,
    pub kind: MetaKind,
    pub compare: CompareMode,
    pub default: u64,
}

/// Error registering a descriptor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetaError {
    #[error("metadata descriptor {0:?} already registered")]
    DuplicateName(String),
    #[error("descriptor registration is closed once blocks exist")]
    RegistrationClosed,
}

/// Registry of descriptors, fixed after initialisation.
#[derive(Debug)]
pub struct MetaRegistry {
    descs: Vec<MetaDesc>,
    by_name: FxHashMap<String, MetaId>,
    sealed: bool,
}

impl MetaRegistry {
    /// A registry with only the built-in `app.start_pc` descriptor.
    pub fn new() -> MetaRegistry {
        let mut registry = MetaRegistry { descs: Vec::new(), by_name: FxHashMap::default(), sealed: false };
        registry
            .register("app.start_pc", MetaKind::Indexable, CompareMode::Exact, 0)
            .expect("built-in descriptor");
        registry
    }

    /// Register a descriptor. Fails on duplicate names or after sealing.
    pub fn register(
        &mut self,
        name: &str,
        kind: MetaKind,
        compare: CompareMode,
        default: u64,
    ) -> Result<MetaId, MetaError> {
        if self.sealed {
            return Err(MetaError::RegistrationClosed);
        }
        if self.by_name.contains_key(name) {
            return Err(MetaError::DuplicateName(name.to_string()));
        }
        let id = MetaId(self.descs.len() as u16);
        self.descs.push(MetaDesc { name: name.to_string(), kind, compare, default });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Close registration; called once translation starts.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Look up a descriptor id by name.
    pub fn id(&self, name: &str) -> Option<MetaId> {
        self.by_name.get(name).copied()
    }

    /// The descriptor for an id.
    pub fn desc(&self, id: MetaId) -> &MetaDesc {
        &self.descs[id.0 as usize]
    }

    /// Fresh metadata for a block starting at `start_pc`, with every other
    /// slot at its descriptor's default.
    pub fn new_meta(&self, start_pc: u64) -> BlockMeta {
        let slots = self
            .descs
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let value = if i == APP_PC.0 as usize { start_pc } else { desc.default };
                match desc.kind {
                    MetaKind::Indexable => MetaSlot::Indexable {
                        value,
                        // Adaptable slots stay out of the identity hash so
                        // adapt candidates share an index bucket.
                        adaptable: desc.compare == CompareMode::Adaptable,
                    },
                    MetaKind::Mutable => MetaSlot::Mutable(AtomicU64::new(value)),
                }
            })
            .collect();
        BlockMeta { slots }
    }

    /// Compare two metadata records descriptor-by-descriptor.
    pub fn compare(&self, a: &BlockMeta, b: &BlockMeta) -> MetaMatch {
        let mut adapt = false;
        for (i, desc) in self.descs.iter().enumerate() {
            if desc.kind != MetaKind::Indexable {
                continue;
            }
            let (va, vb) = (a.slots[i].indexable(), b.slots[i].indexable());
            if va != vb {
                match desc.compare {
                    CompareMode::Exact => return MetaMatch::Reject,
                    CompareMode::Adaptable => adapt = true,
                }
            }
        }
        if adapt {
            MetaMatch::Adapt
        } else {
            MetaMatch::Accept
        }
    }
}

impl Default for MetaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One metadata slot.
#[derive(Debug)]
enum MetaSlot {
    Indexable { value: u64, adaptable: bool },
    Mutable(AtomicU64),
}

impl MetaSlot {
    fn indexable(&self) -> u64 {
        match self {
            MetaSlot::Indexable { value, .. } => *value,
            MetaSlot::Mutable(value) => value.load(Ordering::Relaxed),
        }
    }
}

/// Per-block metadata: the concatenation of every registered descriptor's
/// slot. Shared between a block, the cache index, and edges via `Arc`.
#[derive(Debug)]
pub struct BlockMeta {
    slots: Vec<MetaSlot>,
}

impl BlockMeta {
    /// The block's application start PC (descriptor 0).
    pub fn start_pc(&self) -> u64 {
        self.slots[APP_PC.0 as usize].indexable()
    }

    /// Read an indexable slot.
    pub fn get(&self, id: MetaId) -> u64 {
        self.slots[id.0 as usize].indexable()
    }

    /// Write an indexable slot. Only meaningful before the block is
    /// published to the cache index.
    pub fn set(&mut self, id: MetaId, value: u64) {
        match &mut self.slots[id.0 as usize] {
            MetaSlot::Indexable { value: slot, .. } => *slot = value,
            MetaSlot::Mutable(slot) => *slot = AtomicU64::new(value),
        }
    }

    /// The mutable slot cell for runtime counters and flags.
    pub fn mutable(&self, id: MetaId) -> Option<&AtomicU64> {
        match &self.slots[id.0 as usize] {
            MetaSlot::Mutable(cell) => Some(cell),
            MetaSlot::Indexable { .. } => None,
        }
    }

    /// Identity hash over the exact-compared indexable slots.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (i, slot) in self.slots.iter().enumerate() {
            if let MetaSlot::Indexable { value, adaptable: false } = slot {
                i.hash(&mut hasher);
                value.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// A copy with the same indexable values and a snapshot of the mutable
    /// values.
    pub fn duplicate(&self) -> BlockMeta {
        let slots = self
            .slots
            .iter()
            .map(|slot| match slot {
                MetaSlot::Indexable { value, adaptable } => {
                    MetaSlot::Indexable { value: *value, adaptable: *adaptable }
                }
                MetaSlot::Mutable(cell) => MetaSlot::Mutable(AtomicU64::new(cell.load(Ordering::Relaxed))),
            })
            .collect();
        BlockMeta { slots }
    }

    /// `duplicate`, re-targeted at a different start PC.
    pub fn duplicate_for(&self, start_pc: u64) -> BlockMeta {
        let mut meta = self.duplicate();
        meta.set(APP_PC, start_pc);
        meta
    }
}

/// Shared handle to block metadata.
pub type MetaRef = Arc<BlockMeta>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_start_pc() {
        let registry = MetaRegistry::new();
        let meta = registry.new_meta(0x4000);
        assert_eq!(meta.start_pc(), 0x4000);
        assert_eq!(meta.get(APP_PC), 0x4000);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = MetaRegistry::new();
        registry.register("tool.a", MetaKind::Mutable, CompareMode::Exact, 0).unwrap();
        assert!(matches!(
            registry.register("tool.a", MetaKind::Mutable, CompareMode::Exact, 0),
            Err(MetaError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_sealed_registry() {
        let mut registry = MetaRegistry::new();
        registry.seal();
        assert!(matches!(
            registry.register("late", MetaKind::Mutable, CompareMode::Exact, 0),
            Err(MetaError::RegistrationClosed)
        ));
    }

    #[test]
    fn test_identity_hash_ignores_mutable() {
        let mut registry = MetaRegistry::new();
        let counter = registry.register("tool.count", MetaKind::Mutable, CompareMode::Exact, 0).unwrap();
        let a = registry.new_meta(0x1000);
        let b = registry.new_meta(0x1000);
        a.mutable(counter).unwrap().store(99, Ordering::Relaxed);
        assert_eq!(a.identity_hash(), b.identity_hash());
        assert_eq!(registry.compare(&a, &b), MetaMatch::Accept);
    }

    #[test]
    fn test_indexable_changes_identity() {
        let mut registry = MetaRegistry::new();
        let policy = registry.register("tool.policy", MetaKind::Indexable, CompareMode::Exact, 0).unwrap();
        let a = registry.new_meta(0x1000);
        let mut b = registry.new_meta(0x1000);
        b.set(policy, 1);
        assert_ne!(a.identity_hash(), b.identity_hash());
        assert_eq!(registry.compare(&a, &b), MetaMatch::Reject);
    }

    #[test]
    fn test_adaptable_compare() {
        let mut registry = MetaRegistry::new();
        let shape = registry
            .register("tool.reg_shape", MetaKind::Indexable, CompareMode::Adaptable, 0)
            .unwrap();
        let a = registry.new_meta(0x1000);
        let mut b = registry.new_meta(0x1000);
        b.set(shape, 7);
        assert_eq!(registry.compare(&a, &b), MetaMatch::Adapt);

        // A start-pc mismatch still rejects outright.
        let c = registry.new_meta(0x2000);
        assert_eq!(registry.compare(&a, &c), MetaMatch::Reject);
    }

    #[test]
    fn test_duplicate_for() {
        let registry = MetaRegistry::new();
        let meta = registry.new_meta(0x1000);
        let other = meta.duplicate_for(0x2000);
        assert_eq!(other.start_pc(), 0x2000);
        assert_eq!(meta.start_pc(), 0x1000);
    }
}
