//! Type and resource-key interning (Module J support).
//!
//! Deliberately thin: a process-local type-name → 16-bit tag registry
//! for [`crate::data_store::StorableRecord`] implementors that want a
//! tag derived from their name instead of a hand-picked constant, plus
//! [`crate::smm::String64`] key construction. No on-disk dedup index —
//! the resource locator dictionary already deduplicates by key, and the
//! data store's type tags are a closed, small set defined at compile
//! time by each `StorableRecord` impl.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, OnceLock};

/// Assigns stable 16-bit tags to type names, first-come-first-served
/// within a process. Two processes attaching to the same SMM file must
/// agree on tags through a fixed `StorableRecord::TYPE_ID` constant, not
/// through this registry — this exists for callers that would otherwise
/// have to hand-pick and track unique constants themselves.
pub struct TypeRegistry {
    next_id: AtomicU16,
    names: Mutex<HashMap<&'static str, u16>>,
}

impl TypeRegistry {
    pub fn global() -> &'static TypeRegistry {
        static INSTANCE: OnceLock<TypeRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| TypeRegistry {
            next_id: AtomicU16::new(1),
            names: Mutex::new(HashMap::new()),
        })
    }

    /// Return the tag for `name`, assigning a fresh one on first sight.
    pub fn id_for(&self, name: &'static str) -> u16 {
        let mut names = self.names.lock().unwrap();
        *names
            .entry(name)
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_id() {
        let registry = TypeRegistry::global();
        let a = registry.id_for("intern::tests::Widget");
        let b = registry.id_for("intern::tests::Widget");
        assert_eq!(a, b);
    }

    #[test]
    fn different_names_yield_different_ids() {
        let registry = TypeRegistry::global();
        let a = registry.id_for("intern::tests::TypeA");
        let b = registry.id_for("intern::tests::TypeB");
        assert_ne!(a, b);
    }
}
