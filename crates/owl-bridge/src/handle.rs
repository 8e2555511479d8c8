//! Owned handles over foreign object references.
//!
//! A [`Handle`] is the only way bridge code holds on to a foreign object
//! across boundary crossings. Handles are move-only: cloning the Rust value
//! is impossible, and sharing requires an explicit [`HandleRegistry::duplicate`]
//! which buys a second reference unit from the host. Dropping a handle gives
//! its unit back exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use owl_vm::{NULL_REF, RawRef};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::session::SessionCore;

/// Cached identity of a foreign class, as observed through a handle.
///
/// The registry keeps one descriptor per concrete class and hands out shared
/// pointers to it; repeated [`HandleRegistry::class_of`] calls for the same
/// class hit the cache instead of the host.
pub struct TypeDescriptor {
    pub(crate) class: RawRef,
    name: String,
}

impl TypeDescriptor {
    /// Slash-separated qualified name of the class.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An owned, move-only reference to a foreign object.
///
/// The wrapped identifier is opaque; nothing about the object can be read
/// through the handle alone. Dropping the handle returns its reference unit
/// to the host.
#[must_use]
pub struct Handle {
    raw: RawRef,
    core: Arc<SessionCore>,
}

impl Handle {
    /// Takes ownership of one already-acquired reference unit.
    pub(crate) fn adopt(core: Arc<SessionCore>, raw: RawRef) -> Self {
        core.note_live(raw);
        Self { raw, core }
    }

    /// The opaque foreign identifier. Stable for the lifetime of the handle.
    pub fn raw(&self) -> RawRef {
        self.raw
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.core.release_unit(self.raw);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("raw", &self.raw).finish()
    }
}

/// Tracks every live handle of a session and mediates acquisition, explicit
/// duplication, and class identity queries.
pub struct HandleRegistry {
    core: Arc<SessionCore>,
    descriptors: Mutex<HashMap<RawRef, Arc<TypeDescriptor>>>,
}

impl HandleRegistry {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self {
            core,
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    /// Wraps a raw reference freshly returned by a host operation.
    ///
    /// Drains any pending foreign failure first; on failure the reference
    /// unit (if one was returned at all) is given back before the error
    /// propagates, so a failed acquisition never leaks. Null references are
    /// rejected: absence is modelled with `Option` before this point.
    pub fn acquire(&self, raw: RawRef) -> Result<Handle> {
        if let Some(message) = self.core.vm().take_failure() {
            if raw != NULL_REF {
                self.core.vm().release(raw);
            }
            return Err(BridgeError::ForeignFailure(message));
        }
        if raw == NULL_REF {
            return Err(BridgeError::NullReference {
                context: "handle acquisition",
            });
        }
        trace!(raw, "acquired foreign handle");
        Ok(Handle::adopt(self.core.clone(), raw))
    }

    /// Buys a second reference unit for the same foreign object.
    ///
    /// This is the only way to share: handles themselves never clone. As in
    /// [`HandleRegistry::acquire`], a pending failure returns the fresh unit
    /// before the error propagates.
    pub fn duplicate(&self, handle: &Handle) -> Result<Handle> {
        let raw = self.core.vm().retain(handle.raw());
        if let Some(message) = self.core.vm().take_failure() {
            if raw != NULL_REF {
                self.core.vm().release(raw);
            }
            return Err(BridgeError::ForeignFailure(message));
        }
        Ok(Handle::adopt(self.core.clone(), raw))
    }

    /// Releases a handle eagerly instead of waiting for scope exit.
    pub fn release(&self, handle: Handle) {
        drop(handle);
    }

    /// Identity of the concrete foreign class of `handle`, cached per class.
    pub fn class_of(&self, handle: &Handle) -> Result<Arc<TypeDescriptor>> {
        let class = self.core.vm().class_of(handle.raw());
        if let Some(message) = self.core.vm().take_failure() {
            if class != NULL_REF {
                self.core.vm().release(class);
            }
            return Err(BridgeError::ForeignFailure(message));
        }

        let mut cache = self.descriptors.lock();
        if let Some(descriptor) = cache.get(&class) {
            // Already holding a unit for this class; give the fresh one back.
            self.core.vm().release(class);
            return Ok(Arc::clone(descriptor));
        }

        let name = self.core.vm().class_name(class);
        let descriptor = Arc::new(TypeDescriptor { class, name });
        cache.insert(class, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Raw identifiers of every currently live handle.
    pub fn live_roots(&self) -> Vec<RawRef> {
        self.core.live_roots()
    }

    /// Number of distinct foreign objects with at least one live handle.
    pub fn live_count(&self) -> usize {
        self.core.live_count()
    }

    /// Drops the class-descriptor cache, returning its reference units.
    pub(crate) fn clear(&self) {
        let mut cache = self.descriptors.lock();
        for (_, descriptor) in cache.drain() {
            self.core.vm().release(descriptor.class);
        }
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.core.live_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use owl_vm::{ForeignRuntime, NULL_REF};

    use crate::codec::ForeignClass;
    use crate::error::BridgeError;
    use crate::session::tests::test_session;

    #[test]
    fn test_acquire_and_drop_conserve_reference_units() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();

        let formula = factory.literal(0).unwrap();
        let raw = formula.handle().raw();
        assert_eq!(session.registry().live_count(), 1);
        assert_eq!(vm.refs_of(raw), Some(1));

        drop(formula);
        assert_eq!(session.registry().live_count(), 0);
        assert_eq!(vm.refs_of(raw), None);
    }

    #[test]
    fn test_acquire_null_is_an_error() {
        let (_vm, session) = test_session();

        let err = session.registry().acquire(NULL_REF).unwrap_err();
        assert!(matches!(err, BridgeError::NullReference { .. }));
    }

    #[test]
    fn test_acquire_with_pending_failure_releases_the_unit() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();
        let formula = factory.literal(1).unwrap();

        // Fabricate a crossing that returned a unit but left a failure
        // pending: a retained reference plus a failed class lookup.
        let raw = vm.retain(formula.handle().raw());
        assert_eq!(vm.find_class("no/such/Class"), NULL_REF);
        assert!(vm.failure_pending());

        let err = session.registry().acquire(raw).unwrap_err();
        assert!(matches!(err, BridgeError::ForeignFailure(_)));
        assert!(!vm.failure_pending());

        drop(formula);
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_duplicate_buys_an_independent_unit() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();

        let original = factory.boolean_constant(true).unwrap();
        let copy = session.registry().duplicate(original.handle()).unwrap();
        assert_eq!(original.handle().raw(), copy.raw());

        let raw = copy.raw();
        drop(original);
        // The object survives the first drop: the copy still holds a unit.
        assert_eq!(session.registry().live_count(), 1);
        assert!(vm.refs_of(raw).unwrap_or(0) > 0);

        drop(copy);
        assert_eq!(session.registry().live_count(), 0);
    }

    #[test]
    fn test_duplicate_with_pending_failure_releases_the_fresh_unit() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();
        let formula = factory.literal(0).unwrap();
        let raw = formula.handle().raw();

        // Leave a failure pending from an earlier crossing.
        assert_eq!(vm.find_class("no/such/Class"), NULL_REF);
        assert!(vm.failure_pending());

        let err = session.registry().duplicate(formula.handle()).unwrap_err();
        assert!(matches!(err, BridgeError::ForeignFailure(_)));
        assert!(!vm.failure_pending());

        // The retained unit went back; only the original handle remains.
        assert_eq!(vm.refs_of(raw), Some(1));

        drop(formula);
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_class_of_is_cached_per_class() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();

        let a = factory.literal(0).unwrap();
        let b = factory.literal(1).unwrap();

        let da = session.registry().class_of(a.handle()).unwrap();
        let db = session.registry().class_of(b.handle()).unwrap();

        assert_eq!(da.name(), "owl/ltl/Formula");
        assert!(std::sync::Arc::ptr_eq(&da, &db));

        drop((a, b, da, db));
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }
}
