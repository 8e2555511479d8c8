//! Cached member resolution and uniform invocation.
//!
//! Resolution happens at most once per (class, member, signature, kind)
//! tuple; after the first successful lookup the binding is served from an
//! in-memory cache that is only invalidated by session teardown. Every
//! invocation drains the host's pending-failure slot before its result is
//! allowed to escape.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use owl_vm::{ForeignRuntime, MemberId, MemberKind, NULL_REF, RawRef, RawValue};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::session::SessionCore;

/// Identity of a resolvable member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub class: String,
    pub member: String,
    pub signature: String,
    pub kind: MemberKind,
}

/// A successfully resolved member, pinned to its owning class reference.
///
/// The class reference is owned by the bridge's class cache, not by the
/// binding; bindings never outlive the bridge that produced them.
pub struct MemberBinding {
    key: BindingKey,
    class: RawRef,
    member: MemberId,
}

impl MemberBinding {
    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    pub fn kind(&self) -> MemberKind {
        self.key.kind
    }
}

impl fmt::Debug for MemberBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberBinding")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Resolves and invokes host members on behalf of the typed layers above.
pub struct CallBridge {
    core: Arc<SessionCore>,
    classes: RwLock<HashMap<String, RawRef>>,
    bindings: RwLock<HashMap<BindingKey, Arc<MemberBinding>>>,
}

impl CallBridge {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self {
            core,
            classes: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn vm(&self) -> &dyn ForeignRuntime {
        self.core.vm()
    }

    /// A class reference from the per-session class cache, looked up on
    /// first use. The returned reference is borrowed from the cache.
    pub fn class_ref(&self, name: &str) -> Result<RawRef> {
        if let Some(class) = self.classes.read().get(name) {
            return Ok(*class);
        }

        let class = self.vm().find_class(name);
        if let Some(detail) = self.vm().take_failure() {
            return Err(BridgeError::ResolutionFailure {
                class: name.to_string(),
                member: "<class>".to_string(),
                signature: String::new(),
                detail,
            });
        }

        let mut cache = self.classes.write();
        if let Some(existing) = cache.get(name) {
            // Lost the race; give the redundant unit back.
            self.vm().release(class);
            return Ok(*existing);
        }
        cache.insert(name.to_string(), class);
        Ok(class)
    }

    /// Resolves a member, hitting the binding cache when possible.
    ///
    /// A lookup miss on the host side is non-recoverable for the fixed
    /// operation set; callers binding eagerly treat the error as fatal.
    pub fn resolve(
        &self,
        class: &str,
        member: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Result<Arc<MemberBinding>> {
        let key = BindingKey {
            class: class.to_string(),
            member: member.to_string(),
            signature: signature.to_string(),
            kind,
        };
        if let Some(binding) = self.bindings.read().get(&key) {
            return Ok(Arc::clone(binding));
        }

        let class_ref = self.class_ref(class)?;
        let id = self.vm().resolve_member(class_ref, kind, member, signature);
        if let Some(detail) = self.vm().take_failure() {
            return Err(BridgeError::ResolutionFailure {
                class: class.to_string(),
                member: member.to_string(),
                signature: signature.to_string(),
                detail,
            });
        }
        debug!(class, member, signature, "resolved host member");

        let binding = Arc::new(MemberBinding {
            key: key.clone(),
            class: class_ref,
            member: id,
        });
        let mut cache = self.bindings.write();
        let entry = cache.entry(key).or_insert(binding);
        Ok(Arc::clone(entry))
    }

    /// Invokes a resolved member and drains the pending-failure slot.
    ///
    /// On a pending failure any reference unit the call returned is given
    /// back before the error propagates; a failed crossing never leaks.
    /// `receiver` is ignored for static members and constructors.
    pub fn invoke(
        &self,
        binding: &MemberBinding,
        receiver: RawRef,
        args: &[RawValue],
    ) -> Result<RawValue> {
        let vm = self.vm();
        let result = match binding.key.kind {
            MemberKind::Method => vm.call(receiver, binding.member, args),
            MemberKind::StaticMethod => vm.call_static(binding.class, binding.member, args),
            MemberKind::Constructor => {
                RawValue::Ref(vm.construct(binding.class, binding.member, args))
            }
            MemberKind::Field => vm.field(receiver, binding.member),
            MemberKind::StaticField => vm.static_field(binding.class, binding.member),
        };

        if let Some(message) = vm.take_failure() {
            if let Some(raw) = result.reference()
                && raw != NULL_REF
            {
                vm.release(raw);
            }
            return Err(BridgeError::ForeignFailure(message));
        }
        Ok(result)
    }

    /// Number of cached member bindings.
    pub fn cached_bindings(&self) -> usize {
        self.bindings.read().len()
    }

    /// Drops both caches, returning the class reference units.
    pub(crate) fn clear(&self) {
        self.bindings.write().clear();
        let mut classes = self.classes.write();
        for (_, class) in classes.drain() {
            self.vm().release(class);
        }
    }
}

impl fmt::Debug for CallBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBridge")
            .field("bindings", &self.cached_bindings())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use owl_vm::{ForeignRuntime, MemberKind};

    use crate::error::BridgeError;
    use crate::session::tests::test_session;

    #[test]
    fn test_repeated_resolution_hits_the_cache() {
        let (vm, session) = test_session();
        let bridge = session.bridge();

        let before = vm.counters().resolutions;
        let first = bridge
            .resolve("java/util/List", "add", "(Ljava/lang/Object;)Z", MemberKind::Method)
            .unwrap();
        let after_first = vm.counters().resolutions;
        let second = bridge
            .resolve("java/util/List", "add", "(Ljava/lang/Object;)Z", MemberKind::Method)
            .unwrap();

        // The second resolution never reached the host.
        assert_eq!(vm.counters().resolutions, after_first);
        assert!(after_first > before);
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_member_is_a_resolution_failure() {
        let (vm, session) = test_session();

        let err = session
            .bridge()
            .resolve("owl/ltl/Formula", "frobnicate", "()V", MemberKind::Method)
            .unwrap_err();

        assert!(matches!(err, BridgeError::ResolutionFailure { .. }));
        assert!(!vm.failure_pending());
    }

    #[test]
    fn test_unknown_class_is_a_resolution_failure() {
        let (vm, session) = test_session();

        let err = session.bridge().class_ref("no/such/Class").unwrap_err();

        assert!(matches!(err, BridgeError::ResolutionFailure { .. }));
        assert!(!vm.failure_pending());
    }

    #[test]
    fn test_failed_invocation_drains_and_surfaces_the_diagnostic() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();
        let formula = factory.literal(0).unwrap();

        vm.inject_failure("owl/ltl/Formula", "not", "owl.ltl.VisitorException: boom");
        let err = factory.negation(&formula).unwrap_err();

        match err {
            BridgeError::ForeignFailure(message) => {
                assert_eq!(message, "owl.ltl.VisitorException: boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The slot drained: the next crossing succeeds.
        assert!(!vm.failure_pending());
        let negated = factory.negation(&formula).unwrap();

        drop((formula, negated));
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }
}
