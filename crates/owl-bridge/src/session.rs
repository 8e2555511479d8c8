//! Session lifecycle: attach, operate, detach.
//!
//! A [`Session`] pins one host attachment. Construction attaches the calling
//! context to the host runtime and eagerly binds the fixed operation set the
//! facades depend on; any binding miss aborts the attach and surfaces as
//! [`BridgeError::ResolutionFailure`]. Teardown releases every cached class
//! reference and detaches exactly once, whether driven explicitly through
//! [`Session::detach`] or implicitly by `Drop`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use owl_vm::{ForeignRuntime, RawRef};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::call::CallBridge;
use crate::codec::Codec;
use crate::error::Result;
use crate::facade::{self, AutomatonFactory, FormulaFactory, FormulaRewriter};
use crate::handle::HandleRegistry;
use crate::roots::RootExchangeCoordinator;

/// Shared per-session state: the host runtime, the attachment flag, and the
/// live-handle bookkeeping that backs root snapshots.
pub(crate) struct SessionCore {
    vm: Arc<dyn ForeignRuntime>,
    attached: AtomicBool,
    live: Mutex<HashMap<RawRef, u32>>,
}

impl SessionCore {
    fn new(vm: Arc<dyn ForeignRuntime>) -> Self {
        Self {
            vm,
            attached: AtomicBool::new(true),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn vm(&self) -> &dyn ForeignRuntime {
        &*self.vm
    }

    /// Records one more live unit for `raw`.
    pub(crate) fn note_live(&self, raw: RawRef) {
        *self.live.lock().entry(raw).or_insert(0) += 1;
    }

    /// Gives one unit back to the host and updates the bookkeeping.
    ///
    /// After detach the host is gone; the unit is leaked deliberately and the
    /// leak is logged rather than risking a call into a dead runtime.
    pub(crate) fn release_unit(&self, raw: RawRef) {
        if !self.attached.load(Ordering::Acquire) {
            error!(raw, "handle outlived its session; foreign reference leaked");
            return;
        }
        {
            let mut live = self.live.lock();
            match live.get_mut(&raw) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    live.remove(&raw);
                }
                None => error!(raw, "release of an untracked handle"),
            }
        }
        self.vm.release(raw);
        if let Some(message) = self.vm.take_failure() {
            error!(raw, %message, "foreign failure during handle release");
        }
    }

    pub(crate) fn live_roots(&self) -> Vec<RawRef> {
        self.live.lock().keys().copied().collect()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn mark_detached(&self) {
        self.attached.store(false, Ordering::Release);
    }
}

/// One attached bridge session over a host runtime.
///
/// All facades hand out values tied to this session; dropping the session
/// after its handles is the expected order, and handles that survive it leak
/// their foreign units with an error log instead of touching the detached
/// host.
pub struct Session {
    core: Arc<SessionCore>,
    registry: Arc<HandleRegistry>,
    bridge: Arc<CallBridge>,
    codec: Codec,
    detached: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Attaches to `vm` and eagerly resolves the fixed operation set.
    ///
    /// Binding is all-or-nothing: a single unresolvable member detaches
    /// again and returns the resolution error.
    pub fn attach(vm: Arc<dyn ForeignRuntime>) -> Result<Self> {
        vm.attach_thread();
        let core = Arc::new(SessionCore::new(vm));
        let registry = Arc::new(HandleRegistry::new(Arc::clone(&core)));
        let bridge = Arc::new(CallBridge::new(Arc::clone(&core)));

        for (class, member, signature, kind) in facade::EAGER_BINDINGS {
            if let Err(err) = bridge.resolve(class, member, signature, *kind) {
                error!(%class, %member, %signature, "eager binding failed, aborting attach");
                bridge.clear();
                registry.clear();
                core.mark_detached();
                core.vm().detach_thread();
                return Err(err);
            }
        }
        info!(bindings = facade::EAGER_BINDINGS.len(), "session attached");

        let codec = Codec::new(Arc::clone(&bridge), Arc::clone(&registry));
        Ok(Self {
            core,
            registry,
            bridge,
            codec,
            detached: AtomicBool::new(false),
        })
    }

    /// Formula construction over the host factory.
    pub fn formula_factory(&self) -> FormulaFactory {
        FormulaFactory::new(self.codec.clone())
    }

    /// Formula rewriting passes.
    pub fn formula_rewriter(&self) -> FormulaRewriter {
        FormulaRewriter::new(self.codec.clone())
    }

    /// Automaton construction and queries.
    pub fn automata(&self) -> AutomatonFactory {
        AutomatonFactory::new(self.codec.clone())
    }

    /// The typed conversion layer of this session.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// The live-handle registry of this session.
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// The member-resolution cache of this session.
    pub fn bridge(&self) -> &CallBridge {
        &self.bridge
    }

    /// Runs the provider half of a root exchange on the calling thread,
    /// answering each collector request with the current live handle set.
    ///
    /// Blocks until [`RootExchangeCoordinator::shutdown`] is called.
    pub fn serve_roots(&self, coordinator: &RootExchangeCoordinator) {
        coordinator.provide(|| self.core.live_roots());
    }

    /// Detaches from the host eagerly. Equivalent to dropping the session.
    pub fn detach(self) {
        drop(self);
    }

    fn detach_inner(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let live = self.core.live_count();
        if live > 0 {
            warn!(live, "detaching with live handles; their units will leak");
        }
        self.bridge.clear();
        self.registry.clear();
        self.core.mark_detached();
        self.core.vm().detach_thread();
        debug!("session detached");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.detach_inner();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use owl_vm::ForeignRuntime;
    use owl_vm::fake::FakeVm;

    use super::Session;
    use crate::error::BridgeError;

    /// An attached session over a fresh instrumented host.
    pub(crate) fn test_session() -> (Arc<FakeVm>, Session) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let vm = Arc::new(FakeVm::new());
        let session = Session::attach(vm.clone() as Arc<dyn ForeignRuntime>)
            .expect("attach against the scripted host");
        (vm, session)
    }

    #[test]
    fn test_attach_binds_the_fixed_operation_set() {
        let (vm, session) = test_session();

        assert!(session.bridge().cached_bindings() >= crate::facade::EAGER_BINDINGS.len());
        assert_eq!(
            vm.counters().resolutions as usize,
            session.bridge().cached_bindings()
        );
    }

    #[test]
    fn test_attach_and_detach_balance_thread_attachment() {
        let (vm, session) = test_session();
        drop(session);

        let counters = vm.counters();
        assert_eq!(counters.attached_threads, counters.detached_threads);
    }

    #[test]
    fn test_detach_releases_every_cached_class_reference() {
        let (vm, session) = test_session();

        let factory = session.formula_factory();
        let formula = factory.parse("F (a & b)", &["a".into(), "b".into()]).unwrap();
        drop(formula);
        drop(session);

        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_failed_eager_binding_aborts_attach() {
        let vm = Arc::new(FakeVm::new());
        vm.forget_member("owl/ltl/parser/LtlParser", "syntax");

        let err = Session::attach(vm.clone() as Arc<dyn ForeignRuntime>).unwrap_err();
        assert!(matches!(err, BridgeError::ResolutionFailure { .. }));

        let counters = vm.counters();
        assert_eq!(counters.attached_threads, counters.detached_threads);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_handles_outliving_the_session_leak_without_host_calls() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();
        let formula = factory.boolean_constant(false).unwrap();

        let releases_at_detach = {
            drop(session);
            vm.counters().releases
        };
        drop(formula);

        // No further release reached the host after detach.
        assert_eq!(vm.counters().releases, releases_at_detach);
        assert_eq!(vm.live_objects(), 1);
    }
}
