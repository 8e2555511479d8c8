//! End-to-end runs against the instrumented in-process host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use owl_bridge::{
    Acceptance, BridgeError, ConnectiveTag, ForeignClass, LabelledTree, RootExchangeCoordinator,
    Session,
};
use owl_vm::ForeignRuntime;
use owl_vm::fake::FakeVm;

fn attached() -> (Arc<FakeVm>, Session) {
    let vm = Arc::new(FakeVm::new());
    let session = Session::attach(vm.clone() as Arc<dyn ForeignRuntime>).expect("attach");
    (vm, session)
}

#[test]
fn test_formula_pipeline_conserves_every_reference_unit() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let rewriter = session.formula_rewriter();
        let automata = session.automata();

        let formula = factory
            .parse("G (req -> F grant)", &["req".into(), "grant".into()])
            .expect("parse");
        assert_eq!(factory.text(&formula).expect("text"), "G (req -> F grant)");

        let simplified = rewriter.simplify(&formula).expect("simplify");
        let automaton = automata.of(&simplified).expect("translate");
        assert_eq!(
            automata.acceptance(&automaton).expect("acceptance"),
            Acceptance::ParityMinEven
        );

        let edges = automata.edges(&automaton, 1).expect("edges");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].successor, 0);
        assert_eq!(edges[0].colour, 0);
        assert_eq!(edges[1].successor, 1);
        assert_eq!(edges[1].colour, 1);
    }

    assert_eq!(session.registry().live_count(), 0);
    drop(session);

    // Everything the host handed out came back.
    assert_eq!(vm.live_objects(), 0);
    let counters = vm.counters();
    assert_eq!(counters.attached_threads, counters.detached_threads);
}

#[test]
fn test_formula_construction_composes_connectives() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let a = factory.literal(0).expect("literal");
        let b = factory.negated_literal(1).expect("negated literal");
        let until = factory.u_operator(&a, &b).expect("until");
        let always = factory.g_operator(&until).expect("globally");
        assert_eq!(factory.text(&always).expect("text"), "G(a0 U !a1)");

        let t = factory.boolean_constant(true).expect("constant");
        let implies = factory.implication(&t, &always).expect("implication");
        assert_eq!(
            factory.text(&implies).expect("text"),
            "(!true | G(a0 U !a1))"
        );

        let iff = factory.biimplication(&a, &b).expect("biimplication");
        assert_eq!(
            factory.text(&iff).expect("text"),
            "((!a0 | !a1) & (!!a1 | a0))"
        );
    }

    drop(session);
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn test_shift_literals_produces_a_dense_mapping() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let rewriter = session.formula_rewriter();

        // Atoms 2 and 5: sparse on purpose.
        let a = factory.literal(2).expect("literal");
        let b = factory.literal(5).expect("literal");
        let both = factory.conjunction(&a, &b).expect("conjunction");

        let (_shifted, mapping) = rewriter.shift_literals(&both).expect("shift");
        let expected: BTreeMap<i32, i32> = [(2, 0), (5, 1)].into_iter().collect();
        assert_eq!(mapping, expected);
    }

    drop(session);
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn test_split_returns_conjuncts_and_removed_literals() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let rewriter = session.formula_rewriter();

        let a = factory.literal(0).expect("literal");
        let b = factory.literal(1).expect("literal");
        let c = factory.literal(2).expect("literal");
        let ab = factory.conjunction(&a, &b).expect("conjunction");
        let abc = factory.conjunction(&ab, &c).expect("conjunction");

        let (parts, removed) = rewriter.split(&abc, 1).expect("split");
        assert_eq!(parts.len(), 3);
        let rendered: Vec<String> = parts
            .iter()
            .map(|part| factory.text(part).expect("text"))
            .collect();
        assert_eq!(rendered, vec!["a0", "a1", "a2"]);

        let expected: BTreeMap<i32, bool> = [(1, true)].into_iter().collect();
        assert_eq!(removed, expected);
    }

    drop(session);
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn test_decomposition_yields_a_labelled_automaton_tree() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let automata = session.automata();

        let a = factory.literal(0).expect("literal");
        let b = factory.literal(1).expect("literal");
        let c = factory.literal(2).expect("literal");
        let ab = factory.conjunction(&a, &b).expect("conjunction");
        let abc = factory.conjunction(&ab, &c).expect("conjunction");

        let tree = automata.decompose(&abc).expect("decompose");
        match &tree {
            LabelledTree::Node { label, children } => {
                assert_eq!(*label, ConnectiveTag::Conjunction);
                assert_eq!(children.len(), 3);
                for child in children {
                    let LabelledTree::Leaf(automaton) = child else {
                        panic!("expected a leaf automaton");
                    };
                    assert_eq!(
                        automata.acceptance(automaton).expect("acceptance"),
                        Acceptance::ParityMinEven
                    );
                }
            }
            LabelledTree::Leaf(_) => panic!("expected a decomposed node"),
        }

        // A formula without a top-level connective decomposes to a leaf.
        let single = automata.decompose(&a).expect("decompose");
        assert!(matches!(single, LabelledTree::Leaf(_)));
    }

    drop(session);
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn test_failure_mid_sequence_leaves_the_session_usable() {
    let (vm, session) = attached();

    {
        let factory = session.formula_factory();
        let rewriter = session.formula_rewriter();

        let formula = factory.literal(0).expect("literal");

        vm.inject_failure(
            "owl/ltl/rewriter/RewriterFactory",
            "apply",
            "owl.ltl.SimplifierException: depth limit",
        );
        let err = rewriter.simplify(&formula).expect_err("injected failure");
        match err {
            BridgeError::ForeignFailure(message) => {
                assert_eq!(message, "owl.ltl.SimplifierException: depth limit");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // The failure drained with the crossing: the session keeps working.
        assert!(!vm.failure_pending());
        let simplified = rewriter.simplify(&formula).expect("simplify");
        assert_eq!(factory.text(&simplified).expect("text"), "a0");
    }

    drop(session);
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn test_root_exchange_reports_live_handles() {
    let (vm, session) = attached();
    let factory = session.formula_factory();

    let a = factory.literal(0).expect("literal");
    let b = factory.literal(1).expect("literal");
    let coordinator = RootExchangeCoordinator::new();

    thread::scope(|scope| {
        scope.spawn(|| session.serve_roots(&coordinator));

        let first = coordinator.collect();
        let mut roots = first.roots().to_vec();
        roots.sort_unstable();
        let mut expected = vec![a.handle().raw(), b.handle().raw()];
        expected.sort_unstable();
        assert_eq!(roots, expected);

        // Dropping a handle shrinks the next snapshot.
        drop(a);
        let second = coordinator.collect();
        assert!(second.seq() > first.seq());
        assert_eq!(second.roots(), &[b.handle().raw()]);

        coordinator.shutdown();
    });

    drop(b);
    drop(session);
    assert_eq!(vm.live_objects(), 0);
}
