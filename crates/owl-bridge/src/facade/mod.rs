//! Typed entry points over the host reasoning engine.
//!
//! Facades never expose raw references or member tokens; everything they
//! return is either a native value or a domain handle. The member table
//! below is resolved in full during session attach, so a facade call can
//! only fail on the crossing itself, never on a missing binding.

mod automaton;
mod formula;

pub use automaton::{Acceptance, Automaton, AutomatonFactory, ConnectiveTag, Edge};
pub use formula::{Formula, FormulaFactory, FormulaRewriter};

use owl_vm::MemberKind;

const FORMULA_SIG: &str = "Lowl/ltl/Formula;";

/// Every host member the facades touch, bound eagerly at attach.
pub(crate) const EAGER_BINDINGS: &[(&str, &str, &str, MemberKind)] = &[
    (
        "owl/ltl/BooleanConstant",
        "get",
        "(Z)Lowl/ltl/BooleanConstant;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/Literal",
        "create",
        "(IZ)Lowl/ltl/Literal;",
        MemberKind::StaticMethod,
    ),
    ("owl/ltl/FOperator", "create", "(Lowl/ltl/Formula;)Lowl/ltl/Formula;", MemberKind::StaticMethod),
    ("owl/ltl/GOperator", "create", "(Lowl/ltl/Formula;)Lowl/ltl/Formula;", MemberKind::StaticMethod),
    ("owl/ltl/XOperator", "create", "(Lowl/ltl/Formula;)Lowl/ltl/Formula;", MemberKind::StaticMethod),
    (
        "owl/ltl/Conjunction",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/Disjunction",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/UOperator",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/ROperator",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/WOperator",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/MOperator",
        "create",
        "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    ("owl/ltl/Formula", "not", "()Lowl/ltl/Formula;", MemberKind::Method),
    ("owl/ltl/Formula", "toString", "()Ljava/lang/String;", MemberKind::Method),
    (
        "owl/ltl/parser/LtlParser",
        "syntax",
        "(Ljava/lang/String;Ljava/util/List;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/rewriter/RewriterFactory",
        "apply",
        "(Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/rewriter/ShiftRewriter",
        "shiftLiterals",
        "(Lowl/ltl/Formula;)Lowl/ltl/rewriter/ShiftRewriter$ShiftedFormula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/ltl/rewriter/ShiftRewriter$ShiftedFormula",
        "formula",
        FORMULA_SIG,
        MemberKind::Field,
    ),
    ("owl/ltl/rewriter/ShiftRewriter$ShiftedFormula", "mapping", "[I", MemberKind::Field),
    (
        "owl/ltl/rewriter/RealizabilityRewriter",
        "split",
        "(Lowl/ltl/Formula;ILjava/util/Map;)[Lowl/ltl/Formula;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/cinterface/DeterministicAutomatonWrapper",
        "of",
        "(Lowl/ltl/Formula;)Lowl/cinterface/DeterministicAutomatonWrapper;",
        MemberKind::StaticMethod,
    ),
    (
        "owl/cinterface/DeterministicAutomatonWrapper",
        "acceptance",
        "()Lowl/cinterface/Acceptance;",
        MemberKind::Method,
    ),
    ("owl/cinterface/DeterministicAutomatonWrapper", "edges", "(I)[I", MemberKind::Method),
    (
        "owl/cinterface/DecomposedDPA",
        "of",
        "(Lowl/ltl/Formula;)Lowl/collections/LabelledTree;",
        MemberKind::StaticMethod,
    ),
];
