//! Formula construction and rewriting facades.

use std::collections::BTreeMap;
use std::fmt;

use owl_vm::{MemberKind, NULL_REF, RawValue};

use crate::codec::{Codec, ConversionTag, ForeignClass, FromForeign};
use crate::error::Result;
use crate::handle::Handle;

/// A linear-temporal-logic formula living on the host side.
///
/// Formulas are opaque: structure queries go back through the session
/// facades. Move-only, like every handle-backed type.
pub struct Formula {
    handle: Handle,
}

impl ForeignClass for Formula {
    const CLASS: &'static str = "owl/ltl/Formula";

    fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl FromForeign for Formula {
    const TAG: ConversionTag = ConversionTag::DomainHandle;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        cx.decode_handle(value)
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula").field("handle", &self.handle).finish()
    }
}

/// Builds formulas through the host factory, one host constructor per
/// connective plus a parser entry point.
pub struct FormulaFactory {
    codec: Codec,
}

impl FormulaFactory {
    pub(crate) fn new(codec: Codec) -> Self {
        Self { codec }
    }

    fn create_static(&self, class: &str, member: &str, signature: &str, args: &[RawValue]) -> Result<Formula> {
        let binding =
            self.codec
                .bridge()
                .resolve(class, member, signature, MemberKind::StaticMethod)?;
        let value = self.codec.bridge().invoke(&binding, NULL_REF, args)?;
        self.codec.decode_handle(value)
    }

    fn unary(&self, class: &str, operand: &Formula) -> Result<Formula> {
        self.create_static(
            class,
            "create",
            "(Lowl/ltl/Formula;)Lowl/ltl/Formula;",
            &[RawValue::Ref(operand.handle().raw())],
        )
    }

    fn binary(&self, class: &str, left: &Formula, right: &Formula) -> Result<Formula> {
        self.create_static(
            class,
            "create",
            "(Lowl/ltl/Formula;Lowl/ltl/Formula;)Lowl/ltl/Formula;",
            &[
                RawValue::Ref(left.handle().raw()),
                RawValue::Ref(right.handle().raw()),
            ],
        )
    }

    pub fn boolean_constant(&self, value: bool) -> Result<Formula> {
        self.create_static(
            "owl/ltl/BooleanConstant",
            "get",
            "(Z)Lowl/ltl/BooleanConstant;",
            &[RawValue::Bool(value)],
        )
    }

    pub fn literal(&self, atom: i32) -> Result<Formula> {
        self.create_static(
            "owl/ltl/Literal",
            "create",
            "(IZ)Lowl/ltl/Literal;",
            &[RawValue::Int(atom), RawValue::Bool(false)],
        )
    }

    pub fn negated_literal(&self, atom: i32) -> Result<Formula> {
        self.create_static(
            "owl/ltl/Literal",
            "create",
            "(IZ)Lowl/ltl/Literal;",
            &[RawValue::Int(atom), RawValue::Bool(true)],
        )
    }

    /// Finally.
    pub fn f_operator(&self, operand: &Formula) -> Result<Formula> {
        self.unary("owl/ltl/FOperator", operand)
    }

    /// Globally.
    pub fn g_operator(&self, operand: &Formula) -> Result<Formula> {
        self.unary("owl/ltl/GOperator", operand)
    }

    /// Next.
    pub fn x_operator(&self, operand: &Formula) -> Result<Formula> {
        self.unary("owl/ltl/XOperator", operand)
    }

    pub fn conjunction(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/Conjunction", left, right)
    }

    pub fn disjunction(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/Disjunction", left, right)
    }

    /// Until.
    pub fn u_operator(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/UOperator", left, right)
    }

    /// Release.
    pub fn r_operator(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/ROperator", left, right)
    }

    /// Weak until.
    pub fn w_operator(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/WOperator", left, right)
    }

    /// Strong release.
    pub fn m_operator(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        self.binary("owl/ltl/MOperator", left, right)
    }

    pub fn negation(&self, operand: &Formula) -> Result<Formula> {
        let binding = self.codec.bridge().resolve(
            "owl/ltl/Formula",
            "not",
            "()Lowl/ltl/Formula;",
            MemberKind::Method,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, operand.handle().raw(), &[])?;
        self.codec.decode_handle(value)
    }

    /// `left -> right`, derived as `!left | right`.
    pub fn implication(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        let negated = self.negation(left)?;
        self.disjunction(&negated, right)
    }

    /// `left <-> right`, derived as `(left -> right) & (right -> left)`.
    pub fn biimplication(&self, left: &Formula, right: &Formula) -> Result<Formula> {
        let forward = self.implication(left, right)?;
        let backward = self.implication(right, left)?;
        self.conjunction(&forward, &backward)
    }

    /// Parses LTL syntax against a fixed atom ordering.
    pub fn parse(&self, text: &str, atoms: &[String]) -> Result<Formula> {
        let text_value = self.codec.encode(text)?;
        let text_guard = self.codec.expect_ref(text_value, ConversionTag::Str)?;
        let atoms_value = self.codec.encode(atoms)?;
        let atoms_guard = self.codec.expect_ref(atoms_value, ConversionTag::Sequence)?;

        let binding = self.codec.bridge().resolve(
            "owl/ltl/parser/LtlParser",
            "syntax",
            "(Ljava/lang/String;Ljava/util/List;)Lowl/ltl/Formula;",
            MemberKind::StaticMethod,
        )?;
        let value = self.codec.bridge().invoke(
            &binding,
            NULL_REF,
            &[
                RawValue::Ref(text_guard.raw()),
                RawValue::Ref(atoms_guard.raw()),
            ],
        )?;
        self.codec.decode_handle(value)
    }

    /// The host's textual rendering of `formula`.
    pub fn text(&self, formula: &Formula) -> Result<String> {
        let binding = self.codec.bridge().resolve(
            "owl/ltl/Formula",
            "toString",
            "()Ljava/lang/String;",
            MemberKind::Method,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, formula.handle().raw(), &[])?;
        self.codec.decode(value)
    }
}

/// Rewriting passes over host formulas.
pub struct FormulaRewriter {
    codec: Codec,
}

impl FormulaRewriter {
    pub(crate) fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// The host's general-purpose simplifier.
    pub fn simplify(&self, formula: &Formula) -> Result<Formula> {
        let binding = self.codec.bridge().resolve(
            "owl/ltl/rewriter/RewriterFactory",
            "apply",
            "(Lowl/ltl/Formula;)Lowl/ltl/Formula;",
            MemberKind::StaticMethod,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, NULL_REF, &[RawValue::Ref(formula.handle().raw())])?;
        self.codec.decode_handle(value)
    }

    /// Renumbers literals densely. Returns the shifted formula and the
    /// old-atom to new-atom mapping; atoms absent from the formula do not
    /// appear in the mapping.
    pub fn shift_literals(&self, formula: &Formula) -> Result<(Formula, BTreeMap<i32, i32>)> {
        let shift = self.codec.bridge().resolve(
            "owl/ltl/rewriter/ShiftRewriter",
            "shiftLiterals",
            "(Lowl/ltl/Formula;)Lowl/ltl/rewriter/ShiftRewriter$ShiftedFormula;",
            MemberKind::StaticMethod,
        )?;
        let shifted_value = self
            .codec
            .bridge()
            .invoke(&shift, NULL_REF, &[RawValue::Ref(formula.handle().raw())])?;
        let shifted = self
            .codec
            .expect_ref(shifted_value, ConversionTag::DomainHandle)?;

        let formula_field = self.codec.bridge().resolve(
            "owl/ltl/rewriter/ShiftRewriter$ShiftedFormula",
            "formula",
            "Lowl/ltl/Formula;",
            MemberKind::Field,
        )?;
        let shifted_formula: Formula = {
            let value = self.codec.bridge().invoke(&formula_field, shifted.raw(), &[])?;
            self.codec.decode_handle(value)?
        };

        let mapping_field = self.codec.bridge().resolve(
            "owl/ltl/rewriter/ShiftRewriter$ShiftedFormula",
            "mapping",
            "[I",
            MemberKind::Field,
        )?;
        let mapping_value = self.codec.bridge().invoke(&mapping_field, shifted.raw(), &[])?;
        let table = {
            let mapping_guard = self
                .codec
                .expect_ref(mapping_value, ConversionTag::Sequence)?;
            self.codec.vm().read_int_array(mapping_guard.raw())
        };

        // Dense table indexed by old atom; -1 marks an unused atom.
        let mapping = table
            .into_iter()
            .enumerate()
            .filter(|(_, dense)| *dense >= 0)
            .map(|(atom, dense)| (atom as i32, dense))
            .collect();
        Ok((shifted_formula, mapping))
    }

    /// Splits a formula into independently realizable conjuncts.
    ///
    /// Atoms at positions `<= last_input_atom` are inputs, the rest outputs.
    /// Returns the parts and the map of literals the pass removed, keyed by
    /// atom with the polarity it fixed.
    pub fn split(
        &self,
        formula: &Formula,
        last_input_atom: i32,
    ) -> Result<(Vec<Formula>, BTreeMap<i32, bool>)> {
        let map_ctor = self.codec.bridge().resolve(
            "java/util/HashMap",
            "<init>",
            "()V",
            MemberKind::Constructor,
        )?;
        let removed_value = self.codec.bridge().invoke(&map_ctor, NULL_REF, &[])?;
        let removed_guard = self.codec.expect_ref(removed_value, ConversionTag::Map)?;

        let split = self.codec.bridge().resolve(
            "owl/ltl/rewriter/RealizabilityRewriter",
            "split",
            "(Lowl/ltl/Formula;ILjava/util/Map;)[Lowl/ltl/Formula;",
            MemberKind::StaticMethod,
        )?;
        let array_value = self.codec.bridge().invoke(
            &split,
            NULL_REF,
            &[
                RawValue::Ref(formula.handle().raw()),
                RawValue::Int(last_input_atom),
                RawValue::Ref(removed_guard.raw()),
            ],
        )?;
        let array = self
            .codec
            .expect_ref(array_value, ConversionTag::Sequence)?;

        let length = self.codec.vm().array_length(array.raw());
        let mut parts = Vec::with_capacity(length as usize);
        for index in 0..length {
            let element = self.codec.vm().array_element(array.raw(), index);
            let element = self.codec.guard_crossing(element, "split part")?;
            parts.push(self.codec.decode_handle(RawValue::Ref(element.into_raw()))?);
        }

        let removed: BTreeMap<i32, bool> = self
            .codec
            .decode(RawValue::Ref(removed_guard.into_raw()))?;
        Ok((parts, removed))
    }
}
