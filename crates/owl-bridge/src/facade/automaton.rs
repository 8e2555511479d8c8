//! Automaton construction and query facade.

use std::fmt;

use owl_vm::{MemberKind, NULL_REF, RawValue};

use crate::codec::{Codec, ConversionTag, ForeignClass, ForeignEnum, FromForeign, ToForeign};
use crate::error::{BridgeError, Result};
use crate::facade::formula::Formula;
use crate::handle::Handle;
use crate::tree::LabelledTree;

/// A deterministic parity automaton held by the host.
pub struct Automaton {
    handle: Handle,
}

impl ForeignClass for Automaton {
    const CLASS: &'static str = "owl/cinterface/DeterministicAutomatonWrapper";

    fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl FromForeign for Automaton {
    const TAG: ConversionTag = ConversionTag::DomainHandle;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        cx.decode_handle(value)
    }
}

impl fmt::Debug for Automaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Automaton").field("handle", &self.handle).finish()
    }
}

/// Acceptance condition of a host automaton, mirrored by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Buchi,
    CoBuchi,
    CoSafety,
    ParityMaxEven,
    ParityMaxOdd,
    ParityMinEven,
    ParityMinOdd,
    Safety,
}

impl ForeignEnum for Acceptance {
    const CLASS: &'static str = "owl/cinterface/Acceptance";
    const MEMBERS: &'static [&'static str] = &[
        "BUCHI",
        "CO_BUCHI",
        "CO_SAFETY",
        "PARITY_MAX_EVEN",
        "PARITY_MAX_ODD",
        "PARITY_MIN_EVEN",
        "PARITY_MIN_ODD",
        "SAFETY",
    ];

    fn from_ordinal(ordinal: i32) -> Option<Self> {
        Some(match ordinal {
            0 => Acceptance::Buchi,
            1 => Acceptance::CoBuchi,
            2 => Acceptance::CoSafety,
            3 => Acceptance::ParityMaxEven,
            4 => Acceptance::ParityMaxOdd,
            5 => Acceptance::ParityMinEven,
            6 => Acceptance::ParityMinOdd,
            7 => Acceptance::Safety,
            _ => return None,
        })
    }

    fn ordinal(self) -> i32 {
        self as i32
    }
}

impl FromForeign for Acceptance {
    const TAG: ConversionTag = ConversionTag::Enum;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        cx.decode_enum(value)
    }
}

impl ToForeign for Acceptance {
    const TAG: ConversionTag = ConversionTag::Enum;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        cx.encode_enum(*self)
    }
}

/// Connective labelling an internal node of a decomposed automaton tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectiveTag {
    Conjunction,
    Disjunction,
}

impl ForeignEnum for ConnectiveTag {
    const CLASS: &'static str = "owl/cinterface/Tag";
    const MEMBERS: &'static [&'static str] = &["CONJUNCTION", "DISJUNCTION"];

    fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(ConnectiveTag::Conjunction),
            1 => Some(ConnectiveTag::Disjunction),
            _ => None,
        }
    }

    fn ordinal(self) -> i32 {
        self as i32
    }
}

impl FromForeign for ConnectiveTag {
    const TAG: ConversionTag = ConversionTag::Enum;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        cx.decode_enum(value)
    }
}

impl ToForeign for ConnectiveTag {
    const TAG: ConversionTag = ConversionTag::Enum;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        cx.encode_enum(*self)
    }
}

/// One labelled transition of a deterministic automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub successor: i32,
    pub colour: i32,
}

/// Builds automata from formulas and answers structural queries.
pub struct AutomatonFactory {
    codec: Codec,
}

impl AutomatonFactory {
    pub(crate) fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Translates a formula into a deterministic automaton.
    pub fn of(&self, formula: &Formula) -> Result<Automaton> {
        let binding = self.codec.bridge().resolve(
            Automaton::CLASS,
            "of",
            "(Lowl/ltl/Formula;)Lowl/cinterface/DeterministicAutomatonWrapper;",
            MemberKind::StaticMethod,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, NULL_REF, &[RawValue::Ref(formula.handle().raw())])?;
        self.codec.decode_handle(value)
    }

    pub fn acceptance(&self, automaton: &Automaton) -> Result<Acceptance> {
        let binding = self.codec.bridge().resolve(
            Automaton::CLASS,
            "acceptance",
            "()Lowl/cinterface/Acceptance;",
            MemberKind::Method,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, automaton.handle().raw(), &[])?;
        self.codec.decode_enum(value)
    }

    /// Outgoing edges of `state`, one per letter, in letter order.
    pub fn edges(&self, automaton: &Automaton, state: i32) -> Result<Vec<Edge>> {
        let binding = self.codec.bridge().resolve(
            Automaton::CLASS,
            "edges",
            "(I)[I",
            MemberKind::Method,
        )?;
        let value = self.codec.bridge().invoke(
            &binding,
            automaton.handle().raw(),
            &[RawValue::Int(state)],
        )?;
        let table = {
            let guard = self.codec.expect_ref(value, ConversionTag::Sequence)?;
            self.codec.vm().read_int_array(guard.raw())
        };

        // Flat (successor, colour) pairs.
        if table.len() % 2 != 0 {
            return Err(BridgeError::TypeMismatch {
                expected: "edge table of (successor, colour) pairs".to_string(),
                actual: format!("{} entries", table.len()),
            });
        }
        Ok(table
            .chunks_exact(2)
            .map(|pair| Edge {
                successor: pair[0],
                colour: pair[1],
            })
            .collect())
    }

    /// Decomposes a formula into a tree of automata, labelled by the
    /// boolean connective joining each subtree.
    pub fn decompose(&self, formula: &Formula) -> Result<LabelledTree<ConnectiveTag, Automaton>> {
        let binding = self.codec.bridge().resolve(
            "owl/cinterface/DecomposedDPA",
            "of",
            "(Lowl/ltl/Formula;)Lowl/collections/LabelledTree;",
            MemberKind::StaticMethod,
        )?;
        let value = self
            .codec
            .bridge()
            .invoke(&binding, NULL_REF, &[RawValue::Ref(formula.handle().raw())])?;
        self.codec.decode(value)
    }
}

#[cfg(test)]
mod tests {
    use owl_vm::{ForeignRuntime, RawValue};

    use super::{Acceptance, Automaton, ConnectiveTag};
    use crate::codec::ForeignClass;
    use crate::error::BridgeError;
    use crate::session::tests::test_session;

    #[test]
    fn test_acceptance_round_trips_through_the_host() {
        let (vm, session) = test_session();
        let codec = session.codec();

        for acceptance in [
            Acceptance::Buchi,
            Acceptance::CoBuchi,
            Acceptance::ParityMinEven,
            Acceptance::Safety,
        ] {
            let encoded = codec.encode(&acceptance).unwrap();
            let decoded: Acceptance = codec.decode(encoded).unwrap();
            assert_eq!(decoded, acceptance);
        }

        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_connective_tag_round_trips_through_the_host() {
        let (vm, session) = test_session();
        let codec = session.codec();

        for tag in [ConnectiveTag::Conjunction, ConnectiveTag::Disjunction] {
            let encoded = codec.encode(&tag).unwrap();
            let decoded: ConnectiveTag = codec.decode(encoded).unwrap();
            assert_eq!(decoded, tag);
        }

        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_decoding_a_formula_as_an_automaton_names_both_classes() {
        let (vm, session) = test_session();
        let factory = session.formula_factory();

        let formula = factory.literal(0).unwrap();
        let raw = vm.retain(formula.handle().raw());

        let err = session
            .codec()
            .decode_handle::<Automaton>(RawValue::Ref(raw))
            .unwrap_err();
        match err {
            BridgeError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, Automaton::CLASS);
                assert_eq!(actual, "owl/ltl/Formula");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        drop(formula);
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }
}

