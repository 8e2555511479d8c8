//! In-process scripted host runtime used by tests across the workspace.
//!
//! [`FakeVm`] implements [`ForeignRuntime`] over an object table with real
//! per-object reference counts, so tests can verify the bridge's ownership
//! discipline exactly: every retain, release, and resolution is counted, and
//! failures can be injected on specific members to exercise the drain
//! protocol.
//!
//! The fake scripts the host classes the bridge speaks to: the collection
//! and iterator protocols, boxed scalars, enums, labelled trees, and the owl
//! domain classes (formulas as small symbolic terms, automata with a fixed
//! two-letter edge table). Behavior is deterministic; it models the protocol
//! shape of the real engine, not its semantics.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::{ForeignRuntime, MemberId, MemberKind, NULL_REF, RawRef, RawValue, VmOptions};

const ACCEPTANCE_MEMBERS: &[&str] = &[
    "BUCHI",
    "CO_BUCHI",
    "CO_SAFETY",
    "PARITY_MAX_EVEN",
    "PARITY_MAX_ODD",
    "PARITY_MIN_EVEN",
    "PARITY_MIN_ODD",
    "SAFETY",
];

const TAG_MEMBERS: &[&str] = &["CONJUNCTION", "DISJUNCTION"];

const PARITY_MIN_EVEN: i32 = 5;

/// Snapshot of the fake's instrumentation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeCounters {
    /// Member resolutions performed (cache hits in the bridge never reach
    /// the fake, so this is the probe for resolution idempotence).
    pub resolutions: u64,
    pub retains: u64,
    pub releases: u64,
    pub attached_threads: u64,
    pub detached_threads: u64,
}

/// A symbolic formula term. The fake only needs enough structure for the
/// rewriter and decomposition scripts to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    True,
    False,
    Lit { atom: i32, negated: bool },
    Unary(char, Box<Term>),
    Binary(char, Box<Term>, Box<Term>),
    Parsed(String),
}

impl Term {
    fn render(&self) -> String {
        match self {
            Term::True => "true".to_string(),
            Term::False => "false".to_string(),
            Term::Lit { atom, negated: false } => format!("a{atom}"),
            Term::Lit { atom, negated: true } => format!("!a{atom}"),
            Term::Unary(op, inner) => format!("{op}{}", inner.render()),
            Term::Binary(op, left, right) => {
                format!("({} {} {})", left.render(), op, right.render())
            }
            Term::Parsed(text) => text.clone(),
        }
    }

    fn atoms_into(&self, out: &mut Vec<i32>) {
        match self {
            Term::Lit { atom, .. } => {
                if !out.contains(atom) {
                    out.push(*atom);
                }
            }
            Term::Unary(_, inner) => inner.atoms_into(out),
            Term::Binary(_, left, right) => {
                left.atoms_into(out);
                right.atoms_into(out);
            }
            Term::True | Term::False | Term::Parsed(_) => {}
        }
    }

    /// Flattens nested applications of `op` into an operand list.
    fn operands(&self, op: char) -> Vec<Term> {
        match self {
            Term::Binary(found, left, right) if *found == op => {
                let mut out = left.operands(op);
                out.extend(right.operands(op));
                out
            }
            other => vec![other.clone()],
        }
    }
}

#[derive(Debug, Clone)]
enum ObjKind {
    Class { name: String },
    Bool(bool),
    Int(i32),
    Str(String),
    List(Vec<RawRef>),
    MapObj(Vec<(RawRef, RawRef)>),
    Entry(RawRef, RawRef),
    Iter { items: Vec<RawRef>, pos: usize },
    EnumVal(i32),
    IntArray(Vec<i32>),
    ObjArray(Vec<RawRef>),
    TreeLeaf(RawRef),
    TreeNode { label: RawRef, children: RawRef },
    Formula(Term),
    Automaton { acceptance: i32 },
    Shifted { formula: RawRef, mapping: RawRef },
}

struct Obj {
    refs: u32,
    class: RawRef,
    kind: ObjKind,
}

#[derive(Debug, Clone)]
struct MemberDef {
    class: RawRef,
    kind: MemberKind,
    name: String,
}

struct Injection {
    class: String,
    member: String,
    message: String,
}

#[derive(Default)]
struct Inner {
    next_ref: RawRef,
    next_member: MemberId,
    objects: HashMap<RawRef, Obj>,
    classes: HashMap<String, RawRef>,
    enum_members: HashMap<String, &'static [&'static str]>,
    members: HashMap<MemberId, MemberDef>,
    member_ids: HashMap<(RawRef, MemberKind, String, String), MemberId>,
    pending: Option<String>,
    injections: Vec<Injection>,
    forgotten: Vec<(String, String)>,
    counters: FakeCounters,
}

/// The scripted in-process host.
pub struct FakeVm {
    inner: Mutex<Inner>,
    options: VmOptions,
}

impl Default for FakeVm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVm {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    #[must_use]
    pub fn with_options(options: VmOptions) -> Self {
        let mut inner = Inner::default();
        inner.bootstrap();
        Self {
            inner: Mutex::new(inner),
            options,
        }
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn counters(&self) -> FakeCounters {
        self.inner.lock().counters
    }

    /// Current reference count of an object, `None` once it has died.
    pub fn refs_of(&self, raw: RawRef) -> Option<u32> {
        self.inner.lock().objects.get(&raw).map(|o| o.refs)
    }

    /// Number of live non-class objects.
    pub fn live_objects(&self) -> usize {
        self.inner
            .lock()
            .objects
            .values()
            .filter(|o| !matches!(o.kind, ObjKind::Class { .. }))
            .count()
    }

    /// Hides `class.member` so that resolving it fails.
    pub fn forget_member(&self, class: &str, member: &str) {
        self.inner
            .lock()
            .forgotten
            .push((class.to_string(), member.to_string()));
    }

    /// Makes the next invocation of `class.member` fail with `message`.
    pub fn inject_failure(&self, class: &str, member: &str, message: &str) {
        self.inner.lock().injections.push(Injection {
            class: class.to_string(),
            member: member.to_string(),
            message: message.to_string(),
        });
    }

    // Test-construction helpers. Unlike host calls, these CONSUME the
    // reference units of the objects passed in: the new container owns them.

    pub fn make_boolean(&self, value: bool) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id("java/lang/Boolean");
        inner.alloc(class, ObjKind::Bool(value))
    }

    pub fn make_integer(&self, value: i32) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id("java/lang/Integer");
        inner.alloc(class, ObjKind::Int(value))
    }

    pub fn make_list(&self, items: Vec<RawRef>) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id("java/util/ArrayList");
        inner.alloc(class, ObjKind::List(items))
    }

    pub fn make_map(&self, pairs: Vec<(RawRef, RawRef)>) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id("java/util/HashMap");
        inner.alloc(class, ObjKind::MapObj(pairs))
    }

    pub fn make_leaf(&self, label: RawRef) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id("owl/collections/LabelledTree$Leaf");
        inner.alloc(class, ObjKind::TreeLeaf(label))
    }

    pub fn make_node(&self, label: RawRef, children: Vec<RawRef>) -> RawRef {
        let mut inner = self.inner.lock();
        let list_class = inner.class_id("java/util/ArrayList");
        let list = inner.alloc(list_class, ObjKind::List(children));
        let class = inner.class_id("owl/collections/LabelledTree$Node");
        inner.alloc(class, ObjKind::TreeNode { label, children: list })
    }

    pub fn make_enum(&self, class: &str, ordinal: i32) -> RawRef {
        let mut inner = self.inner.lock();
        let class = inner.class_id(class);
        inner.alloc(class, ObjKind::EnumVal(ordinal))
    }
}

impl Inner {
    fn bootstrap(&mut self) {
        let classes = [
            "java/lang/Boolean",
            "java/lang/Integer",
            "java/lang/String",
            "java/lang/Enum",
            "java/util/ArrayList",
            "java/util/List",
            "java/util/Iterator",
            "java/util/HashMap",
            "java/util/Map",
            "java/util/Set",
            "java/util/Map$Entry",
            "[I",
            "[Ljava/lang/Object;",
            "owl/collections/LabelledTree$Leaf",
            "owl/collections/LabelledTree$Node",
            "owl/ltl/Formula",
            "owl/ltl/BooleanConstant",
            "owl/ltl/Literal",
            "owl/ltl/Conjunction",
            "owl/ltl/Disjunction",
            "owl/ltl/FOperator",
            "owl/ltl/GOperator",
            "owl/ltl/XOperator",
            "owl/ltl/UOperator",
            "owl/ltl/ROperator",
            "owl/ltl/WOperator",
            "owl/ltl/MOperator",
            "owl/ltl/parser/LtlParser",
            "owl/ltl/rewriter/RewriterFactory",
            "owl/ltl/rewriter/ShiftRewriter",
            "owl/ltl/rewriter/ShiftRewriter$ShiftedFormula",
            "owl/ltl/rewriter/RealizabilityRewriter",
            "owl/cinterface/DeterministicAutomatonWrapper",
            "owl/cinterface/DecomposedDPA",
            "owl/cinterface/Acceptance",
            "owl/cinterface/Tag",
        ];
        for name in classes {
            self.next_ref += 1;
            let raw = self.next_ref;
            self.objects.insert(
                raw,
                Obj {
                    refs: 1,
                    class: raw,
                    kind: ObjKind::Class { name: name.to_string() },
                },
            );
            self.classes.insert(name.to_string(), raw);
        }
        self.enum_members
            .insert("owl/cinterface/Acceptance".to_string(), ACCEPTANCE_MEMBERS);
        self.enum_members.insert("owl/cinterface/Tag".to_string(), TAG_MEMBERS);
    }

    fn assert_no_pending(&self, operation: &str) {
        assert!(
            self.pending.is_none(),
            "host operation `{operation}` with a failure still pending: {:?}",
            self.pending
        );
    }

    fn pend(&mut self, message: String) {
        self.pending = Some(message);
    }

    fn class_id(&self, name: &str) -> RawRef {
        *self
            .classes
            .get(name)
            .unwrap_or_else(|| panic!("fake host has no class {name}"))
    }

    fn class_name_of(&self, class: RawRef) -> String {
        match &self.objects[&class].kind {
            ObjKind::Class { name } => name.clone(),
            other => panic!("reference {class} is not a class: {other:?}"),
        }
    }

    fn alloc(&mut self, class: RawRef, kind: ObjKind) -> RawRef {
        self.next_ref += 1;
        let raw = self.next_ref;
        self.objects.insert(raw, Obj { refs: 1, class, kind });
        raw
    }

    fn retain_ref(&mut self, raw: RawRef) {
        self.counters.retains += 1;
        let obj = self
            .objects
            .get_mut(&raw)
            .unwrap_or_else(|| panic!("retain of dead reference {raw}"));
        obj.refs += 1;
    }

    fn release_ref(&mut self, raw: RawRef) {
        self.counters.releases += 1;
        let obj = self
            .objects
            .get_mut(&raw)
            .unwrap_or_else(|| panic!("release of dead reference {raw}"));
        assert!(obj.refs > 0, "reference count underflow on {raw}");
        obj.refs -= 1;
        if obj.refs == 0 {
            let obj = self.objects.remove(&raw).unwrap();
            trace!(raw, "object died");
            for child in owned_children(&obj.kind) {
                // Owned units cascade; counters only track boundary
                // operations, so bypass the release counter here.
                self.counters.releases -= 1;
                self.release_ref(child);
            }
        }
    }

    fn kind(&self, raw: RawRef) -> ObjKind {
        self.objects
            .get(&raw)
            .unwrap_or_else(|| panic!("access to dead reference {raw}"))
            .kind
            .clone()
    }

    fn term(&self, raw: RawRef) -> Term {
        match self.kind(raw) {
            ObjKind::Formula(term) => term,
            other => panic!("reference {raw} is not a formula: {other:?}"),
        }
    }

    fn new_formula(&mut self, term: Term) -> RawRef {
        let class = self.class_id("owl/ltl/Formula");
        self.alloc(class, ObjKind::Formula(term))
    }

    fn new_automaton(&mut self) -> RawRef {
        let class = self.class_id("owl/cinterface/DeterministicAutomatonWrapper");
        self.alloc(class, ObjKind::Automaton { acceptance: PARITY_MIN_EVEN })
    }

    fn take_injection(&mut self, class: &str, member: &str) -> Option<String> {
        let found = self
            .injections
            .iter()
            .position(|i| i.class == class && i.member == member)?;
        Some(self.injections.remove(found).message)
    }

    fn value_eq(&self, left: RawRef, right: RawRef) -> bool {
        match (self.kind(left), self.kind(right)) {
            (ObjKind::Bool(a), ObjKind::Bool(b)) => a == b,
            (ObjKind::Int(a), ObjKind::Int(b)) => a == b,
            (ObjKind::Str(a), ObjKind::Str(b)) => a == b,
            _ => left == right,
        }
    }

    fn arg_ref(args: &[RawValue], index: usize) -> RawRef {
        match args.get(index) {
            Some(RawValue::Ref(raw)) => *raw,
            other => panic!("expected reference argument at {index}, got {other:?}"),
        }
    }

    fn arg_int(args: &[RawValue], index: usize) -> i32 {
        match args.get(index) {
            Some(RawValue::Int(value)) => *value,
            other => panic!("expected int argument at {index}, got {other:?}"),
        }
    }

    fn arg_bool(args: &[RawValue], index: usize) -> bool {
        match args.get(index) {
            Some(RawValue::Bool(value)) => *value,
            other => panic!("expected bool argument at {index}, got {other:?}"),
        }
    }

    fn dispatch_call(
        &mut self,
        receiver: RawRef,
        member: &MemberDef,
        args: &[RawValue],
    ) -> RawValue {
        match member.name.as_str() {
            "booleanValue" => match self.kind(receiver) {
                ObjKind::Bool(value) => RawValue::Bool(value),
                other => panic!("booleanValue on {other:?}"),
            },
            "intValue" => match self.kind(receiver) {
                ObjKind::Int(value) => RawValue::Int(value),
                other => panic!("intValue on {other:?}"),
            },
            "ordinal" => match self.kind(receiver) {
                ObjKind::EnumVal(ordinal) => RawValue::Int(ordinal),
                other => panic!("ordinal on {other:?}"),
            },
            "add" => {
                let element = Self::arg_ref(args, 0);
                if element != NULL_REF {
                    self.retain_ref(element);
                }
                match &mut self.objects.get_mut(&receiver).unwrap().kind {
                    ObjKind::List(items) => items.push(element),
                    other => panic!("add on {other:?}"),
                }
                RawValue::Bool(true)
            }
            "iterator" => {
                let items = match self.kind(receiver) {
                    ObjKind::List(items) => items,
                    other => panic!("iterator on {other:?}"),
                };
                for item in &items {
                    if *item != NULL_REF {
                        self.retain_ref(*item);
                    }
                }
                let class = self.class_id("java/util/Iterator");
                RawValue::Ref(self.alloc(class, ObjKind::Iter { items, pos: 0 }))
            }
            "hasNext" => match self.kind(receiver) {
                ObjKind::Iter { items, pos } => RawValue::Bool(pos < items.len()),
                other => panic!("hasNext on {other:?}"),
            },
            "next" => {
                match &mut self.objects.get_mut(&receiver).unwrap().kind {
                    ObjKind::Iter { items, pos } => {
                        if *pos < items.len() {
                            let item = items[*pos];
                            *pos += 1;
                            // The iterator's unit transfers to the caller.
                            RawValue::Ref(item)
                        } else {
                            self.pend("iterator exhausted".to_string());
                            RawValue::NULL
                        }
                    }
                    other => panic!("next on {other:?}"),
                }
            }
            "entrySet" => {
                let pairs = match self.kind(receiver) {
                    ObjKind::MapObj(pairs) => pairs,
                    other => panic!("entrySet on {other:?}"),
                };
                let entry_class = self.class_id("java/util/Map$Entry");
                let mut entries = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    self.retain_ref(key);
                    self.retain_ref(value);
                    entries.push(self.alloc(entry_class, ObjKind::Entry(key, value)));
                }
                let set_class = self.class_id("java/util/Set");
                RawValue::Ref(self.alloc(set_class, ObjKind::List(entries)))
            }
            "put" => {
                let key = Self::arg_ref(args, 0);
                let value = Self::arg_ref(args, 1);
                let existing = match self.kind(receiver) {
                    ObjKind::MapObj(pairs) => {
                        pairs.iter().position(|(k, _)| self.value_eq(*k, key))
                    }
                    other => panic!("put on {other:?}"),
                };
                self.retain_ref(value);
                if let Some(index) = existing {
                    let previous = match &mut self.objects.get_mut(&receiver).unwrap().kind {
                        ObjKind::MapObj(pairs) => std::mem::replace(&mut pairs[index].1, value),
                        _ => unreachable!(),
                    };
                    // The map's unit on the previous value transfers out.
                    RawValue::Ref(previous)
                } else {
                    self.retain_ref(key);
                    match &mut self.objects.get_mut(&receiver).unwrap().kind {
                        ObjKind::MapObj(pairs) => pairs.push((key, value)),
                        _ => unreachable!(),
                    }
                    RawValue::NULL
                }
            }
            "getKey" | "getValue" => {
                let (key, value) = match self.kind(receiver) {
                    ObjKind::Entry(key, value) => (key, value),
                    other => panic!("entry access on {other:?}"),
                };
                let out = if member.name == "getKey" { key } else { value };
                self.retain_ref(out);
                RawValue::Ref(out)
            }
            "getLabel" => {
                let label = match self.kind(receiver) {
                    ObjKind::TreeLeaf(label) | ObjKind::TreeNode { label, .. } => label,
                    other => panic!("getLabel on {other:?}"),
                };
                self.retain_ref(label);
                RawValue::Ref(label)
            }
            "getChildren" => {
                let children = match self.kind(receiver) {
                    ObjKind::TreeNode { children, .. } => children,
                    other => panic!("getChildren on {other:?}"),
                };
                self.retain_ref(children);
                RawValue::Ref(children)
            }
            "not" => {
                let term = self.term(receiver);
                RawValue::Ref(self.new_formula(Term::Unary('!', Box::new(term))))
            }
            "toString" => {
                let text = self.term(receiver).render();
                let class = self.class_id("java/lang/String");
                RawValue::Ref(self.alloc(class, ObjKind::Str(text)))
            }
            "acceptance" => {
                let acceptance = match self.kind(receiver) {
                    ObjKind::Automaton { acceptance } => acceptance,
                    other => panic!("acceptance on {other:?}"),
                };
                let class = self.class_id("owl/cinterface/Acceptance");
                RawValue::Ref(self.alloc(class, ObjKind::EnumVal(acceptance)))
            }
            "edges" => {
                let state = Self::arg_int(args, 0);
                match self.kind(receiver) {
                    ObjKind::Automaton { .. } => {}
                    other => panic!("edges on {other:?}"),
                }
                // Two letters per state: a toggle edge and a self loop.
                let table = vec![(state + 1) % 2, 0, state, 1];
                let class = self.class_id("[I");
                RawValue::Ref(self.alloc(class, ObjKind::IntArray(table)))
            }
            other => panic!("unscripted instance member {other}"),
        }
    }

    fn dispatch_static(
        &mut self,
        owner: &str,
        member: &MemberDef,
        args: &[RawValue],
    ) -> RawValue {
        match (owner, member.name.as_str()) {
            ("java/lang/Boolean", "valueOf") => {
                let class = self.class_id("java/lang/Boolean");
                RawValue::Ref(self.alloc(class, ObjKind::Bool(Self::arg_bool(args, 0))))
            }
            ("java/lang/Integer", "valueOf") => {
                let class = self.class_id("java/lang/Integer");
                RawValue::Ref(self.alloc(class, ObjKind::Int(Self::arg_int(args, 0))))
            }
            ("owl/ltl/BooleanConstant", "get") => {
                let term = if Self::arg_bool(args, 0) { Term::True } else { Term::False };
                RawValue::Ref(self.new_formula(term))
            }
            ("owl/ltl/Literal", "create") => {
                let term = Term::Lit {
                    atom: Self::arg_int(args, 0),
                    negated: Self::arg_bool(args, 1),
                };
                RawValue::Ref(self.new_formula(term))
            }
            ("owl/ltl/FOperator" | "owl/ltl/GOperator" | "owl/ltl/XOperator", "create") => {
                let op = owner.as_bytes()["owl/ltl/".len()];
                let inner = self.term(Self::arg_ref(args, 0));
                RawValue::Ref(self.new_formula(Term::Unary(op as char, Box::new(inner))))
            }
            ("owl/ltl/Conjunction", "create") => self.binary_create('&', args),
            ("owl/ltl/Disjunction", "create") => self.binary_create('|', args),
            ("owl/ltl/UOperator", "create") => self.binary_create('U', args),
            ("owl/ltl/ROperator", "create") => self.binary_create('R', args),
            ("owl/ltl/WOperator", "create") => self.binary_create('W', args),
            ("owl/ltl/MOperator", "create") => self.binary_create('M', args),
            ("owl/ltl/parser/LtlParser", "syntax") => {
                let text = match self.kind(Self::arg_ref(args, 0)) {
                    ObjKind::Str(text) => text,
                    other => panic!("syntax on {other:?}"),
                };
                RawValue::Ref(self.new_formula(Term::Parsed(text)))
            }
            ("owl/ltl/rewriter/RewriterFactory", "apply") => {
                // Identity simplifier: hand back another unit on the input.
                let formula = Self::arg_ref(args, 0);
                self.retain_ref(formula);
                RawValue::Ref(formula)
            }
            ("owl/ltl/rewriter/ShiftRewriter", "shiftLiterals") => {
                let formula = Self::arg_ref(args, 0);
                let term = self.term(formula);
                let mut atoms = Vec::new();
                term.atoms_into(&mut atoms);
                atoms.sort_unstable();
                let mut mapping = vec![-1; atoms.last().map_or(0, |a| *a as usize + 1)];
                for (dense, atom) in atoms.iter().enumerate() {
                    mapping[*atom as usize] = dense as i32;
                }
                self.retain_ref(formula);
                let array_class = self.class_id("[I");
                let mapping = self.alloc(array_class, ObjKind::IntArray(mapping));
                let class = self.class_id("owl/ltl/rewriter/ShiftRewriter$ShiftedFormula");
                RawValue::Ref(self.alloc(class, ObjKind::Shifted { formula, mapping }))
            }
            ("owl/ltl/rewriter/RealizabilityRewriter", "split") => {
                let formula = Self::arg_ref(args, 0);
                let last_input_atom = Self::arg_int(args, 1);
                let removed = Self::arg_ref(args, 2);
                let parts = self.term(formula).operands('&');
                let formulas: Vec<RawRef> =
                    parts.into_iter().map(|part| self.new_formula(part)).collect();
                // Script a removed-literal entry so map decoding is exercised.
                let int_class = self.class_id("java/lang/Integer");
                let key = self.alloc(int_class, ObjKind::Int(last_input_atom));
                let bool_class = self.class_id("java/lang/Boolean");
                let value = self.alloc(bool_class, ObjKind::Bool(true));
                match &mut self.objects.get_mut(&removed).unwrap().kind {
                    ObjKind::MapObj(pairs) => pairs.push((key, value)),
                    other => panic!("split removal map on {other:?}"),
                }
                let class = self.class_id("[Ljava/lang/Object;");
                RawValue::Ref(self.alloc(class, ObjKind::ObjArray(formulas)))
            }
            ("owl/cinterface/DeterministicAutomatonWrapper", "of") => {
                RawValue::Ref(self.new_automaton())
            }
            ("owl/cinterface/DecomposedDPA", "of") => {
                let term = self.term(Self::arg_ref(args, 0));
                RawValue::Ref(self.decompose(&term))
            }
            (owner, name) => panic!("unscripted static member {owner}.{name}"),
        }
    }

    fn binary_create(&mut self, op: char, args: &[RawValue]) -> RawValue {
        let left = self.term(Self::arg_ref(args, 0));
        let right = self.term(Self::arg_ref(args, 1));
        RawValue::Ref(self.new_formula(Term::Binary(op, Box::new(left), Box::new(right))))
    }

    fn decompose(&mut self, term: &Term) -> RawRef {
        let (ordinal, parts) = match term {
            Term::Binary('&', ..) => (0, term.operands('&')),
            Term::Binary('|', ..) => (1, term.operands('|')),
            _ => {
                let automaton = self.new_automaton();
                let class = self.class_id("owl/collections/LabelledTree$Leaf");
                return self.alloc(class, ObjKind::TreeLeaf(automaton));
            }
        };
        let leaf_class = self.class_id("owl/collections/LabelledTree$Leaf");
        let children: Vec<RawRef> = parts
            .iter()
            .map(|_| {
                let automaton = self.new_automaton();
                self.alloc(leaf_class, ObjKind::TreeLeaf(automaton))
            })
            .collect();
        let list_class = self.class_id("java/util/ArrayList");
        let children = self.alloc(list_class, ObjKind::List(children));
        let tag_class = self.class_id("owl/cinterface/Tag");
        let label = self.alloc(tag_class, ObjKind::EnumVal(ordinal));
        let node_class = self.class_id("owl/collections/LabelledTree$Node");
        self.alloc(node_class, ObjKind::TreeNode { label, children })
    }
}

/// References a dying object owns and must cascade-release.
fn owned_children(kind: &ObjKind) -> Vec<RawRef> {
    let refs: Vec<RawRef> = match kind {
        ObjKind::List(items) | ObjKind::ObjArray(items) => items.clone(),
        ObjKind::MapObj(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
        ObjKind::Entry(key, value) => vec![*key, *value],
        ObjKind::Iter { items, pos } => items[*pos..].to_vec(),
        ObjKind::TreeLeaf(label) => vec![*label],
        ObjKind::TreeNode { label, children } => vec![*label, *children],
        ObjKind::Shifted { formula, mapping } => vec![*formula, *mapping],
        _ => Vec::new(),
    };
    refs.into_iter().filter(|raw| *raw != NULL_REF).collect()
}

/// Members the fake knows about; anything else resolves to a failure.
fn member_known(class: &str, kind: MemberKind, name: &str) -> bool {
    use MemberKind::{Constructor, Field, Method, StaticField, StaticMethod};
    match (class, kind, name) {
        ("java/lang/Boolean", Method, "booleanValue")
        | ("java/lang/Boolean", StaticMethod, "valueOf")
        | ("java/lang/Integer", Method, "intValue")
        | ("java/lang/Integer", StaticMethod, "valueOf")
        | ("java/lang/Enum", Method, "ordinal")
        | ("java/util/ArrayList", Constructor, "<init>")
        | ("java/util/List", Method, "add" | "iterator")
        | ("java/util/Iterator", Method, "hasNext" | "next")
        | ("java/util/HashMap", Constructor, "<init>")
        | ("java/util/Map", Method, "entrySet" | "put")
        | ("java/util/Set", Method, "iterator")
        | ("java/util/Map$Entry", Method, "getKey" | "getValue")
        | ("owl/collections/LabelledTree$Leaf", Constructor, "<init>")
        | ("owl/collections/LabelledTree$Leaf", Method, "getLabel")
        | ("owl/collections/LabelledTree$Node", Constructor, "<init>")
        | ("owl/collections/LabelledTree$Node", Method, "getLabel" | "getChildren")
        | ("owl/ltl/BooleanConstant", StaticMethod, "get")
        | ("owl/ltl/Formula", Method, "not" | "toString")
        | ("owl/ltl/parser/LtlParser", StaticMethod, "syntax")
        | ("owl/ltl/rewriter/RewriterFactory", StaticMethod, "apply")
        | ("owl/ltl/rewriter/ShiftRewriter", StaticMethod, "shiftLiterals")
        | ("owl/ltl/rewriter/ShiftRewriter$ShiftedFormula", Field, "formula" | "mapping")
        | ("owl/ltl/rewriter/RealizabilityRewriter", StaticMethod, "split")
        | ("owl/cinterface/DeterministicAutomatonWrapper", StaticMethod, "of")
        | ("owl/cinterface/DeterministicAutomatonWrapper", Method, "acceptance" | "edges")
        | ("owl/cinterface/DecomposedDPA", StaticMethod, "of") => true,
        (
            "owl/ltl/Literal"
            | "owl/ltl/Conjunction"
            | "owl/ltl/Disjunction"
            | "owl/ltl/FOperator"
            | "owl/ltl/GOperator"
            | "owl/ltl/XOperator"
            | "owl/ltl/UOperator"
            | "owl/ltl/ROperator"
            | "owl/ltl/WOperator"
            | "owl/ltl/MOperator",
            StaticMethod,
            "create",
        ) => true,
        ("owl/cinterface/Acceptance", StaticField, member) => ACCEPTANCE_MEMBERS.contains(&member),
        ("owl/cinterface/Tag", StaticField, member) => TAG_MEMBERS.contains(&member),
        _ => false,
    }
}

impl ForeignRuntime for FakeVm {
    fn attach_thread(&self) {
        self.inner.lock().counters.attached_threads += 1;
    }

    fn detach_thread(&self) {
        self.inner.lock().counters.detached_threads += 1;
    }

    fn retain(&self, raw: RawRef) -> RawRef {
        let mut inner = self.inner.lock();
        inner.retain_ref(raw);
        raw
    }

    fn release(&self, raw: RawRef) {
        self.inner.lock().release_ref(raw);
    }

    fn find_class(&self, name: &str) -> RawRef {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("find_class");
        match inner.classes.get(name).copied() {
            Some(class) => {
                inner.retain_ref(class);
                class
            }
            None => {
                inner.pend(format!("class not found: {name}"));
                NULL_REF
            }
        }
    }

    fn class_of(&self, obj: RawRef) -> RawRef {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("class_of");
        let class = inner.objects[&obj].class;
        inner.retain_ref(class);
        class
    }

    fn class_name(&self, class: RawRef) -> String {
        let inner = self.inner.lock();
        inner.assert_no_pending("class_name");
        inner.class_name_of(class)
    }

    fn is_instance_of(&self, obj: RawRef, class: RawRef) -> bool {
        let inner = self.inner.lock();
        inner.assert_no_pending("is_instance_of");
        inner.objects[&obj].class == class
    }

    fn resolve_member(
        &self,
        class: RawRef,
        kind: MemberKind,
        name: &str,
        signature: &str,
    ) -> MemberId {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("resolve_member");
        inner.counters.resolutions += 1;
        let class_name = inner.class_name_of(class);
        let hidden = inner
            .forgotten
            .iter()
            .any(|(c, m)| c == &class_name && m == name);
        if hidden || !member_known(&class_name, kind, name) {
            inner.pend(format!("no such member: {class_name}.{name}{signature}"));
            return 0;
        }
        let key = (class, kind, name.to_string(), signature.to_string());
        if let Some(id) = inner.member_ids.get(&key) {
            return *id;
        }
        inner.next_member += 1;
        let id = inner.next_member;
        inner.member_ids.insert(key, id);
        inner.members.insert(
            id,
            MemberDef { class, kind, name: name.to_string() },
        );
        id
    }

    fn call(&self, receiver: RawRef, member: MemberId, args: &[RawValue]) -> RawValue {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("call");
        let def = inner.members[&member].clone();
        assert_eq!(def.kind, MemberKind::Method, "call with non-method member");
        let owner = inner.class_name_of(def.class);
        if let Some(message) = inner.take_injection(&owner, &def.name) {
            inner.pend(message);
            return RawValue::Void;
        }
        inner.dispatch_call(receiver, &def, args)
    }

    fn call_static(&self, class: RawRef, member: MemberId, args: &[RawValue]) -> RawValue {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("call_static");
        let def = inner.members[&member].clone();
        assert_eq!(
            def.kind,
            MemberKind::StaticMethod,
            "call_static with non-static member"
        );
        let owner = inner.class_name_of(class);
        if let Some(message) = inner.take_injection(&owner, &def.name) {
            inner.pend(message);
            return RawValue::Void;
        }
        inner.dispatch_static(&owner, &def, args)
    }

    fn construct(&self, class: RawRef, ctor: MemberId, args: &[RawValue]) -> RawRef {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("construct");
        let def = inner.members[&ctor].clone();
        assert_eq!(def.kind, MemberKind::Constructor, "construct with non-constructor");
        let owner = inner.class_name_of(class);
        if let Some(message) = inner.take_injection(&owner, &def.name) {
            inner.pend(message);
            return NULL_REF;
        }
        match owner.as_str() {
            "java/util/ArrayList" => inner.alloc(class, ObjKind::List(Vec::new())),
            "java/util/HashMap" => inner.alloc(class, ObjKind::MapObj(Vec::new())),
            "owl/collections/LabelledTree$Leaf" => {
                let label = Inner::arg_ref(args, 0);
                inner.retain_ref(label);
                inner.alloc(class, ObjKind::TreeLeaf(label))
            }
            "owl/collections/LabelledTree$Node" => {
                let label = Inner::arg_ref(args, 0);
                let children = Inner::arg_ref(args, 1);
                inner.retain_ref(label);
                inner.retain_ref(children);
                inner.alloc(class, ObjKind::TreeNode { label, children })
            }
            other => panic!("unscripted constructor on {other}"),
        }
    }

    fn field(&self, receiver: RawRef, member: MemberId) -> RawValue {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("field");
        let def = inner.members[&member].clone();
        assert_eq!(def.kind, MemberKind::Field, "field with non-field member");
        let (formula, mapping) = match inner.kind(receiver) {
            ObjKind::Shifted { formula, mapping } => (formula, mapping),
            other => panic!("field access on {other:?}"),
        };
        let out = match def.name.as_str() {
            "formula" => formula,
            "mapping" => mapping,
            other => panic!("unscripted field {other}"),
        };
        inner.retain_ref(out);
        RawValue::Ref(out)
    }

    fn static_field(&self, class: RawRef, member: MemberId) -> RawValue {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("static_field");
        let def = inner.members[&member].clone();
        assert_eq!(def.kind, MemberKind::StaticField, "static_field with non-field member");
        let class_name = inner.class_name_of(class);
        let members = inner.enum_members[&class_name];
        let ordinal = members
            .iter()
            .position(|m| *m == def.name)
            .unwrap_or_else(|| panic!("unknown enum constant {class_name}.{}", def.name))
            as i32;
        RawValue::Ref(inner.alloc(class, ObjKind::EnumVal(ordinal)))
    }

    fn new_string(&self, text: &str) -> RawRef {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("new_string");
        let class = inner.class_id("java/lang/String");
        inner.alloc(class, ObjKind::Str(text.to_string()))
    }

    fn read_string(&self, raw: RawRef) -> String {
        let inner = self.inner.lock();
        inner.assert_no_pending("read_string");
        match &inner.objects[&raw].kind {
            ObjKind::Str(text) => text.clone(),
            other => panic!("read_string on {other:?}"),
        }
    }

    fn read_int_array(&self, raw: RawRef) -> Vec<i32> {
        let inner = self.inner.lock();
        inner.assert_no_pending("read_int_array");
        match &inner.objects[&raw].kind {
            ObjKind::IntArray(values) => values.clone(),
            other => panic!("read_int_array on {other:?}"),
        }
    }

    fn array_length(&self, raw: RawRef) -> u32 {
        let inner = self.inner.lock();
        inner.assert_no_pending("array_length");
        match &inner.objects[&raw].kind {
            ObjKind::ObjArray(items) => items.len() as u32,
            other => panic!("array_length on {other:?}"),
        }
    }

    fn array_element(&self, raw: RawRef, index: u32) -> RawRef {
        let mut inner = self.inner.lock();
        inner.assert_no_pending("array_element");
        let item = match &inner.objects[&raw].kind {
            ObjKind::ObjArray(items) => items[index as usize],
            other => panic!("array_element on {other:?}"),
        };
        inner.retain_ref(item);
        item
    }

    fn failure_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    fn take_failure(&self) -> Option<String> {
        self.inner.lock().pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_cascades_through_containers() {
        let vm = FakeVm::new();
        let a = vm.new_string("a");
        let b = vm.new_string("b");
        let list = vm.make_list(vec![a, b]);

        assert_eq!(vm.refs_of(a), Some(1));

        vm.release(list);

        assert_eq!(vm.refs_of(list), None);
        assert_eq!(vm.refs_of(a), None);
        assert_eq!(vm.refs_of(b), None);
    }

    #[test]
    fn test_find_class_hands_out_an_owned_unit() {
        let vm = FakeVm::new();

        let class = vm.find_class("java/util/List");
        assert_ne!(class, NULL_REF);
        assert_eq!(vm.refs_of(class), Some(2));

        vm.release(class);
        assert_eq!(vm.refs_of(class), Some(1));
    }

    #[test]
    fn test_unknown_class_sets_pending_failure() {
        let vm = FakeVm::new();

        let class = vm.find_class("java/util/Vector");

        assert_eq!(class, NULL_REF);
        assert_eq!(vm.take_failure().as_deref(), Some("class not found: java/util/Vector"));
        assert!(!vm.failure_pending());
    }

    #[test]
    #[should_panic(expected = "failure still pending")]
    fn test_crossing_with_pending_failure_panics() {
        let vm = FakeVm::new();
        let _ = vm.find_class("no/such/Class");
        let _ = vm.find_class("java/util/List");
    }

    #[test]
    fn test_iterator_transfers_units_and_releases_the_rest() {
        let vm = FakeVm::new();
        let a = vm.new_string("a");
        let b = vm.new_string("b");
        let list = vm.make_list(vec![a, b]);

        let list_class = vm.find_class("java/util/List");
        let iterator_member =
            vm.resolve_member(list_class, MemberKind::Method, "iterator", "()Ljava/util/Iterator;");
        let iter = vm.call(list, iterator_member, &[]).reference().unwrap();

        let iter_class = vm.find_class("java/util/Iterator");
        let next = vm.resolve_member(iter_class, MemberKind::Method, "next", "()Ljava/lang/Object;");
        let first = vm.call(iter, next, &[]).reference().unwrap();
        assert_eq!(first, a);
        assert_eq!(vm.refs_of(a), Some(2));

        // Iterator still holds a unit on the un-yielded element.
        assert_eq!(vm.refs_of(b), Some(2));
        vm.release(iter);
        assert_eq!(vm.refs_of(b), Some(1));

        vm.release(first);
        vm.release(list);
        vm.release(list_class);
        vm.release(iter_class);
        assert_eq!(vm.refs_of(a), None);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let vm = FakeVm::new();
        vm.inject_failure("owl/ltl/rewriter/RewriterFactory", "apply", "boom");
        let formula_class = vm.find_class("owl/ltl/BooleanConstant");
        let get = vm.resolve_member(
            formula_class,
            MemberKind::StaticMethod,
            "get",
            "(Z)Lowl/ltl/BooleanConstant;",
        );
        let formula = vm
            .call_static(formula_class, get, &[RawValue::Bool(true)])
            .reference()
            .unwrap();

        let rewriter_class = vm.find_class("owl/ltl/rewriter/RewriterFactory");
        let apply = vm.resolve_member(
            rewriter_class,
            MemberKind::StaticMethod,
            "apply",
            "(Lowl/ltl/Formula;)Lowl/ltl/Formula;",
        );

        let result = vm.call_static(rewriter_class, apply, &[RawValue::Ref(formula)]);
        assert_eq!(result, RawValue::Void);
        assert_eq!(vm.take_failure().as_deref(), Some("boom"));

        let result = vm.call_static(rewriter_class, apply, &[RawValue::Ref(formula)]);
        let simplified = result.reference().unwrap();
        assert_eq!(simplified, formula);
        vm.release(simplified);
        vm.release(formula);
        vm.release(formula_class);
        vm.release(rewriter_class);
    }

    #[test]
    fn test_resolution_counter_counts_every_host_resolution() {
        let vm = FakeVm::new();
        let class = vm.find_class("java/util/List");

        let before = vm.counters().resolutions;
        let first = vm.resolve_member(class, MemberKind::Method, "add", "(Ljava/lang/Object;)Z");
        let second = vm.resolve_member(class, MemberKind::Method, "add", "(Ljava/lang/Object;)Z");

        assert_eq!(first, second);
        assert_eq!(vm.counters().resolutions, before + 2);
        vm.release(class);
    }
}
