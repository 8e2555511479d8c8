//! Foreign-runtime seam for the owl bridge.
//!
//! This crate defines the boundary between native bridge code and the managed
//! host runtime that owns the actual reasoning engine. The two sides cannot
//! inspect each other's internals: the host exposes only opaque reference
//! identifiers, member tokens, and a small untyped value set, and the bridge
//! drives it exclusively through the [`ForeignRuntime`] trait.
//!
//! # Ownership discipline
//!
//! Every operation that hands back an object reference transfers ownership of
//! exactly one reference unit to the caller. The caller must eventually give
//! that unit back through [`ForeignRuntime::release`] (or keep it alive via
//! [`ForeignRuntime::retain`] before sharing). Arguments passed into a call
//! are borrowed for the duration of the call only; if the host stores them it
//! retains its own units.
//!
//! # Failure signalling
//!
//! The host does not return errors. A failing operation leaves a pending
//! failure behind and yields a null/void result; callers must drain the
//! pending state through [`ForeignRuntime::take_failure`] immediately after
//! every boundary crossing. Crossing the boundary again with a failure still
//! pending is a protocol violation and implementations are entitled to abort.

pub mod fake;
mod options;

pub use options::VmOptions;

/// Opaque identifier of a value living on the foreign side. `0` is null.
pub type RawRef = u64;

/// The null foreign reference.
pub const NULL_REF: RawRef = 0;

/// Opaque token of a resolved class member. `0` means unresolved.
pub type MemberId = u64;

/// The kind of member a resolution targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Instance method, invoked with a receiver.
    Method,
    /// Static method, invoked on the class.
    StaticMethod,
    /// Instance field read.
    Field,
    /// Static field read (used for enum constants).
    StaticField,
    /// Constructor.
    Constructor,
}

/// An untyped value crossing the boundary.
///
/// Scalars travel by value; everything else travels as a reference. A
/// [`RawValue::Ref`] returned from a host operation carries one owned
/// reference unit (unless it is null).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    /// No value (void-returning call).
    Void,
    Bool(bool),
    Int(i32),
    Ref(RawRef),
}

impl RawValue {
    /// The null reference value.
    pub const NULL: RawValue = RawValue::Ref(NULL_REF);

    /// Returns the contained reference, if this is a reference value.
    pub fn reference(self) -> Option<RawRef> {
        match self {
            RawValue::Ref(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, RawValue::Ref(NULL_REF))
    }
}

/// The untyped surface of the managed host runtime.
///
/// Implementations are thread-safe as a whole, but individual reference-count
/// operations are atomic without being transactional across operations; the
/// bridge layers its own ownership discipline on top.
pub trait ForeignRuntime: Send + Sync {
    /// Attaches the calling thread to the host. A thread must be attached
    /// before it performs any other operation.
    fn attach_thread(&self);

    /// Detaches the calling thread. No operations may follow on this thread.
    fn detach_thread(&self);

    /// Adds one reference unit to `raw` and returns the (stable) identifier.
    fn retain(&self, raw: RawRef) -> RawRef;

    /// Gives back one reference unit. Releasing a reference that holds no
    /// outstanding unit is a programming error and fails loudly.
    fn release(&self, raw: RawRef);

    /// Looks up a class by slash-separated qualified name. Returns an owned
    /// class reference, or null with a pending failure.
    fn find_class(&self, name: &str) -> RawRef;

    /// Returns an owned reference to the concrete class of `obj`.
    fn class_of(&self, obj: RawRef) -> RawRef;

    /// Returns the qualified name of a class reference.
    fn class_name(&self, class: RawRef) -> String;

    fn is_instance_of(&self, obj: RawRef, class: RawRef) -> bool;

    /// Resolves a member on `class`. Returns `0` with a pending failure when
    /// the member does not exist.
    fn resolve_member(
        &self,
        class: RawRef,
        kind: MemberKind,
        name: &str,
        signature: &str,
    ) -> MemberId;

    /// Invokes an instance method.
    fn call(&self, receiver: RawRef, member: MemberId, args: &[RawValue]) -> RawValue;

    /// Invokes a static method.
    fn call_static(&self, class: RawRef, member: MemberId, args: &[RawValue]) -> RawValue;

    /// Constructs a new object. Returns an owned reference.
    fn construct(&self, class: RawRef, ctor: MemberId, args: &[RawValue]) -> RawRef;

    /// Reads an instance field.
    fn field(&self, receiver: RawRef, member: MemberId) -> RawValue;

    /// Reads a static field.
    fn static_field(&self, class: RawRef, member: MemberId) -> RawValue;

    /// Copies a native string to the host. Returns an owned reference.
    fn new_string(&self, text: &str) -> RawRef;

    /// Copies a host string to the native side.
    fn read_string(&self, raw: RawRef) -> String;

    /// Copies a host integer array to the native side.
    fn read_int_array(&self, raw: RawRef) -> Vec<i32>;

    /// Length of a host object array.
    fn array_length(&self, raw: RawRef) -> u32;

    /// Element of a host object array. Returns an owned reference.
    fn array_element(&self, raw: RawRef, index: u32) -> RawRef;

    /// Whether a failure is pending on the host side.
    fn failure_pending(&self) -> bool;

    /// Retrieves and clears the pending failure description, if any.
    fn take_failure(&self) -> Option<String>;
}
