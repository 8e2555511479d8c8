//! Bidirectional typed conversion across the boundary.
//!
//! The conversion surface is closed: scalars, strings, sequences, maps,
//! labelled trees, enums, and domain handles. Each conversion carries a
//! [`ConversionTag`] so mismatch diagnostics can name what was expected.
//! During container conversion at most one element reference is held
//! in-flight at a time; element units are released as soon as the element
//! has been converted or stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use owl_vm::{ForeignRuntime, MemberKind, NULL_REF, RawRef, RawValue};

use crate::call::{CallBridge, MemberBinding};
use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleRegistry};

pub(crate) const BOOLEAN: &str = "java/lang/Boolean";
pub(crate) const INTEGER: &str = "java/lang/Integer";
pub(crate) const ENUM: &str = "java/lang/Enum";
pub(crate) const LIST: &str = "java/util/List";
pub(crate) const ARRAY_LIST: &str = "java/util/ArrayList";
pub(crate) const ITERATOR: &str = "java/util/Iterator";
pub(crate) const MAP: &str = "java/util/Map";
pub(crate) const HASH_MAP: &str = "java/util/HashMap";
pub(crate) const SET: &str = "java/util/Set";
pub(crate) const MAP_ENTRY: &str = "java/util/Map$Entry";
pub(crate) const TREE_LEAF: &str = "owl/collections/LabelledTree$Leaf";
pub(crate) const TREE_NODE: &str = "owl/collections/LabelledTree$Node";

/// Which conversion a value was undergoing when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionTag {
    Bool,
    Int,
    Str,
    Sequence,
    Map,
    Tree,
    Enum,
    DomainHandle,
}

impl ConversionTag {
    pub fn name(self) -> &'static str {
        match self {
            ConversionTag::Bool => "boolean",
            ConversionTag::Int => "integer",
            ConversionTag::Str => "string",
            ConversionTag::Sequence => "sequence",
            ConversionTag::Map => "map",
            ConversionTag::Tree => "labelled tree",
            ConversionTag::Enum => "enum constant",
            ConversionTag::DomainHandle => "domain handle",
        }
    }
}

impl std::fmt::Display for ConversionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn mismatch(expected: ConversionTag, actual: &RawValue) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: expected.name().to_string(),
        actual: format!("{actual:?}"),
    }
}

/// Values the codec can push across the boundary.
pub trait ToForeign {
    const TAG: ConversionTag;

    /// Produces a raw value. A returned reference carries one owned unit
    /// which the caller must account for.
    fn to_foreign(&self, cx: &Codec) -> Result<RawValue>;
}

/// Values the codec can pull back from the boundary.
pub trait FromForeign: Sized {
    const TAG: ConversionTag;

    /// Consumes `value` (including its reference unit, if any).
    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self>;
}

/// Host enum types mirrored natively by ordinal.
pub trait ForeignEnum: Sized + Copy {
    /// Qualified name of the host enum class.
    const CLASS: &'static str;
    /// Member names in ordinal order, matching the host declaration.
    const MEMBERS: &'static [&'static str];

    fn from_ordinal(ordinal: i32) -> Option<Self>;
    fn ordinal(self) -> i32;
}

/// Domain types wrapping an opaque handle to a known host class.
pub trait ForeignClass: Sized {
    /// Qualified name of the host class instances must belong to.
    const CLASS: &'static str;

    fn from_handle(handle: Handle) -> Self;
    fn handle(&self) -> &Handle;
}

/// Releases a borrowed-then-owned reference unit on scope exit.
///
/// This is how the codec honours the one-in-flight-element rule: every
/// intermediate reference lives in one of these, so an early `?` return
/// cannot leak a unit.
pub(crate) struct ScopedRef<'a> {
    vm: &'a dyn ForeignRuntime,
    raw: RawRef,
}

impl ScopedRef<'_> {
    pub(crate) fn raw(&self) -> RawRef {
        self.raw
    }

    /// Disarms the guard and hands the unit to the caller.
    pub(crate) fn into_raw(mut self) -> RawRef {
        std::mem::replace(&mut self.raw, NULL_REF)
    }
}

impl Drop for ScopedRef<'_> {
    fn drop(&mut self) {
        if self.raw != NULL_REF {
            self.vm.release(self.raw);
        }
    }
}

/// The typed conversion layer of a session.
#[derive(Clone)]
pub struct Codec {
    bridge: Arc<CallBridge>,
    registry: Arc<HandleRegistry>,
}

impl Codec {
    pub(crate) fn new(bridge: Arc<CallBridge>, registry: Arc<HandleRegistry>) -> Self {
        Self { bridge, registry }
    }

    pub(crate) fn bridge(&self) -> &CallBridge {
        &self.bridge
    }

    pub(crate) fn vm(&self) -> &dyn ForeignRuntime {
        self.bridge.vm()
    }

    /// Pushes a native value across the boundary.
    pub fn encode<T: ToForeign + ?Sized>(&self, value: &T) -> Result<RawValue> {
        value.to_foreign(self)
    }

    /// Pulls a raw value back, consuming its reference unit if it has one.
    pub fn decode<T: FromForeign>(&self, value: RawValue) -> Result<T> {
        T::from_foreign(self, value)
    }

    pub(crate) fn scoped(&self, raw: RawRef) -> ScopedRef<'_> {
        ScopedRef { vm: self.vm(), raw }
    }

    /// Takes ownership of a reference-valued `value`, rejecting null and
    /// non-reference shapes.
    pub(crate) fn expect_ref(&self, value: RawValue, tag: ConversionTag) -> Result<ScopedRef<'_>> {
        match value {
            RawValue::Ref(NULL_REF) => Err(BridgeError::NullReference { context: tag.name() }),
            RawValue::Ref(raw) => Ok(self.scoped(raw)),
            other => Err(mismatch(tag, &other)),
        }
    }

    /// Adopts a raw reference fresh from a host call: drains the failure
    /// slot (releasing the unit if the crossing failed) and rejects null.
    pub(crate) fn guard_crossing(
        &self,
        raw: RawRef,
        context: &'static str,
    ) -> Result<ScopedRef<'_>> {
        if let Some(message) = self.vm().take_failure() {
            if raw != NULL_REF {
                self.vm().release(raw);
            }
            return Err(BridgeError::ForeignFailure(message));
        }
        if raw == NULL_REF {
            return Err(BridgeError::NullReference { context });
        }
        Ok(self.scoped(raw))
    }

    pub(crate) fn method(
        &self,
        class: &str,
        name: &str,
        signature: &str,
    ) -> Result<Arc<MemberBinding>> {
        self.bridge.resolve(class, name, signature, MemberKind::Method)
    }

    pub(crate) fn call_bool(
        &self,
        class: &str,
        name: &str,
        signature: &str,
        receiver: RawRef,
    ) -> Result<bool> {
        let binding = self.method(class, name, signature)?;
        match self.bridge.invoke(&binding, receiver, &[])? {
            RawValue::Bool(value) => Ok(value),
            other => Err(mismatch(ConversionTag::Bool, &other)),
        }
    }

    pub(crate) fn call_int(
        &self,
        class: &str,
        name: &str,
        signature: &str,
        receiver: RawRef,
    ) -> Result<i32> {
        let binding = self.method(class, name, signature)?;
        match self.bridge.invoke(&binding, receiver, &[])? {
            RawValue::Int(value) => Ok(value),
            other => Err(mismatch(ConversionTag::Int, &other)),
        }
    }

    /// Boxes a scalar into its host wrapper so it can enter a container.
    /// Reference values pass through unchanged. `tag` names the conversion
    /// being performed, for diagnostics on unboxable values.
    pub(crate) fn boxed(&self, value: RawValue, tag: ConversionTag) -> Result<ScopedRef<'_>> {
        match value {
            RawValue::Bool(b) => {
                let binding = self.bridge.resolve(
                    BOOLEAN,
                    "valueOf",
                    "(Z)Ljava/lang/Boolean;",
                    MemberKind::StaticMethod,
                )?;
                let boxed = self.bridge.invoke(&binding, NULL_REF, &[RawValue::Bool(b)])?;
                self.expect_ref(boxed, ConversionTag::Bool)
            }
            RawValue::Int(i) => {
                let binding = self.bridge.resolve(
                    INTEGER,
                    "valueOf",
                    "(I)Ljava/lang/Integer;",
                    MemberKind::StaticMethod,
                )?;
                let boxed = self.bridge.invoke(&binding, NULL_REF, &[RawValue::Int(i)])?;
                self.expect_ref(boxed, ConversionTag::Int)
            }
            RawValue::Ref(raw) if raw != NULL_REF => Ok(self.scoped(raw)),
            other => Err(mismatch(tag, &other)),
        }
    }

    /// Asserts that `raw` is an instance of the named host class.
    pub(crate) fn check_instance(&self, raw: RawRef, class_name: &str, expected: &str) -> Result<()> {
        let class = self.bridge.class_ref(class_name)?;
        if self.vm().is_instance_of(raw, class) {
            return Ok(());
        }
        let actual_class = self.vm().class_of(raw);
        let actual = self.vm().class_name(actual_class);
        self.vm().release(actual_class);
        Err(BridgeError::TypeMismatch {
            expected: expected.to_string(),
            actual,
        })
    }

    /// Decodes a host enum constant by ordinal.
    pub fn decode_enum<E: ForeignEnum>(&self, value: RawValue) -> Result<E> {
        let guard = self.expect_ref(value, ConversionTag::Enum)?;
        self.check_instance(guard.raw(), E::CLASS, E::CLASS)?;
        let ordinal = self.call_int(ENUM, "ordinal", "()I", guard.raw())?;
        E::from_ordinal(ordinal).ok_or_else(|| BridgeError::TypeMismatch {
            expected: format!("{} ordinal in range", E::CLASS),
            actual: format!("ordinal {ordinal}"),
        })
    }

    /// Encodes a native enum value as the corresponding host constant.
    /// Returns one owned reference unit.
    pub fn encode_enum<E: ForeignEnum>(&self, value: E) -> Result<RawValue> {
        let index = value.ordinal() as usize;
        let member = E::MEMBERS.get(index).ok_or_else(|| BridgeError::TypeMismatch {
            expected: format!("{} ordinal in range", E::CLASS),
            actual: format!("ordinal {index}"),
        })?;
        let signature = format!("L{};", E::CLASS);
        let binding =
            self.bridge
                .resolve(E::CLASS, member, &signature, MemberKind::StaticField)?;
        let constant = self.bridge.invoke(&binding, NULL_REF, &[])?;
        Ok(RawValue::Ref(
            self.expect_ref(constant, ConversionTag::Enum)?.into_raw(),
        ))
    }

    /// Decodes a domain handle, asserting the instance's host class.
    pub fn decode_handle<T: ForeignClass>(&self, value: RawValue) -> Result<T> {
        let guard = self.expect_ref(value, ConversionTag::DomainHandle)?;
        self.check_instance(guard.raw(), T::CLASS, T::CLASS)?;
        let handle = self.registry.acquire(guard.into_raw())?;
        Ok(T::from_handle(handle))
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl ToForeign for bool {
    const TAG: ConversionTag = ConversionTag::Bool;

    fn to_foreign(&self, _cx: &Codec) -> Result<RawValue> {
        Ok(RawValue::Bool(*self))
    }
}

impl FromForeign for bool {
    const TAG: ConversionTag = ConversionTag::Bool;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        match value {
            RawValue::Bool(b) => Ok(b),
            RawValue::Ref(NULL_REF) => Err(BridgeError::NullReference {
                context: <Self as FromForeign>::TAG.name(),
            }),
            RawValue::Ref(raw) => {
                let guard = cx.scoped(raw);
                cx.check_instance(guard.raw(), BOOLEAN, <Self as FromForeign>::TAG.name())?;
                cx.call_bool(BOOLEAN, "booleanValue", "()Z", guard.raw())
            }
            other => Err(mismatch(<Self as FromForeign>::TAG, &other)),
        }
    }
}

impl ToForeign for i32 {
    const TAG: ConversionTag = ConversionTag::Int;

    fn to_foreign(&self, _cx: &Codec) -> Result<RawValue> {
        Ok(RawValue::Int(*self))
    }
}

impl FromForeign for i32 {
    const TAG: ConversionTag = ConversionTag::Int;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        match value {
            RawValue::Int(i) => Ok(i),
            RawValue::Ref(NULL_REF) => Err(BridgeError::NullReference {
                context: <Self as FromForeign>::TAG.name(),
            }),
            RawValue::Ref(raw) => {
                let guard = cx.scoped(raw);
                cx.check_instance(guard.raw(), INTEGER, <Self as FromForeign>::TAG.name())?;
                cx.call_int(INTEGER, "intValue", "()I", guard.raw())
            }
            other => Err(mismatch(<Self as FromForeign>::TAG, &other)),
        }
    }
}

impl ToForeign for str {
    const TAG: ConversionTag = ConversionTag::Str;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        let raw = cx.vm().new_string(self);
        Ok(RawValue::Ref(cx.guard_crossing(raw, "string")?.into_raw()))
    }
}

impl ToForeign for String {
    const TAG: ConversionTag = ConversionTag::Str;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        self.as_str().to_foreign(cx)
    }
}

impl FromForeign for String {
    const TAG: ConversionTag = ConversionTag::Str;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        let guard = cx.expect_ref(value, <Self as FromForeign>::TAG)?;
        let text = cx.vm().read_string(guard.raw());
        if let Some(message) = cx.vm().take_failure() {
            return Err(BridgeError::ForeignFailure(message));
        }
        Ok(text)
    }
}

impl<T: ToForeign> ToForeign for [T] {
    const TAG: ConversionTag = ConversionTag::Sequence;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        let ctor = cx
            .bridge()
            .resolve(ARRAY_LIST, "<init>", "()V", MemberKind::Constructor)?;
        let list_value = cx.bridge().invoke(&ctor, NULL_REF, &[])?;
        let list = cx.expect_ref(list_value, Self::TAG)?;

        let add = cx.method(LIST, "add", "(Ljava/lang/Object;)Z")?;
        for element in self {
            // One in-flight element at a time; the guard releases it once
            // the list holds its own unit.
            let boxed = cx.boxed(element.to_foreign(cx)?, T::TAG)?;
            cx.bridge()
                .invoke(&add, list.raw(), &[RawValue::Ref(boxed.raw())])?;
        }
        Ok(RawValue::Ref(list.into_raw()))
    }
}

impl<T: ToForeign> ToForeign for Vec<T> {
    const TAG: ConversionTag = ConversionTag::Sequence;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        self.as_slice().to_foreign(cx)
    }
}

impl<T: FromForeign> FromForeign for Vec<T> {
    const TAG: ConversionTag = ConversionTag::Sequence;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        let list = cx.expect_ref(value, Self::TAG)?;

        let iterator_member = cx.method(LIST, "iterator", "()Ljava/util/Iterator;")?;
        let iter_value = cx.bridge().invoke(&iterator_member, list.raw(), &[])?;
        let iter = cx.expect_ref(iter_value, Self::TAG)?;

        let next = cx.method(ITERATOR, "next", "()Ljava/lang/Object;")?;
        let mut out = Vec::new();
        while cx.call_bool(ITERATOR, "hasNext", "()Z", iter.raw())? {
            let element = cx.bridge().invoke(&next, iter.raw(), &[])?;
            out.push(T::from_foreign(cx, element)?);
        }
        Ok(out)
    }
}

impl<K, V> ToForeign for BTreeMap<K, V>
where
    K: ToForeign + Ord,
    V: ToForeign,
{
    const TAG: ConversionTag = ConversionTag::Map;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        let ctor = cx
            .bridge()
            .resolve(HASH_MAP, "<init>", "()V", MemberKind::Constructor)?;
        let map_value = cx.bridge().invoke(&ctor, NULL_REF, &[])?;
        let map = cx.expect_ref(map_value, Self::TAG)?;

        let put = cx.method(
            MAP,
            "put",
            "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
        )?;
        for (key, value) in self {
            let key_guard = cx.boxed(key.to_foreign(cx)?, K::TAG)?;
            let value_guard = cx.boxed(value.to_foreign(cx)?, V::TAG)?;
            let previous = cx.bridge().invoke(
                &put,
                map.raw(),
                &[RawValue::Ref(key_guard.raw()), RawValue::Ref(value_guard.raw())],
            )?;
            // Native keys are unique, so there is never a displaced value,
            // but the unit still has to go back if the host returns one.
            if let Some(raw) = previous.reference()
                && raw != NULL_REF
            {
                cx.vm().release(raw);
            }
        }
        Ok(RawValue::Ref(map.into_raw()))
    }
}

impl<K, V> FromForeign for BTreeMap<K, V>
where
    K: FromForeign + Ord,
    V: FromForeign,
{
    const TAG: ConversionTag = ConversionTag::Map;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        let map = cx.expect_ref(value, Self::TAG)?;

        let entry_set = cx.method(MAP, "entrySet", "()Ljava/util/Set;")?;
        let set_value = cx.bridge().invoke(&entry_set, map.raw(), &[])?;
        let set = cx.expect_ref(set_value, Self::TAG)?;

        let iterator_member = cx.method(SET, "iterator", "()Ljava/util/Iterator;")?;
        let iter_value = cx.bridge().invoke(&iterator_member, set.raw(), &[])?;
        let iter = cx.expect_ref(iter_value, Self::TAG)?;

        let next = cx.method(ITERATOR, "next", "()Ljava/lang/Object;")?;
        let get_key = cx.method(MAP_ENTRY, "getKey", "()Ljava/lang/Object;")?;
        let get_value = cx.method(MAP_ENTRY, "getValue", "()Ljava/lang/Object;")?;

        let mut out = BTreeMap::new();
        while cx.call_bool(ITERATOR, "hasNext", "()Z", iter.raw())? {
            let entry_value = cx.bridge().invoke(&next, iter.raw(), &[])?;
            let entry = cx.expect_ref(entry_value, Self::TAG)?;

            let key_value = cx.bridge().invoke(&get_key, entry.raw(), &[])?;
            let key = K::from_foreign(cx, key_value)?;
            let val_value = cx.bridge().invoke(&get_value, entry.raw(), &[])?;
            let val = V::from_foreign(cx, val_value)?;

            if out.insert(key, val).is_some() {
                return Err(BridgeError::TypeMismatch {
                    expected: "map with unique keys".to_string(),
                    actual: "duplicate key".to_string(),
                });
            }
        }
        Ok(out)
    }
}

impl<T: ToForeign> ToForeign for Option<T> {
    const TAG: ConversionTag = T::TAG;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        match self {
            Some(value) => value.to_foreign(cx),
            None => Ok(RawValue::NULL),
        }
    }
}

impl<T: FromForeign> FromForeign for Option<T> {
    const TAG: ConversionTag = T::TAG;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_foreign(cx, value).map(Some)
    }
}
