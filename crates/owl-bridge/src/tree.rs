//! Trees with distinct node and leaf labels, and their boundary conversion.

use owl_vm::{MemberKind, NULL_REF, RawValue};

use crate::codec::{
    Codec, ConversionTag, FromForeign, ITERATOR, LIST, TREE_LEAF, TREE_NODE, ToForeign, mismatch,
};
use crate::error::{BridgeError, Result};

/// A tree whose internal nodes carry `L1` labels and whose leaves carry `L2`
/// values. Internal nodes always have at least two children; a would-be
/// single-child node is represented by the child itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelledTree<L1, L2> {
    Leaf(L2),
    Node { label: L1, children: Vec<LabelledTree<L1, L2>> },
}

impl<L1, L2> LabelledTree<L1, L2> {
    pub fn leaf(value: L2) -> Self {
        LabelledTree::Leaf(value)
    }

    /// Builds an internal node. Panics if fewer than two children are given;
    /// collapse single-child nodes before constructing.
    pub fn node(label: L1, children: Vec<LabelledTree<L1, L2>>) -> Self {
        assert!(children.len() >= 2, "internal nodes need at least two children");
        LabelledTree::Node { label, children }
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            LabelledTree::Leaf(_) => 1,
            LabelledTree::Node { children, .. } => {
                children.iter().map(LabelledTree::leaf_count).sum()
            }
        }
    }
}

impl<L1, L2> ToForeign for LabelledTree<L1, L2>
where
    L1: ToForeign,
    L2: ToForeign,
{
    const TAG: ConversionTag = ConversionTag::Tree;

    fn to_foreign(&self, cx: &Codec) -> Result<RawValue> {
        match self {
            LabelledTree::Leaf(value) => {
                let label = cx.boxed(value.to_foreign(cx)?, L2::TAG)?;
                let ctor = cx.bridge().resolve(
                    TREE_LEAF,
                    "<init>",
                    "(Ljava/lang/Object;)V",
                    MemberKind::Constructor,
                )?;
                cx.bridge()
                    .invoke(&ctor, NULL_REF, &[RawValue::Ref(label.raw())])
            }
            LabelledTree::Node { label, children } => {
                let label = cx.boxed(label.to_foreign(cx)?, L1::TAG)?;
                let children = cx.expect_ref(children.to_foreign(cx)?, Self::TAG)?;
                let ctor = cx.bridge().resolve(
                    TREE_NODE,
                    "<init>",
                    "(Ljava/lang/Object;Ljava/util/List;)V",
                    MemberKind::Constructor,
                )?;
                cx.bridge().invoke(
                    &ctor,
                    NULL_REF,
                    &[RawValue::Ref(label.raw()), RawValue::Ref(children.raw())],
                )
            }
        }
    }
}

impl<L1, L2> FromForeign for LabelledTree<L1, L2>
where
    L1: FromForeign,
    L2: FromForeign,
{
    const TAG: ConversionTag = ConversionTag::Tree;

    fn from_foreign(cx: &Codec, value: RawValue) -> Result<Self> {
        let tree = cx.expect_ref(value, Self::TAG)?;
        let leaf_class = cx.bridge().class_ref(TREE_LEAF)?;

        if cx.vm().is_instance_of(tree.raw(), leaf_class) {
            let get_label = cx.method(TREE_LEAF, "getLabel", "()Ljava/lang/Object;")?;
            let label = cx.bridge().invoke(&get_label, tree.raw(), &[])?;
            return Ok(LabelledTree::Leaf(L2::from_foreign(cx, label)?));
        }

        let node_class = cx.bridge().class_ref(TREE_NODE)?;
        if !cx.vm().is_instance_of(tree.raw(), node_class) {
            return Err(mismatch(Self::TAG, &RawValue::Ref(tree.raw())));
        }

        let get_label = cx.method(TREE_NODE, "getLabel", "()Ljava/lang/Object;")?;
        let label_value = cx.bridge().invoke(&get_label, tree.raw(), &[])?;
        let label = L1::from_foreign(cx, label_value)?;

        let get_children = cx.method(TREE_NODE, "getChildren", "()Ljava/util/List;")?;
        let children_value = cx.bridge().invoke(&get_children, tree.raw(), &[])?;
        let children: Vec<LabelledTree<L1, L2>> = {
            let children_list = cx.expect_ref(children_value, Self::TAG)?;
            let iterator_member = cx.method(LIST, "iterator", "()Ljava/util/Iterator;")?;
            let iter_value = cx.bridge().invoke(&iterator_member, children_list.raw(), &[])?;
            let iter = cx.expect_ref(iter_value, Self::TAG)?;

            let next = cx.method(ITERATOR, "next", "()Ljava/lang/Object;")?;
            let mut out = Vec::new();
            while cx.call_bool(ITERATOR, "hasNext", "()Z", iter.raw())? {
                let child = cx.bridge().invoke(&next, iter.raw(), &[])?;
                out.push(LabelledTree::from_foreign(cx, child)?);
            }
            out
        };

        if children.len() < 2 {
            return Err(BridgeError::TypeMismatch {
                expected: "internal node with at least two children".to_string(),
                actual: format!("{} child(ren)", children.len()),
            });
        }
        Ok(LabelledTree::Node { label, children })
    }
}

#[cfg(test)]
mod tests {
    use owl_vm::RawValue;

    use super::LabelledTree;
    use crate::error::BridgeError;
    use crate::session::tests::test_session;

    type IntTree = LabelledTree<i32, i32>;

    #[test]
    fn test_leaf_round_trip() {
        let (vm, session) = test_session();
        let codec = session.codec();

        let tree = IntTree::leaf(17);
        let encoded = codec.encode(&tree).unwrap();
        let decoded: IntTree = codec.decode(encoded).unwrap();

        assert_eq!(decoded, tree);
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_depth_three_tree_round_trip() {
        let (vm, session) = test_session();
        let codec = session.codec();

        let tree = IntTree::node(
            0,
            vec![
                IntTree::node(1, vec![IntTree::leaf(10), IntTree::leaf(11)]),
                IntTree::node(2, vec![IntTree::leaf(20), IntTree::leaf(21), IntTree::leaf(22)]),
            ],
        );
        let encoded = codec.encode(&tree).unwrap();
        let decoded: IntTree = codec.decode(encoded).unwrap();

        assert_eq!(decoded, tree);
        assert_eq!(decoded.leaf_count(), 5);
        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_foreign_built_tree_decodes() {
        let (vm, session) = test_session();
        let codec = session.codec();

        let left = vm.make_leaf(vm.make_integer(1));
        let right = vm.make_leaf(vm.make_integer(2));
        let root = vm.make_node(vm.make_integer(9), vec![left, right]);

        let decoded: IntTree = codec.decode(RawValue::Ref(root)).unwrap();
        assert_eq!(
            decoded,
            IntTree::node(9, vec![IntTree::leaf(1), IntTree::leaf(2)])
        );

        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    fn test_single_child_node_is_rejected() {
        let (vm, session) = test_session();
        let codec = session.codec();

        let only = vm.make_leaf(vm.make_integer(1));
        let root = vm.make_node(vm.make_integer(9), vec![only]);

        let err = codec.decode::<IntTree>(RawValue::Ref(root)).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { .. }));

        drop(session);
        assert_eq!(vm.live_objects(), 0);
    }

    #[test]
    #[should_panic(expected = "at least two children")]
    fn test_native_single_child_node_is_rejected_at_construction() {
        let _ = IntTree::node(0, vec![IntTree::leaf(1)]);
    }
}
