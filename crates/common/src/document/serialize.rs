use tracing::warn;
use yrs::{ReadTxn, XmlFragmentRef};

use super::node::{ElementNode, Mark, Node, TextKind, TextNode};
use super::tree::{read_fragment, TreeItem};

/// Serialize the top-level children of a yrs XML fragment into portable nodes.
pub fn serialize_fragment<T: ReadTxn>(fragment: &XmlFragmentRef, txn: &T) -> Vec<Node> {
    serialize_items(&read_fragment(fragment, txn))
}

/// Serialize a sequence of tree items.
///
/// A text item expands into one node per delta run, so the result is the
/// one-level flattening of every item's output. Malformed items are skipped.
pub fn serialize_items(items: &[TreeItem]) -> Vec<Node> {
    items.iter().flat_map(serialize_item).collect()
}

fn serialize_item(item: &TreeItem) -> Vec<Node> {
    match item {
        TreeItem::Text(runs) => runs
            .iter()
            .map(|run| {
                Node::Text(TextNode {
                    kind: TextKind::Text,
                    text: run.insert.clone(),
                    // BTreeMap keys iterate sorted, so mark order is stable.
                    marks: run.attributes.keys().map(Mark::new).collect(),
                })
            })
            .collect(),
        TreeItem::Element(element) => vec![Node::Element(ElementNode {
            node_type: element.tag.clone(),
            attrs: element.attrs.clone(),
            content: serialize_items(&element.children),
        })],
        TreeItem::Malformed { kind } => {
            warn!(kind, "skipping document tree item with neither tag name nor delta");
            Vec::new()
        }
    }
}
