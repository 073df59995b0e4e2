// Portable document representation and the CRDT tree serializer.

mod node;
mod serialize;
mod tree;

pub use node::{ElementNode, Mark, Node, TextKind, TextNode};
pub use serialize::{serialize_fragment, serialize_items};
pub use tree::{any_to_json, read_fragment, DeltaRun, ElementItem, TreeItem};
