// Portable JSON document tree.
//
// The shape follows the rich-text schema used by the editor: element nodes
// carry `type`, `attrs` and `content`; text runs carry `type: "text"`, `text`
// and `marks`. Empty optional members are omitted on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of the portable document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Text(TextNode),
    Element(ElementNode),
}

impl Node {
    /// Element node with the given type and no attributes or children.
    pub fn element(node_type: impl Into<String>) -> Self {
        Self::Element(ElementNode {
            node_type: node_type.into(),
            attrs: Map::new(),
            content: Vec::new(),
        })
    }

    /// Unformatted text run.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextNode { kind: TextKind::Text, text: text.into(), marks: Vec::new() })
    }

    /// Replace the attributes of an element node. No-op on text runs.
    pub fn with_attrs(mut self, attrs: Map<String, Value>) -> Self {
        if let Self::Element(element) = &mut self {
            element.attrs = attrs;
        }
        self
    }

    /// Replace the children of an element node. No-op on text runs.
    pub fn with_content(mut self, content: Vec<Node>) -> Self {
        if let Self::Element(element) = &mut self {
            element.content = content;
        }
        self
    }

    /// Replace the marks of a text run. No-op on element nodes.
    pub fn with_marks<I, S>(mut self, marks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Text(text) = &mut self {
            text.marks = marks.into_iter().map(Mark::new).collect();
        }
        self
    }

    /// The node's `type` string.
    pub fn node_type(&self) -> &str {
        match self {
            Self::Text(_) => "text",
            Self::Element(element) => &element.node_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    #[serde(rename = "type")]
    pub kind: TextKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

/// Discriminator for text runs; only ever serializes as `"text"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    #[serde(rename = "text")]
    Text,
}

/// A formatting mark on a text run, named after the formatting attribute key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub mark_type: String,
}

impl Mark {
    pub fn new(mark_type: impl Into<String>) -> Self {
        Self { mark_type: mark_type.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_element_serializes_to_type_only() {
        let value = serde_json::to_value(Node::element("horizontal_rule")).expect("serialize");
        assert_eq!(value, json!({ "type": "horizontal_rule" }));
    }

    #[test]
    fn element_with_attrs_and_content() {
        let mut attrs = Map::new();
        attrs.insert("level".into(), json!(2));
        let node = Node::element("heading")
            .with_attrs(attrs)
            .with_content(vec![Node::text("Title").with_marks(["em"])]);

        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "heading",
                "attrs": { "level": 2 },
                "content": [{ "type": "text", "text": "Title", "marks": [{ "type": "em" }] }]
            })
        );
    }

    #[test]
    fn unformatted_text_run_omits_marks() {
        let value = serde_json::to_value(Node::text("plain")).expect("serialize");
        assert_eq!(value, json!({ "type": "text", "text": "plain" }));
    }

    #[test]
    fn text_runs_ignore_element_builders() {
        let node = Node::text("x").with_content(vec![Node::element("p")]);
        assert_eq!(node, Node::text("x"));
        assert_eq!(node.node_type(), "text");
    }

    #[test]
    fn deserializes_text_and_element_variants() {
        let nodes: Vec<Node> = serde_json::from_value(json!([
            { "type": "paragraph", "content": [{ "type": "text", "text": "hi" }] },
            { "type": "text", "text": "bold", "marks": [{ "type": "strong" }] }
        ]))
        .expect("deserialize");

        assert_eq!(
            nodes,
            vec![
                Node::element("paragraph").with_content(vec![Node::text("hi")]),
                Node::text("bold").with_marks(["strong"]),
            ]
        );
    }
}
