// Adapter from yrs XML handles to an owned tree of `TreeItem`s.
//
// yrs distinguishes text-bearing nodes from elements by handle type; the
// classification is resolved here once so the serializer only ever sees the
// tagged union below.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use yrs::types::text::{Diff, YChange};
use yrs::{Any, Out, ReadTxn, Text, Xml, XmlFragment, XmlFragmentRef, XmlOut};

/// One item of a CRDT document tree, detached from the CRDT runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeItem {
    /// A text-bearing item, decoded into its delta runs.
    Text(Vec<DeltaRun>),
    /// A tagged element with attributes and ordered children.
    Element(ElementItem),
    /// A handle exposing neither a tag name nor a delta, e.g. a nested fragment.
    Malformed { kind: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementItem {
    pub tag: String,
    pub attrs: Map<String, Value>,
    pub children: Vec<TreeItem>,
}

/// A contiguous span of text sharing the same formatting attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRun {
    pub insert: String,
    pub attributes: BTreeMap<String, Value>,
}

impl DeltaRun {
    pub fn plain(insert: impl Into<String>) -> Self {
        Self { insert: insert.into(), attributes: BTreeMap::new() }
    }

    pub fn formatted<I, K>(insert: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            insert: insert.into(),
            attributes: attributes.into_iter().map(|(key, value)| (key.into(), value)).collect(),
        }
    }
}

/// Read the top-level children of an XML fragment.
pub fn read_fragment<T: ReadTxn>(fragment: &XmlFragmentRef, txn: &T) -> Vec<TreeItem> {
    fragment.children(txn).map(|child| read_node(child, txn)).collect()
}

fn read_node<T: ReadTxn>(node: XmlOut, txn: &T) -> TreeItem {
    match node {
        XmlOut::Element(element) => TreeItem::Element(ElementItem {
            tag: element.tag().to_string(),
            attrs: element
                .attributes(txn)
                .map(|(name, value)| (name.to_string(), Value::String(value)))
                .collect(),
            children: element.children(txn).map(|child| read_node(child, txn)).collect(),
        }),
        XmlOut::Text(text) => TreeItem::Text(
            text.diff(txn, YChange::identity).into_iter().map(|run| read_run(run, txn)).collect(),
        ),
        XmlOut::Fragment(_) => TreeItem::Malformed { kind: "fragment" },
    }
}

fn read_run<T: ReadTxn>(run: Diff<YChange>, txn: &T) -> DeltaRun {
    let insert = match run.insert {
        Out::Any(Any::String(text)) => text.to_string(),
        other => other.to_string(txn),
    };
    let attributes = run
        .attributes
        .map(|attrs| {
            attrs.iter().map(|(key, value)| (key.to_string(), any_to_json(value))).collect()
        })
        .unwrap_or_default();

    DeltaRun { insert, attributes }
}

/// Convert a yrs `Any` into a JSON value. Map keys come out sorted.
pub fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(flag) => Value::Bool(*flag),
        Any::Number(number) => Number::from_f64(*number).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(number) => Value::Number((*number).into()),
        Any::String(text) => Value::String(text.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect(),
        ),
    }
}
