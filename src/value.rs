// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};

/// A value yielded by evaluating a path expression against a source record.
///
/// The source value taxonomy is a closed union: every shape the populator
/// can receive is a variant here and is matched exhaustively. Composite
/// variants are `Rc`-backed so that cloning a value (helpers are walked
/// once per candidate instance) shares substructure.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(Rc<str>),

    // A terminology code without its surrounding coding.
    Code(Rc<str>),

    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<FixedOffset>),

    Quantity(Rc<Quantity>),
    Ratio(Rc<Ratio>),
    Coding(Rc<Coding>),
    Concept(Rc<Concept>),
    Identifier(Rc<Identifier>),
    Attachment(Rc<Attachment>),
    Extension(Rc<Extension>),
    Reference(Rc<Reference>),

    // A complex element or resource: entity kind, logical id and an
    // attribute -> values multimap.
    Node(Rc<Node>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quantity {
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub code: Option<String>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ratio {
    pub numerator: Option<Quantity>,
    pub denominator: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coding {
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Concept {
    pub codings: Vec<Coding>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identifier {
    pub value: Option<String>,
    pub system: Option<String>,
    pub assigner: Option<String>,
    pub kind: Option<Concept>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub url: Option<String>,
    pub data: Option<Vec<u8>>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub url: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reference {
    pub reference: Option<String>,
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub kind: Rc<str>,
    pub id: Option<Rc<str>>,
    children: BTreeMap<Rc<str>, Vec<Value>>,
}

impl Node {
    pub fn new(kind: &str) -> Node {
        Node {
            kind: kind.into(),
            id: None,
            children: BTreeMap::new(),
        }
    }

    pub fn with_id(kind: &str, id: &str) -> Node {
        Node {
            kind: kind.into(),
            id: Some(id.into()),
            children: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, attribute: &str, value: Value) -> &mut Node {
        self.children
            .entry(attribute.into())
            .or_default()
            .push(value);
        self
    }

    pub fn children(&self, attribute: &str) -> &[Value] {
        match self.children.get(attribute) {
            Some(values) => values.as_slice(),
            None => &[],
        }
    }

    pub fn first_child(&self, attribute: &str) -> Option<&Value> {
        self.children.get(attribute).and_then(|v| v.first())
    }
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::String(s.into())
    }

    pub fn code(s: &str) -> Value {
        Value::Code(s.into())
    }

    pub fn node(node: Node) -> Value {
        Value::Node(Rc::new(node))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Value::Node(_))
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) | Value::Code(s) => Ok(s.as_ref()),
            _ => Err(anyhow!("not a string")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Boolean(b) => Ok(*b),
            _ => Err(anyhow!("not a boolean")),
        }
    }

    pub fn as_node(&self) -> Result<&Node> {
        match self {
            Value::Node(n) => Ok(n),
            _ => Err(anyhow!("not a node")),
        }
    }

    pub fn as_coding(&self) -> Result<&Coding> {
        match self {
            Value::Coding(c) => Ok(c),
            _ => Err(anyhow!("not a coding")),
        }
    }

    pub fn as_concept(&self) -> Result<&Concept> {
        match self {
            Value::Concept(c) => Ok(c),
            _ => Err(anyhow!("not a codeable concept")),
        }
    }

    pub fn as_quantity(&self) -> Result<&Quantity> {
        match self {
            Value::Quantity(q) => Ok(q),
            _ => Err(anyhow!("not a quantity")),
        }
    }

    pub fn as_reference(&self) -> Result<&Reference> {
        match self {
            Value::Reference(r) => Ok(r),
            _ => Err(anyhow!("not a reference")),
        }
    }

    /// The entity kind of this value when it is a typed node.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Value::Node(n) => Some(n.kind.as_ref()),
            _ => None,
        }
    }

    /// Renders a primitive representation of this value, used when the
    /// target path already designates a terminal attribute. Composite
    /// values without an obvious scalar rendering yield `None`.
    pub fn primitive_string(&self) -> Option<String> {
        match self {
            Value::Boolean(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::String(s) | Value::Code(s) => Some(s.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S").to_string()),
            Value::DateTime(dt) => Some(dt.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string()),
            Value::Quantity(q) => q.value.map(|v| v.to_string()),
            Value::Coding(c) => c.code.clone(),
            Value::Concept(c) => c.codings.first().and_then(|coding| coding.code.clone()),
            Value::Identifier(id) => id.value.clone(),
            Value::Reference(r) => r.reference.clone(),
            Value::Extension(e) => e.value.as_ref().and_then(|v| v.primitive_string()),
            Value::Ratio(_) | Value::Attachment(_) | Value::Node(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.primitive_string() {
            Some(s) => write!(f, "{s}"),
            None => match self {
                Value::Node(n) => write!(f, "{}", n.kind),
                _ => write!(f, "{self:?}"),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Decimal(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Quantity> for Value {
    fn from(q: Quantity) -> Self {
        Value::Quantity(Rc::new(q))
    }
}

impl From<Ratio> for Value {
    fn from(r: Ratio) -> Self {
        Value::Ratio(Rc::new(r))
    }
}

impl From<Coding> for Value {
    fn from(c: Coding) -> Self {
        Value::Coding(Rc::new(c))
    }
}

impl From<Concept> for Value {
    fn from(c: Concept) -> Self {
        Value::Concept(Rc::new(c))
    }
}

impl From<Identifier> for Value {
    fn from(i: Identifier) -> Self {
        Value::Identifier(Rc::new(i))
    }
}

impl From<Attachment> for Value {
    fn from(a: Attachment) -> Self {
        Value::Attachment(Rc::new(a))
    }
}

impl From<Extension> for Value {
    fn from(e: Extension) -> Self {
        Value::Extension(Rc::new(e))
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(Rc::new(r))
    }
}

impl From<Node> for Value {
    fn from(n: Node) -> Self {
        Value::Node(Rc::new(n))
    }
}
