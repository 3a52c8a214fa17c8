//! Core data model: names, attributes, records, and modify elements.
//!
//! A [`Record`] is the unit of storage: a unique hierarchical [`Name`] plus
//! an ordered sequence of named, multi-valued [`Attribute`]s. Values are
//! opaque byte strings; how they compare is decided by the schema
//! collaborator, not by this module.

use std::fmt;
use std::hash::{Hash, Hasher};

/// An opaque attribute value.
pub type Value = Vec<u8>;

/// The reserved marker that opens the name of every special record.
///
/// Names starting with this marker are case-sensitive and are never
/// case-folded when deriving storage keys.
pub const RESERVED_MARKER: char = '@';

/// A hierarchical record name such as `cn=a,ou=people`.
///
/// Ordinary names compare case-insensitively; special names (those starting
/// with [`RESERVED_MARKER`]) compare exactly. Equality and hashing follow
/// the folded form, so two spellings of the same ordinary name are the same
/// `Name`.
#[derive(Debug, Clone)]
pub struct Name(String);

impl Name {
    /// Wraps a raw name string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name exactly as supplied.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a reserved special-record name.
    pub fn is_special(&self) -> bool {
        self.0.starts_with(RESERVED_MARKER)
    }

    /// The comparison/key form: lowercased for ordinary names, untouched
    /// for special names.
    pub fn folded(&self) -> String {
        if self.is_special() {
            self.0.clone()
        } else {
            self.0.to_lowercase()
        }
    }

    /// The name one level up the hierarchy, if any.
    ///
    /// `cn=a,ou=b` → `ou=b`; a single-component name has no parent.
    pub fn parent(&self) -> Option<Name> {
        self.0.split_once(',').map(|(_, rest)| Name::new(rest.trim_start()))
    }

    /// Whether `self` sits strictly below `base` in the hierarchy.
    ///
    /// An empty `base` denotes the root and contains every ordinary name.
    /// Component escaping is not interpreted; names are compared on their
    /// comma-separated folded text.
    pub fn is_descendant_of(&self, base: &Name) -> bool {
        if self.is_special() {
            return false;
        }
        if base.0.is_empty() {
            return true;
        }
        let folded = self.folded();
        let base_folded = base.folded();
        folded != base_folded && folded.ends_with(&format!(",{base_folded}"))
    }

    /// Whether `self` is an immediate child of `base`.
    pub fn is_child_of(&self, base: &Name) -> bool {
        if self.is_special() {
            return false;
        }
        if base.0.is_empty() {
            return self.parent().is_none();
        }
        self.parent().map_or(false, |p| p == *base)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.folded() == other.folded()
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

/// Folds an attribute name to its comparison form.
pub fn fold_attr_name(name: &str) -> String {
    name.to_lowercase()
}

/// Per-element behavior flags carried by an [`Attribute`].
///
/// These are request-scoped and are not persisted with the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeFlags {
    /// Treat the attribute as single-valued even if the schema says
    /// otherwise.
    pub force_single_value: bool,
    /// Skip the single-value constraint check for this element entirely.
    pub skip_single_value_check: bool,
}

/// A named, ordered, possibly multi-valued field on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// The attribute name. Compared case-insensitively.
    pub name: String,
    /// The ordered value list.
    pub values: Vec<Value>,
    /// Request-scoped behavior flags.
    pub flags: AttributeFlags,
}

impl Attribute {
    /// Builds an attribute from a name and a value list.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
            flags: AttributeFlags::default(),
        }
    }

    /// Builds a single-value attribute.
    pub fn single(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, vec![value.into()])
    }

    /// The folded attribute name.
    pub fn folded_name(&self) -> String {
        fold_attr_name(&self.name)
    }
}

/// A named entity with an ordered set of attributes; the unit of storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The unique record name.
    pub name: Name,
    /// The ordered attribute list.
    pub attributes: Vec<Attribute>,
}

impl Record {
    /// Builds an empty record.
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    /// Builds a record with the given attributes.
    pub fn with_attributes(name: impl Into<Name>, attributes: Vec<Attribute>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    /// Appends an attribute, builder style.
    pub fn attr(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Finds an attribute by case-insensitive name.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        let folded = fold_attr_name(name);
        self.attributes.iter().find(|a| a.folded_name() == folded)
    }

    /// Position of an attribute by case-insensitive name.
    pub fn position(&self, folded_name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| a.folded_name() == folded_name)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name::new(s)
    }
}

/// The policy a modify element applies to its attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    /// Merge the element's values into the stored attribute.
    Add,
    /// Delete the stored attribute, then recreate it with the element's
    /// values.
    Replace,
    /// Remove the whole attribute (no values given) or specific values.
    Delete,
}

/// One element of a modify request: a policy plus the attribute it applies
/// to.
#[derive(Debug, Clone)]
pub struct ModElement {
    /// What to do with the attribute.
    pub op: ModOp,
    /// The attribute name, values, and flags the policy operates on.
    pub attribute: Attribute,
}

impl ModElement {
    /// Builds a modify element.
    pub fn new(op: ModOp, attribute: Attribute) -> Self {
        Self { op, attribute }
    }
}

/// Search scope relative to the base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The base record only.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything below it.
    Subtree,
}

/// An attribute-equality search filter.
///
/// Richer filter algebra is out of scope; a single equality test is enough
/// to exercise the index path.
#[derive(Debug, Clone)]
pub struct Filter {
    /// The attribute to test.
    pub attribute: String,
    /// The value the attribute must carry (per schema comparison).
    pub value: Value,
}

impl Filter {
    /// Builds an equality filter.
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// Which sequence-number reading a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// The highest sequence number a committed mutation has reached.
    HighestCommitted,
    /// The sequence number the next committed mutation will carry.
    Next,
    /// The last-modification time as seconds since the Unix epoch.
    HighestTimestamp,
}
