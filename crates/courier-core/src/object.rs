//! The local object graph: objects, field values and class metadata.
//!
//! Courier does not own the business model. Applications describe their
//! classes with a [`Schema`] and the engine reads and writes [`Object`]s
//! through the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::ObjectKey;

/// Type of a scalar property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Text => "text",
            ScalarType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// The type of this value.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Bool(_) => ScalarType::Bool,
            Scalar::Int(_) => ScalarType::Int,
            Scalar::Float(_) => ScalarType::Float,
            Scalar::Text(_) => ScalarType::Text,
            Scalar::Bytes(_) => ScalarType::Bytes,
        }
    }

    /// Textual form, as carried in change records next to the raw value.
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Bool(v) => v.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Text(v) => v.clone(),
            Scalar::Bytes(v) => hex::encode(v),
        }
    }

    /// Parse the textual form for a property of type `ty`.
    pub fn parse(ty: ScalarType, text: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidScalar {
            ty: ty.to_string(),
            value: text.to_string(),
        };
        Ok(match ty {
            ScalarType::Bool => Scalar::Bool(text.parse().map_err(|_| invalid())?),
            ScalarType::Int => Scalar::Int(text.parse().map_err(|_| invalid())?),
            ScalarType::Float => Scalar::Float(text.parse().map_err(|_| invalid())?),
            ScalarType::Text => Scalar::Text(text.to_string()),
            ScalarType::Bytes => Scalar::Bytes(hex::decode(text).map_err(|_| invalid())?),
        })
    }

    /// Raw serialized form (CBOR), which preserves the exact type.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail for these plain variants.
        let _ = ciborium::into_writer(self, &mut buf);
        buf
    }

    /// Decode the raw serialized form.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        ciborium::from_reader(raw).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

/// The value held by one field of an object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Scalar(Scalar),
    Ref(ObjectKey),
    Collection(Vec<ObjectKey>),
}

impl FieldValue {
    /// The referenced object, if this is a reference.
    pub fn as_ref_key(&self) -> Option<&ObjectKey> {
        match self {
            FieldValue::Ref(key) => Some(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<Scalar> for FieldValue {
    fn from(s: Scalar) -> Self {
        FieldValue::Scalar(s)
    }
}

/// An object in the local graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub key: ObjectKey,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Object {
    /// Create an object with no fields set.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Read a field; unset fields read as `Null`.
    pub fn get(&self, name: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    /// Add `member` to a collection field, ignoring duplicates.
    pub fn add_member(&mut self, name: &str, member: ObjectKey) {
        let entry = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| FieldValue::Collection(Vec::new()));
        if !matches!(entry, FieldValue::Collection(_)) {
            *entry = FieldValue::Collection(Vec::new());
        }
        if let FieldValue::Collection(members) = entry {
            if !members.contains(&member) {
                members.push(member);
            }
        }
    }

    /// Remove `member` from a collection field.
    pub fn remove_member(&mut self, name: &str, member: &ObjectKey) {
        if let Some(FieldValue::Collection(members)) = self.fields.get_mut(name) {
            members.retain(|m| m != member);
        }
    }
}

/// Shape of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Scalar(ScalarType),
    Reference {
        class: String,
        /// Aggregated references are owned by their holder.
        aggregated: bool,
        /// Create the aggregate together with the owner.
        auto_create: bool,
    },
    Collection {
        class: String,
    },
}

/// Metadata for one property of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub kind: PropertyKind,
    pub read_only: bool,
}

impl PropertyInfo {
    pub fn scalar(name: &str, ty: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Scalar(ty),
            read_only: false,
        }
    }

    pub fn reference(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Reference {
                class: class.to_string(),
                aggregated: false,
                auto_create: false,
            },
            read_only: false,
        }
    }

    /// An aggregated reference created together with its owner.
    pub fn aggregate(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Reference {
                class: class.to_string(),
                aggregated: true,
                auto_create: true,
            },
            read_only: false,
        }
    }

    pub fn collection(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Collection {
                class: class.to_string(),
            },
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn is_aggregated(&self) -> bool {
        matches!(self.kind, PropertyKind::Reference { aggregated: true, .. })
    }
}

/// Business key used to find an object when no identity mapping exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKey {
    pub property: String,
    pub case_insensitive: bool,
    pub ignore_spaces: bool,
}

impl NaturalKey {
    /// Normalize a key value according to this key's comparison rules.
    pub fn normalize(&self, value: &str) -> String {
        let mut v: String = if self.ignore_spaces {
            value.chars().filter(|c| !c.is_whitespace()).collect()
        } else {
            value.to_string()
        };
        if self.case_insensitive {
            v = v.to_lowercase();
        }
        v
    }
}

/// A replicable method: name plus parameter count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub params: usize,
}

/// Metadata for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    /// Assembly / module the class lives in; carried on references.
    pub assembly: String,
    pub properties: Vec<PropertyInfo>,
    pub natural_key: Option<NaturalKey>,
    pub methods: Vec<MethodInfo>,
    /// Never included in snapshots.
    pub snapshot_excluded: bool,
}

impl ClassInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            assembly: String::new(),
            properties: Vec::new(),
            natural_key: None,
            methods: Vec::new(),
            snapshot_excluded: false,
        }
    }

    pub fn assembly(mut self, assembly: &str) -> Self {
        self.assembly = assembly.to_string();
        self
    }

    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare a natural key with case- and space-insensitive comparison.
    pub fn natural_key(mut self, property: &str) -> Self {
        self.natural_key = Some(NaturalKey {
            property: property.to_string(),
            case_insensitive: true,
            ignore_spaces: true,
        });
        self
    }

    pub fn method(mut self, name: &str, params: usize) -> Self {
        self.methods.push(MethodInfo {
            name: name.to_string(),
            params,
        });
        self
    }

    pub fn exclude_from_snapshot(mut self) -> Self {
        self.snapshot_excluded = true;
        self
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn has_method(&self, name: &str, params: usize) -> bool {
        self.methods.iter().any(|m| m.name == name && m.params == params)
    }

    /// The natural key value of `object`, if the class declares one.
    pub fn natural_key_of(&self, object: &Object) -> Option<String> {
        let key = self.natural_key.as_ref()?;
        match object.get(&key.property) {
            FieldValue::Scalar(s) => Some(s.to_text()),
            _ => None,
        }
    }
}

/// All classes known to the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    classes: BTreeMap<String, ClassInfo>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: ClassInfo) -> Self {
        self.add_class(class);
        self
    }

    pub fn add_class(&mut self, class: ClassInfo) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    /// Classes in name order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }

    /// Create an object of `class` with a fresh key, together with its
    /// auto-created aggregates. The owner is returned first.
    pub fn instantiate(&self, key: ObjectKey) -> Vec<Object> {
        let mut owner = Object::new(key);
        let mut created = Vec::new();
        if let Some(class) = self.class(&owner.key.class) {
            for prop in &class.properties {
                if let PropertyKind::Reference {
                    class: target,
                    auto_create: true,
                    ..
                } = &prop.kind
                {
                    // Aggregates of aggregates are created too.
                    let nested = self.instantiate(ObjectKey::generate(target.clone()));
                    owner.set(&prop.name, FieldValue::Ref(nested[0].key.clone()));
                    created.extend(nested);
                }
            }
        }
        let mut out = Vec::with_capacity(created.len() + 1);
        out.push(owner);
        out.extend(created);
        out
    }
}
