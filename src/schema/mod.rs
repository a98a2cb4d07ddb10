//! Schema model: typed field and relationship descriptors.
//!
//! A schema is declared as a map of entity type -> field name -> declaration
//! string. Declarations are parsed once, validated eagerly and then shared
//! read-only (`Arc<ParsedSchema>`) by the resolver, cascade and draft layers.

mod parser;

pub use parser::{parse_schema, parse_schema_file, SchemaParser};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{EntigraphError, Result};

/// Threshold used by fuzzy declarations that do not carry `(t)`.
pub const DEFAULT_FUZZY_THRESHOLD: f32 = 0.5;

/// Auto-managed timestamp fields, disabled per type by declaring them `null`.
pub const AUTO_FIELDS: &[&str] = &["createdAt", "updatedAt"];

/// The four relationship operators of the DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationOperator {
    /// `->` stored id(s)
    ForwardExact,
    /// `~>` stored description, create-or-reuse
    ForwardFuzzy,
    /// `<-` computed reverse lookup
    BackwardExact,
    /// `<~` read-only grounding against reference data
    BackwardFuzzy,
}

impl RelationOperator {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "->" => Some(Self::ForwardExact),
            "~>" => Some(Self::ForwardFuzzy),
            "<-" => Some(Self::BackwardExact),
            "<~" => Some(Self::BackwardFuzzy),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::ForwardExact => "->",
            Self::ForwardFuzzy => "~>",
            Self::BackwardExact => "<-",
            Self::BackwardFuzzy => "<~",
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, Self::ForwardExact | Self::ForwardFuzzy)
    }

    pub fn is_fuzzy(&self) -> bool {
        matches!(self, Self::ForwardFuzzy | Self::BackwardFuzzy)
    }
}

/// Base type of a non-relationship field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PrimitiveType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    DateTime,
    Url,
    Email,
    Markdown,
    Json,
    /// `Draft | Published | Archived`
    Enum(Vec<String>),
    /// Bare PascalCase token (verb or enum marker)
    Marker(String),
}

impl PrimitiveType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "string" | "text" => Some(Self::String),
            "number" | "float" => Some(Self::Number),
            "int" | "integer" => Some(Self::Integer),
            "bool" | "boolean" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "datetime" | "timestamp" => Some(Self::DateTime),
            "url" => Some(Self::Url),
            "email" => Some(Self::Email),
            "markdown" | "md" => Some(Self::Markdown),
            "json" | "object" => Some(Self::Json),
            _ => None,
        }
    }

    /// Whether values of this type are produced by the content generator.
    pub fn is_generated_text(&self) -> bool {
        matches!(self, Self::String | Self::Markdown | Self::Enum(_))
    }
}

/// How a backward declaration without an explicit field picks among several
/// matching forward descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackrefPolicy {
    /// First declared candidate wins, with a warning.
    #[default]
    FirstDeclared,
    /// Ambiguity is a schema error.
    Reject,
}

/// A parsed relationship declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipDescriptor {
    pub operator: RelationOperator,
    /// Type declaring the field.
    pub source_type: String,
    /// Field carrying the declaration.
    pub source_field: String,
    /// Target type(s); more than one only for unions such as `Tool|Software`.
    pub target_types: Vec<String>,
    /// For forward fields: the reverse field on the target. For backward
    /// fields: the forward field on the target that points back here.
    pub backref_field: Option<String>,
    /// Always `Some` for fuzzy operators, `None` for exact ones.
    pub threshold: Option<f32>,
}

impl RelationshipDescriptor {
    /// Primary target type (first member of a union).
    pub fn target_type(&self) -> &str {
        &self.target_types[0]
    }

    pub fn threshold_or(&self, fallback: f32) -> f32 {
        self.threshold.unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldKind {
    Primitive(PrimitiveType),
    Relationship(RelationshipDescriptor),
}

/// One field of an entity type after parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedField {
    pub name: String,
    pub kind: FieldKind,
    pub is_array: bool,
    pub is_optional: bool,
    pub is_required: bool,
    pub indexed: bool,
    pub unique: bool,
    /// Free-text generation prompt, when the declaration carries one.
    pub prompt: Option<String>,
    /// Original declaration text.
    pub declaration: String,
    /// Created from another type's backref rather than declared.
    pub synthesized: bool,
}

impl ParsedField {
    pub fn relationship(&self) -> Option<&RelationshipDescriptor> {
        match &self.kind {
            FieldKind::Relationship(rel) => Some(rel),
            FieldKind::Primitive(_) => None,
        }
    }

    pub fn primitive(&self) -> Option<&PrimitiveType> {
        match &self.kind {
            FieldKind::Primitive(p) => Some(p),
            FieldKind::Relationship(_) => None,
        }
    }

    pub fn is_relationship(&self) -> bool {
        self.relationship().is_some()
    }

    pub fn fuzzy_threshold(&self) -> Option<f32> {
        self.relationship().and_then(|r| r.threshold)
    }
}

/// All fields of one entity type, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<ParsedField>,
    /// `$instructions`
    pub instructions: Option<String>,
    /// `$context`: types offered to the generator as prompt material.
    pub context_types: Vec<String>,
    /// Other `$`-prefixed keys, kept verbatim.
    pub metadata: Map<String, Value>,
    /// Fields declared `null`.
    pub disabled: Vec<String>,
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&ParsedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn field_mut(&mut self, name: &str) -> Option<&mut ParsedField> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&ParsedField, &RelationshipDescriptor)> {
        self.fields
            .iter()
            .filter_map(|f| f.relationship().map(|r| (f, r)))
    }

    pub fn primitives(&self) -> impl Iterator<Item = (&ParsedField, &PrimitiveType)> {
        self.fields
            .iter()
            .filter_map(|f| f.primitive().map(|p| (f, p)))
    }

    pub fn auto_field_enabled(&self, name: &str) -> bool {
        AUTO_FIELDS.contains(&name) && !self.disabled.iter().any(|d| d == name)
    }
}

/// Parsed, validated schema. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedSchema {
    entities: Vec<EntitySchema>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ParsedSchema {
    pub(crate) fn from_entities(entities: Vec<EntitySchema>) -> Self {
        let index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        Self { entities, index }
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.index.get(name).map(|&i| &self.entities[i])
    }

    pub fn require_entity(&self, name: &str) -> Result<&EntitySchema> {
        self.entity(name)
            .ok_or_else(|| EntigraphError::Schema(format!("unknown entity type '{}'", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Descriptor of `entity_type.field`, or a schema error if the field is
    /// not a relationship.
    pub fn descriptor(&self, entity_type: &str, field: &str) -> Result<&RelationshipDescriptor> {
        let entity = self.require_entity(entity_type)?;
        entity
            .field(field)
            .and_then(|f| f.relationship())
            .ok_or_else(|| {
                EntigraphError::Schema(format!(
                    "{}.{} is not a relationship field",
                    entity_type, field
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
