//! Declarative schema for the world export, and its compiled form.
//!
//! A [`Schema`] is what authors write (JSON, field order preserved). It is
//! compiled exactly once into [`CompiledTypes`]: kinds are checked against the
//! fixed vocabulary, every element reference is resolved, reconciled fields
//! are marked elided, and relation predicates are derived per type.
//!
//! Design goals:
//! - Interpreted at load time. A schema change is a data change.
//! - Deterministic: compiling the same schema twice yields identical enum
//!   ordinals and identical relation predicates.
//! - Authoring mistakes fail here, before a single token is read.
pub mod case;
pub mod enums;
pub mod reconcile;
pub mod relations;

use std::collections::{BTreeMap, HashSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use enums::{EnumDomain, EnumRegistry};
pub use reconcile::{Captured, ReconciliationTable, Refinement};
pub use relations::{Predicate, RelationKind, RelationPatterns, Relations};

use crate::record::Record;

// ------------------------------- Policy ---------------------------------- //

const DEFAULT_DISCRIMINANT: &str = "type";

/// Tag the plus export uses for ids of nested, site-local records.
const LOCAL_ID_TAG: &str = "local_id";

/// Entry naming the variant inside an external payload. Subtype fields may
/// not use it.
pub const VARIANT_KEY: &str = "type";

/// The bundled schema for the world export.
const BUNDLED_SCHEMA: &str = include_str!("../schema/df_world.json");

// ————————————————————————————————————————————————————————————————————————————
// AUTHORED SCHEMA
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Object type of the export's document element.
    pub root: String,
    /// Tag selecting the subtype of polymorphic types.
    #[serde(default = "default_discriminant")]
    pub discriminant: String,
    /// Per relation kind field-name pattern overrides (keyed by kind name).
    #[serde(default)]
    pub relations: BTreeMap<String, String>,
    /// Enum domains: raw strings observed for each domain.
    #[serde(default)]
    pub enums: IndexMap<String, Vec<String>>,
    /// Reconciliation table: type → plus field → base field.
    #[serde(default)]
    pub same_fields: IndexMap<String, IndexMap<String, String>>,
    pub objects: IndexMap<String, ObjectDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectDecl {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub named: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtypes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtypeof: Option<String>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldDecl>,
    /// Derived fields: never parsed, written by the linker.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub additional: IndexMap<String, FieldDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<String>,
    #[serde(default = "default_legend")]
    pub legend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
}

fn default_discriminant() -> String { DEFAULT_DISCRIMINANT.to_string() }
fn default_legend() -> String { "base".to_string() }

impl Schema {
    pub fn from_json_str(src: &str) -> Result<Self, SchemaError> {
        crate::path_de::from_str_with_path(src)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self, SchemaError> {
        let bytes = std::fs::read(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        crate::path_de::from_slice_with_path(&bytes)
    }

    /// The schema shipped with the crate (`schema/df_world.json`).
    pub fn bundled() -> Result<Self, SchemaError> {
        Self::from_json_str(BUNDLED_SCHEMA)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// COMPILED TYPES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Int,
    String,
    Bool,
    Enum,
    /// Nested object: the field's tag *is* the element.
    Object,
    /// Wrapper tag whose children are elements of the element type.
    Array,
    /// Wrapper tag whose children are keyed by their own id.
    Map,
}

impl FieldKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(Self::Int),
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "enum" => Some(Self::Enum),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "map" => Some(Self::Map),
            _ => None,
        }
    }
    pub fn is_scalar(self) -> bool {
        matches!(self, Self::Int | Self::String | Self::Bool | Self::Enum)
    }
    fn references_object(self) -> bool {
        matches!(self, Self::Object | Self::Array | Self::Map)
    }
}

/// Which export supplies a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Base,
    Plus,
    Both,
    /// Filled by the linker, never by the parser.
    Derived,
}

impl Source {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "base" => Some(Self::Base),
            "plus" => Some(Self::Plus),
            "both" => Some(Self::Both),
            "add" | "derived" => Some(Self::Derived),
            _ => None,
        }
    }
    pub fn active(self, pass: Pass) -> bool {
        match (self, pass) {
            (Self::Both, _) => true,
            (Self::Base, Pass::Base) => true,
            (Self::Plus, Pass::Augment) => true,
            _ => false,
        }
    }
}

/// Which of the two exports is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Allocates a fresh record per element.
    Base,
    /// Merges into the record the base pass produced.
    Augment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Tag name in the export.
    pub name: String,
    /// Key the value is stored under in a [`Record`].
    pub key: String,
    pub kind: FieldKind,
    pub multiple: bool,
    /// Object type (object/array/map) or enum domain (enum).
    pub elements: Option<String>,
    pub source: Source,
    pub related: Option<RelationKind>,
    /// Set when reconciliation maps this plus field onto a base field.
    pub elided_into: Option<String>,
}

impl FieldSpec {
    pub fn is_elided(&self) -> bool {
        self.elided_into.is_some()
    }
    /// lowerCamel name used in the external shape.
    pub fn external_name(&self) -> String {
        case::to_lower_camel(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    pub name: String,
    pub id: bool,
    pub named: bool,
    /// Declared fields in schema order, derived fields last. Keyed by tag.
    pub fields: IndexMap<String, FieldSpec>,
    /// Variant names (CamelCase) of a polymorphic parent.
    pub subtypes: Vec<String>,
    pub subtype_of: Option<String>,
    pub relations: Relations,
}

impl ObjectType {
    pub fn field(&self, tag: &str) -> Option<&FieldSpec> {
        self.fields.get(tag)
    }

    pub fn is_polymorphic(&self) -> bool {
        !self.subtypes.is_empty()
    }

    /// Resolve a raw discriminant to `(variant index, variant name)`.
    pub fn variant(&self, raw: &str) -> Option<(usize, &str)> {
        let wanted = case::to_camel(raw);
        self.subtypes
            .iter()
            .enumerate()
            .find(|(_, v)| **v == wanted)
            .map(|(i, v)| (i, v.as_str()))
    }

    /// Name of the object type implementing `variant`.
    pub fn subtype_name(&self, variant: &str) -> String {
        format!("{}{}", self.name, variant)
    }

    /// Tag carrying the record id in the export.
    pub fn id_tag(&self) -> &str {
        self.fields
            .values()
            .find(|f| f.key == "id")
            .map(|f| f.name.as_str())
            .unwrap_or("id")
    }
}

#[derive(Debug, Clone)]
pub struct CompiledTypes {
    pub root: String,
    pub discriminant: String,
    pub types: IndexMap<String, ObjectType>,
    pub enums: EnumRegistry,
    pub reconciliation: ReconciliationTable,
}

impl CompiledTypes {
    pub fn get(&self, name: &str) -> Option<&ObjectType> {
        self.types.get(name)
    }

    /// The root type. Presence is checked by [`compile`].
    pub fn root_type(&self) -> &ObjectType {
        &self.types[self.root.as_str()]
    }

    /// Does `record` (or its payload) reference `id` under `kind`?
    pub fn related(&self, kind: RelationKind, record: &Record, id: i64) -> bool {
        let own = self
            .get(record.type_name())
            .is_some_and(|t| t.relations.related(kind, record, id));
        own || record.payload().is_some_and(|p| self.related(kind, &p.record, id))
    }

    /// Structure relation: `structure` carries its owning site in `site_id`
    /// (filled by the linker).
    pub fn related_to_structure(&self, record: &Record, structure: &Record) -> bool {
        let site_id = structure.get_int("site_id");
        let structure_id = structure.id();
        let own = self
            .get(record.type_name())
            .is_some_and(|t| t.relations.related_to_structure(record, site_id, structure_id));
        own || record
            .payload()
            .is_some_and(|p| self.related_to_structure(&p.record, structure))
    }
}

// ————————————————————————————————————————————————————————————————————————————
// ERRORS
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("schema at JSON path {path} → {message}")]
    Decode { path: String, message: String },
    #[error("{object}.{field}: unrecognized field kind `{kind}`")]
    UnknownKind { object: String, field: String, kind: String },
    #[error("{object}.{field}: unrecognized legend `{legend}`")]
    UnknownSource { object: String, field: String, legend: String },
    #[error("{object}.{field}: kind `{kind}` needs an element type")]
    MissingElements { object: String, field: String, kind: String },
    #[error("{object}.{field}: references undeclared {what} `{element}`")]
    UndeclaredElement { object: String, field: String, what: &'static str, element: String },
    #[error("{object}: subtype `{subtype}` is not declared")]
    UndeclaredSubtype { object: String, subtype: String },
    #[error("{subtype}: expected `subtypeof` = `{parent}`")]
    SubtypeMismatch { parent: String, subtype: String },
    #[error("object type `{0}` is declared twice")]
    DuplicateObject(String),
    #[error("{object}.{field}: `type` is reserved in subtypes")]
    ReservedField { object: String, field: String },
    #[error("root type `{0}` is not declared")]
    UndeclaredRoot(String),
    #[error("unknown relation kind `{0}`")]
    UnknownRelation(String),
    #[error("relation pattern for `{kind}` is invalid: {source}")]
    BadPattern { kind: String, #[source] source: regex::Error },
    #[error("same_fields {object}.{plus} → {base}: {reason}")]
    BadReconciliation { object: String, plus: String, base: String, reason: &'static str },
}

// ————————————————————————————————————————————————————————————————————————————
// COMPILE
// ————————————————————————————————————————————————————————————————————————————

pub fn compile(schema: &Schema) -> Result<CompiledTypes, SchemaError> {
    let enums = EnumRegistry::build(&schema.enums);
    let patterns = RelationPatterns::new(&schema.relations)?;

    // 0) names: a declaration's `name` wins over its key
    let mut names = HashSet::with_capacity(schema.objects.len());
    for (key, decl) in &schema.objects {
        let name = object_name(key, decl);
        if !names.insert(name.to_string()) {
            return Err(SchemaError::DuplicateObject(name.to_string()));
        }
    }

    // 1) fields: kinds, sources, element references
    let mut types = IndexMap::<String, ObjectType>::with_capacity(schema.objects.len());
    for (key, decl) in &schema.objects {
        let name = object_name(key, decl).to_string();
        let mut fields = IndexMap::new();
        let declared = decl.fields.iter().map(|f| (f, false));
        let derived = decl.additional.iter().map(|f| (f, true));
        for ((tag, f), is_derived) in declared.chain(derived) {
            let spec = compile_field(&names, &enums, &name, decl, tag, f, is_derived)?;
            if decl.subtypeof.is_some() && spec.external_name() == VARIANT_KEY {
                return Err(SchemaError::ReservedField { object: name.clone(), field: tag.clone() });
            }
            fields.insert(tag.clone(), spec);
        }
        types.insert(name.clone(), ObjectType {
            name,
            id: decl.id,
            named: decl.named,
            fields,
            subtypes: decl.subtypes.clone().unwrap_or_default(),
            subtype_of: decl.subtypeof.clone(),
            relations: Relations::default(),
        });
    }

    // 2) polymorphism: every variant resolves, and points back
    for ty in types.values() {
        for variant in &ty.subtypes {
            let sub_name = ty.subtype_name(variant);
            let sub = types.get(&sub_name).ok_or_else(|| SchemaError::UndeclaredSubtype {
                object: ty.name.clone(),
                subtype: sub_name.clone(),
            })?;
            if sub.subtype_of.as_deref() != Some(ty.name.as_str()) {
                return Err(SchemaError::SubtypeMismatch { parent: ty.name.clone(), subtype: sub_name });
            }
        }
    }

    if !types.contains_key(&schema.root) {
        return Err(SchemaError::UndeclaredRoot(schema.root.clone()));
    }

    // 3) reconciliation: elide mapped plus fields
    let reconciliation = ReconciliationTable::from_decl(&schema.same_fields);
    for (object, plus, base) in reconciliation.iter() {
        let bad = |reason| SchemaError::BadReconciliation {
            object: object.to_string(),
            plus: plus.to_string(),
            base: base.to_string(),
            reason,
        };
        let ty = types.get_mut(object).ok_or_else(|| bad("unknown object type"))?;
        let base_field = ty.fields.get(base).ok_or_else(|| bad("unknown base field"))?;
        let plus_field = ty.fields.get(plus).ok_or_else(|| bad("unknown plus field"))?;
        if !matches!(base_field.source, Source::Base | Source::Both) || plus_field.source != Source::Plus {
            return Err(bad("pair must map a plus field onto a base field"));
        }
        if base_field.kind != plus_field.kind || !plus_field.kind.is_scalar() {
            return Err(bad("kinds differ or are not scalar"));
        }
        if base_field.multiple || plus_field.multiple {
            return Err(bad("sequence fields are never reconciled"));
        }
        if let Some(f) = ty.fields.get_mut(plus) {
            f.elided_into = Some(base.to_string());
        }
    }

    // 4) relation predicates, after elision
    for ty in types.values_mut() {
        ty.relations = Relations::infer(&ty.fields, &patterns);
    }

    Ok(CompiledTypes {
        root: schema.root.clone(),
        discriminant: schema.discriminant.clone(),
        types,
        enums,
        reconciliation,
    })
}

fn object_name<'s>(key: &'s str, decl: &'s ObjectDecl) -> &'s str {
    if decl.name.is_empty() { key } else { &decl.name }
}

fn compile_field(
    names: &HashSet<String>,
    enums: &EnumRegistry,
    object: &str,
    decl: &ObjectDecl,
    tag: &str,
    f: &FieldDecl,
    is_derived: bool,
) -> Result<FieldSpec, SchemaError> {
    let kind = FieldKind::parse(&f.kind).ok_or_else(|| SchemaError::UnknownKind {
        object: object.to_string(),
        field: tag.to_string(),
        kind: f.kind.clone(),
    })?;
    let source = if is_derived {
        Source::Derived
    } else {
        Source::parse(&f.legend).ok_or_else(|| SchemaError::UnknownSource {
            object: object.to_string(),
            field: tag.to_string(),
            legend: f.legend.clone(),
        })?
    };
    let related = match &f.related {
        None => None,
        Some(r) => Some(RelationKind::from_key(r).ok_or_else(|| SchemaError::UnknownRelation(r.clone()))?),
    };

    if kind.references_object() || kind == FieldKind::Enum {
        let element = f.elements.as_ref().ok_or_else(|| SchemaError::MissingElements {
            object: object.to_string(),
            field: tag.to_string(),
            kind: f.kind.clone(),
        })?;
        let (found, what) = if kind == FieldKind::Enum {
            (enums.get(element).is_some(), "enum domain")
        } else {
            (names.contains(element), "object type")
        };
        if !found {
            return Err(SchemaError::UndeclaredElement {
                object: object.to_string(),
                field: tag.to_string(),
                what,
                element: element.clone(),
            });
        }
    }

    // site-local records carry their id as `local_id`
    let key = if decl.id && tag == LOCAL_ID_TAG && !decl.fields.contains_key("id") {
        "id".to_string()
    } else {
        tag.to_string()
    };

    Ok(FieldSpec {
        name: tag.to_string(),
        key,
        kind,
        multiple: f.multiple,
        elements: f.elements.clone(),
        source,
        related,
        elided_into: None,
    })
}
