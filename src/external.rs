//! External (JSON) shape of records, and reading it back.
//!
//! Fields appear under their lowerCamel names. Elided fields, unset ints and
//! unknown enums are left out; enums are written as their display strings;
//! maps become objects keyed by id. A polymorphic record's discriminant is
//! replaced by `payload`: the subtype's own shape plus a `type` entry naming
//! the variant.
use std::collections::BTreeMap;
use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::corpus::Corpus;
use crate::record::{Payload, Record, Value, UNSET};
use crate::schema::{case, CompiledTypes, FieldKind, FieldSpec, ObjectType, VARIANT_KEY};

const PAYLOAD_KEY: &str = "payload";

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("unknown object type `{0}`")]
    UnknownType(String),
    #[error("{type_name}: expected a JSON object")]
    NotAnObject { type_name: String },
    #[error("{type_name}.{field}: expected {expected}")]
    BadValue { type_name: String, field: String, expected: &'static str },
    #[error("{type_name}: unknown variant `{variant}`")]
    UnknownVariant { type_name: String, variant: String },
}

// ————————————————————————————————————————————————————————————————————————————
// WRITE
// ————————————————————————————————————————————————————————————————————————————

pub fn to_external(types: &CompiledTypes, record: &Record) -> Json {
    let Some(ty) = types.get(record.type_name()) else {
        return untyped(record);
    };
    let mut out = Map::new();
    for field in ty.fields.values() {
        if field.is_elided() || is_discriminant(types, ty, field) {
            continue;
        }
        if let Some(v) = field_to_external(types, field, record) {
            out.insert(field.external_name(), v);
        }
    }
    if let Some(payload) = record.payload() {
        out.insert(PAYLOAD_KEY.to_string(), payload_to_external(types, payload));
    }
    Json::Object(out)
}

/// The whole corpus: the root's own fields, with each collection under the
/// root field it was read from.
pub fn corpus_to_external(types: &CompiledTypes, corpus: &Corpus) -> Json {
    let mut out = match to_external(types, corpus.root()) {
        Json::Object(fields) => fields,
        _ => Map::new(),
    };
    for field in types.root_type().fields.values().filter(|f| f.kind == FieldKind::Map) {
        let Some(records) = field.elements.as_deref().and_then(|e| corpus.collection(e)) else { continue };
        let records: Map<String, Json> = records
            .iter()
            .map(|(id, r)| (id.to_string(), to_external(types, r)))
            .collect();
        out.insert(field.external_name(), Json::Object(records));
    }
    Json::Object(out)
}

fn payload_to_external(types: &CompiledTypes, payload: &Payload) -> Json {
    let mut out = Map::new();
    out.insert(VARIANT_KEY.to_string(), Json::String(case::to_delimited(&payload.name, ' ')));
    if let Json::Object(fields) = to_external(types, &payload.record) {
        out.extend(fields);
    }
    Json::Object(out)
}

fn field_to_external(types: &CompiledTypes, field: &FieldSpec, record: &Record) -> Option<Json> {
    let value = record.get(&field.key);
    let domain = field.elements.as_deref().unwrap_or_default();

    if field.multiple || field.kind == FieldKind::Array {
        let items: Vec<Json> = match value {
            Some(Value::List(xs)) => xs.iter().filter_map(|v| item_to_external(types, domain, v)).collect(),
            Some(single) => item_to_external(types, domain, single).into_iter().collect(),
            None => Vec::new(),
        };
        return Some(Json::Array(items));
    }

    match field.kind {
        FieldKind::Int => match record.get_int(&field.key) {
            UNSET => None,
            v => Some(Json::from(v)),
        },
        FieldKind::String => Some(Json::String(record.get_str(&field.key).to_string())),
        FieldKind::Bool => Some(Json::Bool(record.get_bool(&field.key))),
        FieldKind::Enum => match record.get_enum(&field.key) {
            0 => None,
            o => Some(Json::String(types.enums.display(domain, o).to_string())),
        },
        FieldKind::Object => value.and_then(Value::as_record).map(|r| to_external(types, r)),
        FieldKind::Map => {
            let mut out = Map::new();
            if let Some(Value::Map(records)) = value {
                for (id, r) in records {
                    out.insert(id.to_string(), to_external(types, r));
                }
            }
            Some(Json::Object(out))
        }
        FieldKind::Array => None,
    }
}

fn item_to_external(types: &CompiledTypes, domain: &str, value: &Value) -> Option<Json> {
    Some(match value {
        Value::Int(i) => Json::from(*i),
        Value::Str(s) => Json::String(s.clone()),
        Value::Bool(b) => Json::Bool(*b),
        Value::Enum(o) => Json::String(types.enums.display(domain, *o).to_string()),
        Value::Record(r) => to_external(types, r),
        Value::List(_) | Value::Map(_) => return None,
    })
}

/// Records of undeclared types: raw keys, enums as ordinals.
fn untyped(record: &Record) -> Json {
    let mut out = Map::new();
    for (key, value) in record.fields() {
        out.insert(case::to_lower_camel(key), untyped_value(value));
    }
    Json::Object(out)
}

fn untyped_value(value: &Value) -> Json {
    match value {
        Value::Int(i) => Json::from(*i),
        Value::Str(s) => Json::String(s.clone()),
        Value::Bool(b) => Json::Bool(*b),
        Value::Enum(o) => Json::from(*o),
        Value::Record(r) => untyped(r),
        Value::List(xs) => Json::Array(xs.iter().map(untyped_value).collect()),
        Value::Map(m) => Json::Object(m.iter().map(|(id, r)| (id.to_string(), untyped(r))).collect()),
    }
}

fn is_discriminant(types: &CompiledTypes, ty: &ObjectType, field: &FieldSpec) -> bool {
    ty.is_polymorphic() && field.name == types.discriminant
}

// ————————————————————————————————————————————————————————————————————————————
// READ BACK
// ————————————————————————————————————————————————————————————————————————————

/// Inverse of [`to_external`], up to sentinels: omitted ints, `false`,
/// `""` and empty sequences all read back as absent.
pub fn from_external(types: &CompiledTypes, type_name: &str, json: &Json) -> Result<Record, ExternalError> {
    let ty = types.get(type_name).ok_or_else(|| ExternalError::UnknownType(type_name.to_string()))?;
    let obj = json
        .as_object()
        .ok_or_else(|| ExternalError::NotAnObject { type_name: type_name.to_string() })?;

    let mut record = Record::new(&ty.name);
    for field in ty.fields.values() {
        if field.is_elided() || is_discriminant(types, ty, field) {
            continue;
        }
        let Some(v) = obj.get(&field.external_name()) else { continue };
        if let Some(value) = field_from_external(types, ty, field, v)? {
            record.set(&field.key, value);
        }
    }

    if let Some(payload) = obj.get(PAYLOAD_KEY) {
        record.set_payload(payload_from_external(types, ty, payload)?);
    }
    Ok(record)
}

fn payload_from_external(types: &CompiledTypes, ty: &ObjectType, json: &Json) -> Result<Payload, ExternalError> {
    let display = json
        .get(VARIANT_KEY)
        .and_then(Json::as_str)
        .ok_or_else(|| bad(ty, PAYLOAD_KEY, "an object with a `type` string"))?;
    let (variant, name) = ty.variant(display).ok_or_else(|| ExternalError::UnknownVariant {
        type_name: ty.name.clone(),
        variant: display.to_string(),
    })?;
    let record = from_external(types, &ty.subtype_name(name), json)?;
    Ok(Payload { variant, name: name.to_string(), record })
}

fn field_from_external(
    types: &CompiledTypes,
    ty: &ObjectType,
    field: &FieldSpec,
    json: &Json,
) -> Result<Option<Value>, ExternalError> {
    if field.multiple || field.kind == FieldKind::Array {
        let items = json.as_array().ok_or_else(|| bad(ty, &field.name, "an array"))?;
        let values = items
            .iter()
            .map(|item| item_from_external(types, ty, field, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok((!values.is_empty()).then_some(Value::List(values)));
    }

    match field.kind {
        FieldKind::Bool => {
            let b = json.as_bool().ok_or_else(|| bad(ty, &field.name, "a bool"))?;
            Ok(b.then_some(Value::Bool(true)))
        }
        FieldKind::String => {
            let s = json.as_str().ok_or_else(|| bad(ty, &field.name, "a string"))?;
            Ok((!s.is_empty()).then(|| Value::Str(s.to_string())))
        }
        FieldKind::Map => {
            let entries = json.as_object().ok_or_else(|| bad(ty, &field.name, "an object keyed by id"))?;
            let element = element_of(ty, field)?;
            let mut records = BTreeMap::new();
            for (key, v) in entries {
                let id: i64 = key.parse().map_err(|_| bad(ty, &field.name, "integer keys"))?;
                records.insert(id, from_external(types, element, v)?);
            }
            Ok(Some(Value::Map(records)))
        }
        _ => item_from_external(types, ty, field, json).map(Some),
    }
}

/// One scalar or nested object.
fn item_from_external(
    types: &CompiledTypes,
    ty: &ObjectType,
    field: &FieldSpec,
    json: &Json,
) -> Result<Value, ExternalError> {
    match field.kind {
        FieldKind::Int => json.as_i64().map(Value::Int).ok_or_else(|| bad(ty, &field.name, "an integer")),
        FieldKind::String => json
            .as_str()
            .map(|s| Value::Str(s.to_string()))
            .ok_or_else(|| bad(ty, &field.name, "a string")),
        FieldKind::Bool => json.as_bool().map(Value::Bool).ok_or_else(|| bad(ty, &field.name, "a bool")),
        FieldKind::Enum => {
            let display = json.as_str().ok_or_else(|| bad(ty, &field.name, "an enum display string"))?;
            let domain = element_of(ty, field)?;
            let ordinal = types.enums.get(domain).map(|d| d.from_display(display)).unwrap_or(0);
            Ok(Value::Enum(ordinal))
        }
        FieldKind::Object | FieldKind::Array => {
            let record = from_external(types, element_of(ty, field)?, json)?;
            Ok(Value::Record(Box::new(record)))
        }
        FieldKind::Map => Err(bad(ty, &field.name, "no maps inside sequences")),
    }
}

fn element_of<'f>(ty: &ObjectType, field: &'f FieldSpec) -> Result<&'f str, ExternalError> {
    field.elements.as_deref().ok_or_else(|| bad(ty, &field.name, "a declared element type"))
}

fn bad(ty: &ObjectType, field: &str, expected: &'static str) -> ExternalError {
    ExternalError::BadValue { type_name: ty.name.clone(), field: field.to_string(), expected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_base;
    use crate::schema::{compile, Refinement, Schema};
    use serde_json::json;

    fn types() -> CompiledTypes {
        let schema: Schema = serde_json::from_value(json!({
            "root": "World",
            "enums": { "SiteType": ["cave", "dark fortress"], "HfRole": ["hero", "villain"] },
            "same_fields": { "Site": { "civ": "civ_id" } },
            "objects": {
                "World": { "fields": {
                    "sites": { "type": "map", "elements": "Site", "legend": "both" },
                    "events": { "type": "map", "elements": "Event", "legend": "both" }
                }},
                "Site": { "id": true, "fields": {
                    "id": { "type": "int", "legend": "both" },
                    "name": { "type": "string" },
                    "type": { "type": "enum", "elements": "SiteType" },
                    "civ_id": { "type": "int" },
                    "civ": { "type": "int", "legend": "plus" },
                    "is_capital": { "type": "bool" },
                    "structures": { "type": "array", "elements": "Structure" }
                }, "additional": {
                    "ruin": { "type": "bool" },
                    "entities": { "type": "int", "multiple": true }
                }},
                "Structure": { "id": true, "fields": {
                    "local_id": { "type": "int" },
                    "name": { "type": "string" }
                }},
                "Event": { "id": true, "subtypes": ["HfAbducted"], "fields": {
                    "id": { "type": "int", "legend": "both" },
                    "year": { "type": "int" },
                    "type": { "type": "string", "legend": "both" }
                }},
                "EventHfAbducted": { "subtypeof": "Event", "fields": {
                    "target_hfid": { "type": "int" },
                    "roles": { "type": "enum", "elements": "HfRole", "multiple": true }
                }}
            }
        }))
        .unwrap();
        compile(&schema).unwrap()
    }

    const BASE: &str = "<world><sites>\
        <site><id>1</id><name>dunkeep</name><type>dark fortress</type><civ_id>4</civ_id><is_capital/>\
          <structures><structure><local_id>0</local_id><name>hall</name></structure></structures></site>\
        <site><id>2</id><type>castle</type></site>\
        </sites><events>\
        <event><id>9</id><year>100</year><type>hf abducted</type><target_hfid>7</target_hfid><roles>villain</roles></event>\
        </events></world>";

    fn parsed() -> (CompiledTypes, Record) {
        let types = types();
        let mut r = Refinement::seed(&types);
        let root = parse_base(&types, BASE.as_bytes(), &mut r).unwrap();
        (types, root)
    }

    #[test]
    fn shape_follows_field_rules() {
        let (types, root) = parsed();
        let sites = match root.get("sites") {
            Some(Value::Map(m)) => m,
            _ => panic!("no sites"),
        };

        let dunkeep = to_external(&types, &sites[&1]);
        assert_eq!(dunkeep["type"], json!("dark fortress"));
        assert_eq!(dunkeep["civId"], json!(4));
        assert_eq!(dunkeep["isCapital"], json!(true));
        assert_eq!(dunkeep["structures"][0], json!({ "id": 0, "name": "hall" }));
        assert_eq!(dunkeep["entities"], json!([]));
        assert!(dunkeep.get("civ").is_none());

        // unknown enum and unset int are omitted
        let other = to_external(&types, &sites[&2]);
        assert!(other.get("type").is_none());
        assert!(other.get("civId").is_none());
        assert_eq!(other["ruin"], json!(false));
    }

    #[test]
    fn discriminant_becomes_payload() {
        let (types, root) = parsed();
        let events = match root.get("events") {
            Some(Value::Map(m)) => m,
            _ => panic!("no events"),
        };
        let ev = to_external(&types, &events[&9]);
        assert_eq!(
            ev,
            json!({ "id": 9, "year": 100, "payload": { "type": "hf abducted", "targetHfid": 7, "roles": ["villain"] } })
        );
    }

    #[test]
    fn reads_back_what_it_writes() {
        let (types, root) = parsed();
        let json = to_external(&types, &root);
        let back = from_external(&types, "World", &json).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn rejects_bad_shapes() {
        let types = types();
        assert!(matches!(from_external(&types, "Nope", &json!({})), Err(ExternalError::UnknownType(_))));
        assert!(matches!(
            from_external(&types, "Site", &json!({ "civId": "four" })),
            Err(ExternalError::BadValue { .. })
        ));
        assert!(matches!(
            from_external(&types, "Event", &json!({ "payload": { "type": "volcano" } })),
            Err(ExternalError::UnknownVariant { .. })
        ));
    }
}
