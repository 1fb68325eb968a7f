//! Field reconciliation between the base and plus exports.
//!
//! Both exports describe the same records, and the plus export repeats some
//! base fields under other names. The static table names those pairs; mapped
//! plus fields are elided from the record shape. Each parse run additionally
//! threads a [`Refinement`] through, which watches every candidate pair and
//! records the ones whose values disagree, so the table can be revised for the
//! next schema version. Refinement never touches the records themselves.
use std::collections::BTreeMap;
use indexmap::IndexMap;

use super::{CompiledTypes, FieldKind, ObjectType, Source};
use crate::record::{Record, Value};

/// Never candidates: identity and discriminant tags.
const NEVER_RECONCILED: [&str; 3] = ["id", "name", "type"];

/// Static (type, plus field) → base field mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationTable {
    pairs: BTreeMap<(String, String), String>,
}

impl ReconciliationTable {
    pub fn from_decl(decl: &IndexMap<String, IndexMap<String, String>>) -> Self {
        let mut table = Self::default();
        for (object, fields) in decl {
            for (plus, base) in fields {
                table.insert(object, plus, base);
            }
        }
        table
    }

    pub fn insert(&mut self, object: &str, plus: &str, base: &str) {
        self.pairs.insert((object.to_string(), plus.to_string()), base.to_string());
    }

    pub fn base_for(&self, object: &str, plus: &str) -> Option<&str> {
        self.pairs
            .get(&(object.to_string(), plus.to_string()))
            .map(String::as_str)
    }

    /// `(object, plus, base)` in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.pairs.iter().map(|((o, p), b)| (o.as_str(), p.as_str(), b.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Same layout as the schema's `same_fields` section.
    pub fn to_decl(&self) -> IndexMap<String, IndexMap<String, String>> {
        let mut out: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
        for (object, plus, base) in self.iter() {
            out.entry(object.to_string())
                .or_default()
                .insert(plus.to_string(), base.to_string());
        }
        out
    }
}

/// A plus value that was read but not stored, because its field is elided.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub field: String,
    pub value: Value,
}

/// Per-run observations: is each candidate (plus, base) pair still a duplicate?
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Refinement {
    /// object type → (plus field, base field) → still duplicate
    pairs: BTreeMap<String, BTreeMap<(String, String), bool>>,
    /// records checked
    checked: u64,
}

impl Refinement {
    /// Every candidate pair starts out as a presumed duplicate.
    pub fn seed(types: &CompiledTypes) -> Self {
        let mut pairs: BTreeMap<String, BTreeMap<(String, String), bool>> = BTreeMap::new();
        for ty in types.types.values() {
            let candidates = |source: Source| {
                ty.fields.values().filter(move |f| {
                    f.source == source
                        && !f.multiple
                        && matches!(f.kind, FieldKind::Int | FieldKind::String)
                        && !NEVER_RECONCILED.contains(&f.name.as_str())
                })
            };
            for plus in candidates(Source::Plus) {
                for base in candidates(Source::Base).filter(|b| b.kind == plus.kind) {
                    pairs
                        .entry(ty.name.clone())
                        .or_default()
                        .insert((plus.name.clone(), base.key.clone()), true);
                }
            }
        }
        // static pairs are always tracked, even onto `both` fields
        for (object, plus, base) in types.reconciliation.iter() {
            pairs
                .entry(object.to_string())
                .or_default()
                .entry((plus.to_string(), base.to_string()))
                .or_insert(true);
        }
        Self { pairs, checked: 0 }
    }

    /// Compare a record's plus values with its base values once the plus pass
    /// has finished with it.
    pub fn observe(&mut self, ty: &ObjectType, record: &Record, captured: &[Captured]) {
        let Some(pairs) = self.pairs.get_mut(&ty.name) else { return };
        self.checked += 1;
        for ((plus, base), still_same) in pairs.iter_mut() {
            if !*still_same {
                continue;
            }
            let plus_value = captured
                .iter()
                .rev()
                .find(|c| &c.field == plus)
                .map(|c| &c.value)
                .or_else(|| record.get(plus));
            // absent from this record's plus element: nothing observed
            let Some(plus_value) = plus_value else { continue };
            if disagree(plus_value, record.get(base)) {
                tracing::trace!(object = %ty.name, %plus, %base, "reconciliation pair disagrees");
                *still_same = false;
            }
        }
    }

    pub fn is_duplicate(&self, object: &str, plus: &str, base: &str) -> Option<bool> {
        self.pairs
            .get(object)?
            .get(&(plus.to_string(), base.to_string()))
            .copied()
    }

    pub fn records_checked(&self) -> u64 {
        self.checked
    }

    /// Combine the observations of independent runs.
    pub fn merge(mut self, other: Refinement) -> Refinement {
        for (object, pairs) in other.pairs {
            let mine = self.pairs.entry(object).or_default();
            for (pair, same) in pairs {
                let slot = mine.entry(pair).or_insert(true);
                *slot = *slot && same;
            }
        }
        self.checked += other.checked;
        self
    }

    /// `(object, plus, base, still duplicate)` in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, bool)> {
        self.pairs.iter().flat_map(|(o, pairs)| {
            pairs.iter().map(move |((p, b), s)| (o.as_str(), p.as_str(), b.as_str(), *s))
        })
    }

    /// Table for the next schema revision: for each plus field, the first
    /// base field (by name) it never disagreed with.
    pub fn proposed_table(&self) -> ReconciliationTable {
        let mut table = ReconciliationTable::default();
        for (object, plus, base, same) in self.iter() {
            if same && table.base_for(object, plus).is_none() {
                table.insert(object, plus, base);
            }
        }
        table
    }
}

fn disagree(plus: &Value, base: Option<&Value>) -> bool {
    match (plus, base) {
        (Value::Int(a), Some(Value::Int(b))) => a != b,
        (Value::Int(a), None) => *a != crate::record::UNSET,
        (Value::Str(a), Some(Value::Str(b))) => a != b && !a.is_empty() && !b.is_empty(),
        (Value::Str(_), None) => false,
        (a, Some(b)) => a != b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{compile, Schema};
    use serde_json::json;

    fn types() -> CompiledTypes {
        let schema: Schema = serde_json::from_value(json!({
            "root": "Site",
            "same_fields": { "Site": { "civ": "civ_id" } },
            "objects": {
                "Site": { "id": true, "fields": {
                    "id": { "type": "int", "legend": "both" },
                    "civ_id": { "type": "int" },
                    "owner_id": { "type": "int" },
                    "name": { "type": "string" },
                    "label": { "type": "string" },
                    "civ": { "type": "int", "legend": "plus" },
                    "cur_owner_id": { "type": "int", "legend": "plus" },
                    "title": { "type": "string", "legend": "plus" }
                }}
            }
        }))
        .unwrap();
        compile(&schema).unwrap()
    }

    #[test]
    fn seeds_candidates_of_matching_kind() {
        let r = Refinement::seed(&types());
        assert_eq!(r.is_duplicate("Site", "civ", "civ_id"), Some(true));
        assert_eq!(r.is_duplicate("Site", "cur_owner_id", "owner_id"), Some(true));
        assert_eq!(r.is_duplicate("Site", "title", "label"), Some(true));
        assert_eq!(r.is_duplicate("Site", "title", "civ_id"), None);
        assert_eq!(r.is_duplicate("Site", "title", "name"), None);
    }

    #[test]
    fn mismatch_flips_pair_without_touching_record() {
        let types = types();
        let site = types.get("Site").unwrap();
        let mut r = Refinement::seed(&types);

        let mut rec = Record::new("Site");
        rec.set("civ_id", Value::Int(5));
        let before = rec.clone();
        r.observe(site, &rec, &[Captured { field: "civ".into(), value: Value::Int(6) }]);

        assert_eq!(r.is_duplicate("Site", "civ", "civ_id"), Some(false));
        assert_eq!(rec, before);
    }

    #[test]
    fn empty_strings_never_disagree() {
        let types = types();
        let site = types.get("Site").unwrap();
        let mut r = Refinement::seed(&types);
        let mut rec = Record::new("Site");
        rec.set("label", Value::Str(String::new()));
        rec.set("title", Value::Str("The Keep".into()));
        r.observe(site, &rec, &[]);
        assert_eq!(r.is_duplicate("Site", "title", "label"), Some(true));
    }

    #[test]
    fn merge_and_propose() {
        let types = types();
        let site = types.get("Site").unwrap();
        let mut a = Refinement::seed(&types);
        let b = Refinement::seed(&types);

        let mut rec = Record::new("Site");
        rec.set("owner_id", Value::Int(1));
        rec.set("civ_id", Value::Int(3));
        rec.set("cur_owner_id", Value::Int(2));
        a.observe(site, &rec, &[]);

        let merged = a.merge(b);
        assert_eq!(merged.is_duplicate("Site", "cur_owner_id", "owner_id"), Some(false));
        let table = merged.proposed_table();
        assert_eq!(table.base_for("Site", "civ"), Some("civ_id"));
        assert_eq!(table.base_for("Site", "cur_owner_id"), None);
        assert_eq!(merged.records_checked(), 1);
    }
}
