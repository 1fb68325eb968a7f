//! Relation inference: "does this record reference entity / figure / site …?"
//!
//! Nothing in the export says which integer fields are foreign keys. The
//! answer is derived per type from an explicit `related` tag on the field, or
//! from a per-kind field-name pattern. Patterns are schema metadata: the
//! defaults below apply unless the schema overrides them.
use std::collections::BTreeMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{FieldKind, FieldSpec, SchemaError};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationKind {
    Entity,
    HistoricalFigure,
    Artifact,
    Site,
    Structure,
    Region,
    WorldConstruction,
    WrittenContent,
    DanceForm,
    MusicalForm,
    PoeticForm,
}

impl RelationKind {
    pub const ALL: [RelationKind; 11] = [
        Self::Entity,
        Self::HistoricalFigure,
        Self::Artifact,
        Self::Site,
        Self::Structure,
        Self::Region,
        Self::WorldConstruction,
        Self::WrittenContent,
        Self::DanceForm,
        Self::MusicalForm,
        Self::PoeticForm,
    ];

    /// Name used for `related` tags and pattern overrides in the schema.
    pub fn key(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::HistoricalFigure => "hf",
            Self::Artifact => "artifact",
            Self::Site => "site",
            Self::Structure => "structure",
            Self::Region => "region",
            Self::WorldConstruction => "worldConstruction",
            Self::WrittenContent => "writtenContent",
            Self::DanceForm => "danceForm",
            Self::MusicalForm => "musicalForm",
            Self::PoeticForm => "poeticForm",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }

    /// Built-in field-name pattern. Art forms are only ever tagged explicitly.
    fn default_pattern(self) -> Option<&'static str> {
        match self {
            Self::Entity => Some(r"(civ|civ_id|enid|[^d]*entity(_id)?|^entity(_id)?|^source|^destination|^involved)(_?[0-9])?$"),
            Self::HistoricalFigure => Some(r"(hfid|hf_id|hist_figure_id|histfig_id|histfig|bodies|_hf)"),
            Self::Artifact => Some(r"(item(_id)?|artifact_id)$"),
            Self::Site => Some(r"(site_id|site)[0-9]?$"),
            Self::Structure => Some(r"(structure(_id)?)$"),
            Self::Region => Some(r"(region_id|srid)$"),
            Self::WorldConstruction => Some(r"(wcid)$"),
            Self::WrittenContent => Some(r"^wc_id$"),
            Self::DanceForm | Self::MusicalForm | Self::PoeticForm => None,
        }
    }
}

static DEFAULT_PATTERNS: Lazy<BTreeMap<RelationKind, Result<Regex, regex::Error>>> = Lazy::new(|| {
    RelationKind::ALL
        .into_iter()
        .filter_map(|k| k.default_pattern().map(|p| (k, Regex::new(p))))
        .collect()
});

/// Field-name patterns in effect for one schema.
#[derive(Debug, Clone)]
pub struct RelationPatterns {
    patterns: BTreeMap<RelationKind, Regex>,
}

impl RelationPatterns {
    pub fn new(overrides: &BTreeMap<String, String>) -> Result<Self, SchemaError> {
        let mut patterns = BTreeMap::new();
        for (kind, rx) in DEFAULT_PATTERNS.iter() {
            let rx = rx.clone().map_err(|source| SchemaError::BadPattern { kind: kind.key().to_string(), source })?;
            patterns.insert(*kind, rx);
        }
        for (key, src) in overrides {
            let kind = RelationKind::from_key(key).ok_or_else(|| SchemaError::UnknownRelation(key.clone()))?;
            let rx = Regex::new(src).map_err(|source| SchemaError::BadPattern { kind: key.clone(), source })?;
            patterns.insert(kind, rx);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, kind: RelationKind, field_name: &str) -> bool {
        self.patterns.get(&kind).is_some_and(|rx| rx.is_match(field_name))
    }
}

// ------------------------------ Predicates ------------------------------- //

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// single int field `== id`
    Equals(String),
    /// sequence int field contains `id`
    Contains(String),
}

impl Term {
    fn field(&self) -> &str {
        match self {
            Term::Equals(f) | Term::Contains(f) => f,
        }
    }

    fn test(&self, record: &Record, id: i64) -> bool {
        match self {
            Term::Equals(f) => record.get_int(f) == id,
            Term::Contains(f) => record.ints(f).any(|x| x == id),
        }
    }
}

/// OR over terms, sorted by field name. No terms: never related.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    terms: Vec<Term>,
}

impl Predicate {
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn is_never(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn test(&self, record: &Record, id: i64) -> bool {
        // -1 is the unset sentinel, never a reference
        id >= 0 && self.terms.iter().any(|t| t.test(record, id))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "false");
        }
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| match t {
                Term::Equals(n) => format!("{n} == id"),
                Term::Contains(n) => format!("id in {n}"),
            })
            .collect();
        write!(f, "{}", parts.join(" || "))
    }
}

/// Per-type predicates for every relation kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relations {
    by_kind: BTreeMap<RelationKind, Predicate>,
}

impl Relations {
    pub fn infer(fields: &IndexMap<String, FieldSpec>, patterns: &RelationPatterns) -> Self {
        let mut by_kind = BTreeMap::new();
        for kind in RelationKind::ALL {
            let mut terms: Vec<Term> = fields
                .values()
                .filter(|f| f.kind == FieldKind::Int && !f.is_elided())
                .filter(|f| f.related == Some(kind) || patterns.matches(kind, &f.name))
                .map(|f| if f.multiple { Term::Contains(f.key.clone()) } else { Term::Equals(f.key.clone()) })
                .collect();
            terms.sort_by(|a, b| a.field().cmp(b.field()));
            by_kind.insert(kind, Predicate { terms });
        }
        Self { by_kind }
    }

    pub fn predicate(&self, kind: RelationKind) -> Option<&Predicate> {
        self.by_kind.get(&kind)
    }

    pub fn related(&self, kind: RelationKind, record: &Record, id: i64) -> bool {
        self.predicate(kind).is_some_and(|p| p.test(record, id))
    }

    /// Structure ids are local to their site: the site has to match as well.
    pub fn related_to_structure(&self, record: &Record, site_id: i64, structure_id: i64) -> bool {
        self.related(RelationKind::Site, record, site_id)
            && self.related(RelationKind::Structure, record, structure_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelationKind, &Predicate)> {
        self.by_kind.iter().map(|(k, p)| (*k, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::schema::{compile, Schema};
    use serde_json::json;

    fn event_types() -> crate::schema::CompiledTypes {
        let schema: Schema = serde_json::from_value(json!({
            "root": "Event",
            "objects": {
                "Event": { "id": true, "fields": {
                    "id": { "type": "int" },
                    "site_id": { "type": "int" },
                    "civ_id": { "type": "int" },
                    "site_civ_id": { "type": "int" },
                    "group_hfid": { "type": "int", "multiple": true },
                    "structure_id": { "type": "int" },
                    "dance_form": { "type": "int", "related": "danceForm" },
                    "name": { "type": "string" }
                }}
            }
        }))
        .unwrap();
        compile(&schema).unwrap()
    }

    #[test]
    fn built_in_patterns_compile() {
        for kind in RelationKind::ALL {
            match DEFAULT_PATTERNS.get(&kind) {
                Some(rx) => assert!(rx.is_ok(), "{kind:?}: {rx:?}"),
                None => assert!(kind.default_pattern().is_none()),
            }
        }
        let patterns = RelationPatterns::new(&BTreeMap::new()).unwrap();
        assert!(patterns.matches(RelationKind::Entity, "attacker_civ_id"));
        assert!(!patterns.matches(RelationKind::DanceForm, "dance_form"));
    }

    #[test]
    fn bad_override_is_reported_with_its_kind() {
        let overrides = BTreeMap::from([("site".to_string(), "(unclosed".to_string())]);
        let err = RelationPatterns::new(&overrides).unwrap_err();
        assert!(matches!(err, SchemaError::BadPattern { ref kind, .. } if kind == "site"));
    }

    #[test]
    fn name_patterns_and_tags_select_fields() {
        let types = event_types();
        let rel = &types.get("Event").unwrap().relations;
        let entity = rel.predicate(RelationKind::Entity).unwrap().to_string();
        assert_eq!(entity, "civ_id == id || site_civ_id == id");
        assert_eq!(rel.predicate(RelationKind::HistoricalFigure).unwrap().to_string(), "id in group_hfid");
        assert_eq!(rel.predicate(RelationKind::DanceForm).unwrap().to_string(), "dance_form == id");
        assert!(rel.predicate(RelationKind::MusicalForm).unwrap().is_never());
    }

    #[test]
    fn predicates_test_records() {
        let types = event_types();
        let mut r = Record::new("Event");
        r.set("civ_id", Value::Int(5));
        r.set("site_id", Value::Int(12));
        r.set("structure_id", Value::Int(2));
        r.set("group_hfid", Value::List(vec![Value::Int(7), Value::Int(9)]));

        assert!(types.related(RelationKind::Entity, &r, 5));
        assert!(!types.related(RelationKind::Entity, &r, 6));
        assert!(types.related(RelationKind::HistoricalFigure, &r, 9));
        assert!(!types.related(RelationKind::Entity, &r, -1));

        let rel = &types.get("Event").unwrap().relations;
        assert!(rel.related_to_structure(&r, 12, 2));
        assert!(!rel.related_to_structure(&r, 13, 2));
    }

    #[test]
    fn inference_is_deterministic() {
        let a = event_types();
        let b = event_types();
        assert_eq!(a.get("Event").unwrap().relations, b.get("Event").unwrap().relations);
    }

    #[test]
    fn schema_overrides_patterns() {
        let mut overrides = BTreeMap::new();
        overrides.insert("danceForm".to_string(), "^dance".to_string());
        let patterns = RelationPatterns::new(&overrides).unwrap();
        assert!(patterns.matches(RelationKind::DanceForm, "dance_form_id"));
        assert!(patterns.matches(RelationKind::Site, "site_id"));

        overrides.insert("nope".to_string(), "x".to_string());
        assert!(RelationPatterns::new(&overrides).is_err());
    }
}
