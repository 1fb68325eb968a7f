//! Runtime records: the parsed, schema-shaped values.
//!
//! A record is an ordered map from field key to [`Value`], plus at most one
//! [`Payload`] when its type is polymorphic. Cross-type references stay plain
//! integer ids; the linker resolves them against the corpus.
use std::collections::BTreeMap;
use indexmap::IndexMap;

/// Unset sentinel for single int fields and foreign ids.
pub const UNSET: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    /// Ordinal in the field's enum domain; 0 is unknown.
    Enum(u32),
    Record(Box<Record>),
    /// Sequence fields (`multiple`) and arrays of objects.
    List(Vec<Value>),
    /// Id-keyed maps of objects.
    Map(BTreeMap<i64, Record>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }
}

/// The subtype selected by a polymorphic record's discriminant.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Index into the parent type's declared subtype list.
    pub variant: usize,
    /// Variant name (CamelCase), e.g. `HfAbducted`.
    pub name: String,
    pub record: Record,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    type_name: String,
    fields: IndexMap<String, Value>,
    payload: Option<Box<Payload>>,
}

impl Record {
    pub fn new(type_name: &str) -> Self {
        Self { type_name: type_name.to_string(), fields: IndexMap::new(), payload: None }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> i64 {
        self.get_int("id")
    }

    pub fn name(&self) -> &str {
        self.get_str("name")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `-1` when absent.
    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(UNSET)
    }

    /// `""` when absent.
    pub fn get_str(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// `false` when absent.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    /// Ordinal 0 (unknown) when absent.
    pub fn get_enum(&self, key: &str) -> u32 {
        match self.get(key) {
            Some(Value::Enum(o)) => *o,
            _ => 0,
        }
    }

    /// Ints of a sequence field (a single int yields itself).
    pub fn ints<'r>(&'r self, key: &str) -> impl Iterator<Item = i64> + use<'r> {
        let (single, list): (Option<i64>, &[Value]) = match self.get(key) {
            Some(Value::Int(i)) => (Some(*i), &[][..]),
            Some(Value::List(xs)) => (None, xs.as_slice()),
            _ => (None, &[][..]),
        };
        single.into_iter().chain(list.iter().filter_map(Value::as_int))
    }

    /// Sequence slot for `key`, created empty if needed.
    pub fn list_mut(&mut self, key: &str) -> &mut Vec<Value> {
        let slot = self
            .fields
            .entry(key.to_string())
            .or_insert_with(|| Value::List(Vec::new()));
        if !matches!(slot, Value::List(_)) {
            *slot = Value::List(Vec::new());
        }
        match slot {
            Value::List(xs) => xs,
            _ => unreachable!("slot was just made a list"),
        }
    }

    /// Map slot for `key`, created empty if needed.
    pub fn map_mut(&mut self, key: &str) -> &mut BTreeMap<i64, Record> {
        let slot = self
            .fields
            .entry(key.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::Map(BTreeMap::new());
        }
        match slot {
            Value::Map(m) => m,
            _ => unreachable!("slot was just made a map"),
        }
    }

    /// Remove and return a map field, leaving nothing behind.
    pub fn take_map(&mut self, key: &str) -> Option<BTreeMap<i64, Record>> {
        match self.fields.shift_remove(key) {
            Some(Value::Map(m)) => Some(m),
            Some(other) => {
                self.fields.insert(key.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Append `id` to a sequence field unless present. Returns whether it was added.
    pub fn add_unique_int(&mut self, key: &str, id: i64) -> bool {
        let list = self.list_mut(key);
        if list.iter().any(|v| v.as_int() == Some(id)) {
            return false;
        }
        list.push(Value::Int(id));
        true
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_deref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_deref_mut()
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(Box::new(payload));
    }

    /// Variant name of the payload, if any.
    pub fn variant(&self) -> Option<&str> {
        self.payload().map(|p| p.name.as_str())
    }
}

/// Write `value` at `index`, appending when the sequence is shorter.
pub fn write_at(list: &mut Vec<Value>, index: usize, value: Value) {
    if index < list.len() {
        list[index] = value;
    } else {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_read_as_sentinels() {
        let r = Record::new("Site");
        assert_eq!(r.id(), UNSET);
        assert_eq!(r.name(), "");
        assert!(!r.get_bool("ruin"));
        assert_eq!(r.get_enum("type"), 0);
        assert_eq!(r.ints("entities").count(), 0);
    }

    #[test]
    fn unique_ints_and_lists() {
        let mut r = Record::new("Entity");
        assert!(r.add_unique_int("sites", 12));
        assert!(!r.add_unique_int("sites", 12));
        assert!(r.add_unique_int("sites", 3));
        assert_eq!(r.ints("sites").collect::<Vec<_>>(), vec![12, 3]);
    }

    #[test]
    fn positional_writes_replace_then_append() {
        let mut xs = vec![Value::Int(1)];
        write_at(&mut xs, 0, Value::Int(2));
        write_at(&mut xs, 1, Value::Int(3));
        assert_eq!(xs, vec![Value::Int(2), Value::Int(3)]);
    }
}
