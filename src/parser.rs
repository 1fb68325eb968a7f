//! Schema-driven parser over the export's token stream.
//!
//! One [`Parser`] is built per pass. Each element is read by a small state
//! machine: in `Start` it dispatches on the child's start tag, `Reading`
//! accumulates char data for a scalar (or recurses for nested objects), and
//! the element's own end tag is `End`. The compiled schema decides everything:
//! which tags are fields, what kind they are, and whether the current pass
//! reads them at all.
//!
//! Design goals:
//! - Forward only. The only buffering is a plus map child's tags that come
//!   before its `<id>`, replayed once the base record is found.
//! - Tolerant of data: bad ints, unknown tags and unknown discriminants never
//!   fail a load. Broken streams always do.
//! - The plus pass merges into what the base pass built, and running it twice
//!   changes nothing.
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use thiserror::Error;

use crate::record::{write_at, Payload, Record, Value, UNSET};
use crate::schema::{Captured, CompiledTypes, FieldKind, FieldSpec, ObjectType, Pass, Refinement};
use crate::tokens::{Token, Tokens};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML near byte {position}: {source}")]
    Xml { position: u64, #[source] source: quick_xml::Error },
    #[error("unexpected end of input inside {inside}")]
    UnexpectedEof { inside: String },
    #[error("end tag </{0}> before any root element")]
    StrayEndTag(String),
    #[error("document has no root element")]
    MissingRoot,
}

pub struct Parser<'a> {
    types: &'a CompiledTypes,
    pass: Pass,
    refinement: &'a mut Refinement,
}

impl<'a> Parser<'a> {
    pub fn new(types: &'a CompiledTypes, pass: Pass, refinement: &'a mut Refinement) -> Self {
        Self { types, pass, refinement }
    }

    /// Parse the document element as the schema's root type. The plus pass
    /// passes in the base pass's root to merge into.
    pub fn parse_document<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        root: Option<Record>,
    ) -> Result<Record, ParseError> {
        loop {
            match tokens.next()? {
                Token::Start(_) => break,
                Token::Text(_) => continue,
                Token::End(tag) => return Err(ParseError::StrayEndTag(tag)),
                Token::Eof => return Err(ParseError::MissingRoot),
            }
        }
        let types = self.types;
        let ty = types.root_type();
        let mut record = root.unwrap_or_else(|| Record::new(&ty.name));
        self.visit(tokens, ty, &mut record)?;
        Ok(record)
    }

    /// Parse one element into `record`, then let the refinement look at it.
    fn visit<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        ty: &ObjectType,
        record: &mut Record,
    ) -> Result<(), ParseError> {
        let captured = self.parse_into(tokens, ty, record)?;
        if self.pass == Pass::Augment {
            self.refinement.observe(ty, record, &captured);
        }
        Ok(())
    }

    /// Children of the current element, up to and including its end tag.
    /// Returns the values of elided fields, which are never stored.
    fn parse_into<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        ty: &ObjectType,
        record: &mut Record,
    ) -> Result<Vec<Captured>, ParseError> {
        let mut captured = Vec::new();
        // positional cursors for sequence fields, per visit
        let mut cursors: HashMap<String, usize> = HashMap::new();
        loop {
            match tokens.next()? {
                Token::Start(tag) => {
                    if ty.is_polymorphic() && tag == self.types.discriminant {
                        let raw = tokens.text()?;
                        self.enter_payload(tokens, ty, record, raw.trim())?;
                        return Ok(captured);
                    }
                    let Some(field) = ty.field(&tag).filter(|f| f.source.active(self.pass)) else {
                        tracing::trace!(object = %ty.name, %tag, "skipping element");
                        tokens.skip()?;
                        continue;
                    };
                    self.read_field(tokens, field, record, &mut cursors, &mut captured)?;
                }
                Token::Text(_) => {}
                Token::End(_) => return Ok(captured),
                Token::Eof => return Err(ParseError::UnexpectedEof { inside: ty.name.clone() }),
            }
        }
    }

    fn read_field<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        field: &FieldSpec,
        record: &mut Record,
        cursors: &mut HashMap<String, usize>,
        captured: &mut Vec<Captured>,
    ) -> Result<(), ParseError> {
        let value = match field.kind {
            FieldKind::Int => Value::Int(parse_int(&tokens.text()?)),
            FieldKind::String => Value::Str(tokens.text()?),
            FieldKind::Bool => {
                tokens.skip()?;
                Value::Bool(true)
            }
            FieldKind::Enum => {
                let raw = tokens.text()?;
                let domain = field.elements.as_deref().unwrap_or_default();
                let ordinal = self.types.enums.decode(domain, raw.trim());
                if ordinal == 0 && !field.multiple {
                    // unknown reads the same as absent
                    tracing::trace!(%domain, raw = raw.trim(), "unknown enum value");
                    return Ok(());
                }
                Value::Enum(ordinal)
            }
            FieldKind::Object => return self.read_object(tokens, field, record, cursors),
            FieldKind::Array => return self.read_array(tokens, field, record),
            FieldKind::Map => return self.read_map(tokens, field, record),
        };

        if field.is_elided() {
            captured.push(Captured { field: field.name.clone(), value });
        } else if field.multiple {
            let index = next_position(cursors, &field.key);
            write_at(record.list_mut(&field.key), index, value);
        } else {
            record.set(&field.key, value);
        }
        Ok(())
    }

    fn read_object<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        field: &FieldSpec,
        record: &mut Record,
        cursors: &mut HashMap<String, usize>,
    ) -> Result<(), ParseError> {
        let Some(elem) = self.element_type(field) else { return tokens.skip() };
        let augment = self.pass == Pass::Augment;

        if field.multiple {
            let index = next_position(cursors, &field.key);
            if augment {
                if let Some(Value::Record(existing)) = record.list_mut(&field.key).get_mut(index) {
                    return self.visit(tokens, elem, existing);
                }
            }
            let mut child = Record::new(&elem.name);
            self.visit(tokens, elem, &mut child)?;
            write_at(record.list_mut(&field.key), index, Value::Record(Box::new(child)));
            return Ok(());
        }

        if augment {
            if let Some(Value::Record(existing)) = record.get_mut(&field.key) {
                return self.visit(tokens, elem, existing);
            }
        }
        let mut child = Record::new(&elem.name);
        self.visit(tokens, elem, &mut child)?;
        record.set(&field.key, Value::Record(Box::new(child)));
        Ok(())
    }

    /// `<wrapper><elem/>…</wrapper>`, children merged by position.
    fn read_array<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        field: &FieldSpec,
        record: &mut Record,
    ) -> Result<(), ParseError> {
        let Some(elem) = self.element_type(field) else { return tokens.skip() };
        let mut index = 0;
        loop {
            match tokens.next()? {
                Token::Start(_) => {
                    if self.pass == Pass::Augment {
                        if let Some(Value::Record(existing)) = record.list_mut(&field.key).get_mut(index) {
                            self.visit(tokens, elem, existing)?;
                            index += 1;
                            continue;
                        }
                    }
                    let mut child = Record::new(&elem.name);
                    self.visit(tokens, elem, &mut child)?;
                    write_at(record.list_mut(&field.key), index, Value::Record(Box::new(child)));
                    index += 1;
                }
                Token::Text(_) => {}
                Token::End(_) => return Ok(()),
                Token::Eof => return Err(ParseError::UnexpectedEof { inside: field.name.clone() }),
            }
        }
    }

    /// `<wrapper><elem><id>…</id>…</elem>…</wrapper>`, children keyed by id.
    fn read_map<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        field: &FieldSpec,
        record: &mut Record,
    ) -> Result<(), ParseError> {
        let Some(elem) = self.element_type(field) else { return tokens.skip() };
        let mut count = 0usize;
        loop {
            match tokens.next()? {
                Token::Start(_) => {
                    let map = record.map_mut(&field.key);
                    match self.pass {
                        Pass::Base => self.insert_map_child(tokens, elem, map)?,
                        Pass::Augment => self.merge_map_child(tokens, elem, map)?,
                    }
                    count += 1;
                }
                Token::Text(_) => {}
                Token::End(_) => {
                    tracing::debug!(field = %field.name, count, pass = ?self.pass, "read map");
                    return Ok(());
                }
                Token::Eof => return Err(ParseError::UnexpectedEof { inside: field.name.clone() }),
            }
        }
    }

    fn insert_map_child<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        elem: &ObjectType,
        map: &mut BTreeMap<i64, Record>,
    ) -> Result<(), ParseError> {
        let mut child = Record::new(&elem.name);
        self.visit(tokens, elem, &mut child)?;
        let id = child.id();
        if map.insert(id, child).is_some() {
            tracing::debug!(object = %elem.name, id, "duplicate id, last write wins");
        }
        Ok(())
    }

    /// Find the base record by the child's id and merge into it in place.
    /// Tags ahead of the id are held back and replayed into that record.
    fn merge_map_child<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        elem: &ObjectType,
        map: &mut BTreeMap<i64, Record>,
    ) -> Result<(), ParseError> {
        let (id, held) = read_leading_id(tokens, elem)?;
        if !held.is_empty() {
            tracing::trace!(object = %elem.name, id, held = held.len(), "id was not the first tag");
            tokens.unread(held);
        }
        let existing = map.entry(id).or_insert_with(|| {
            tracing::debug!(object = %elem.name, id, "plus record without base record");
            let mut fresh = Record::new(&elem.name);
            if id != UNSET {
                fresh.set("id", Value::Int(id));
            }
            fresh
        });
        self.visit(tokens, elem, existing)
    }

    /// The discriminant was just read: everything after it belongs to the
    /// selected subtype.
    fn enter_payload<R: BufRead>(
        &mut self,
        tokens: &mut Tokens<R>,
        ty: &ObjectType,
        record: &mut Record,
        raw: &str,
    ) -> Result<(), ParseError> {
        let Some((variant, name)) = ty.variant(raw) else {
            tracing::debug!(object = %ty.name, id = record.id(), discriminant = raw, "unknown subtype, skipping");
            return tokens.skip();
        };
        let types = self.types;
        let Some(sub) = types.get(&ty.subtype_name(name)) else { return tokens.skip() };

        let id = record.id();
        match record.payload_mut() {
            Some(existing) if existing.variant == variant => self.visit(tokens, sub, &mut existing.record),
            Some(existing) => {
                tracing::debug!(
                    object = %ty.name,
                    id,
                    have = %existing.name,
                    got = name,
                    "subtype differs from base pass, skipping"
                );
                tokens.skip()
            }
            None => {
                let mut payload = Record::new(&sub.name);
                self.visit(tokens, sub, &mut payload)?;
                record.set_payload(Payload { variant, name: name.to_string(), record: payload });
                Ok(())
            }
        }
    }

    fn element_type(&self, field: &FieldSpec) -> Option<&'a ObjectType> {
        let types = self.types;
        field.elements.as_deref().and_then(|e| types.get(e))
    }
}

/// Read up to and including the child's id tag. Returns the id (unset when
/// the child has none) and every token taken before it.
fn read_leading_id<R: BufRead>(tokens: &mut Tokens<R>, elem: &ObjectType) -> Result<(i64, Vec<Token>), ParseError> {
    let id_tag = elem.id_tag();
    let mut held = Vec::new();
    let mut depth = 0usize;
    loop {
        let token = tokens.next()?;
        match &token {
            Token::Start(tag) if depth == 0 && tag == id_tag => {
                return Ok((parse_int(&tokens.text()?), held));
            }
            Token::Start(_) => depth += 1,
            Token::End(_) if depth == 0 => {
                held.push(token);
                return Ok((UNSET, held));
            }
            Token::End(_) => depth -= 1,
            Token::Text(_) => {}
            Token::Eof => return Err(ParseError::UnexpectedEof { inside: elem.name.clone() }),
        }
        held.push(token);
    }
}

fn next_position(cursors: &mut HashMap<String, usize>, key: &str) -> usize {
    let slot = cursors.entry(key.to_string()).or_insert(0);
    let index = *slot;
    *slot += 1;
    index
}

/// Ints that fail to parse read as 0.
fn parse_int(text: &str) -> i64 {
    match text.trim().parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            tracing::trace!(text, "not an int, using 0");
            0
        }
    }
}

/// Run the base pass over a whole document.
pub fn parse_base<R: BufRead>(
    types: &CompiledTypes,
    input: R,
    refinement: &mut Refinement,
) -> Result<Record, ParseError> {
    let mut tokens = Tokens::new(input);
    Parser::new(types, Pass::Base, refinement).parse_document(&mut tokens, None)
}

/// Run the plus pass over a whole document, merging into `root`.
pub fn parse_augment<R: BufRead>(
    types: &CompiledTypes,
    input: R,
    root: Record,
    refinement: &mut Refinement,
) -> Result<Record, ParseError> {
    let mut tokens = Tokens::new(input);
    Parser::new(types, Pass::Augment, refinement).parse_document(&mut tokens, Some(root))
}
