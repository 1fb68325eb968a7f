//! The loaded world: id-keyed collections per top-level type, and the load
//! pipeline that builds it (base pass, plus pass, link).
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use indexmap::IndexMap;
use thiserror::Error;

use crate::linker::{self, LinkReport};
use crate::parser::{self, ParseError};
use crate::record::Record;
use crate::schema::{CompiledTypes, FieldKind, Refinement, SchemaError};

// ------------------------------- Policy ---------------------------------- //

const BASE_SUFFIX: &str = "-legends.xml";
const PLUS_SUFFIX: &str = "-legends_plus.xml";
const READ_BUFFER: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("{input}: {source}")]
    Parse { input: String, #[source] source: ParseError },
}

/// Collections keyed by element type name, in root field order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Corpus {
    root: Record,
    collections: IndexMap<String, BTreeMap<i64, Record>>,
}

impl Corpus {
    /// Lift every map field of the root record into its own collection.
    pub fn from_root(types: &CompiledTypes, mut root: Record) -> Self {
        let mut collections: IndexMap<String, BTreeMap<i64, Record>> = IndexMap::new();
        for field in types.root_type().fields.values() {
            if field.kind != FieldKind::Map {
                continue;
            }
            let Some(element) = field.elements.as_deref() else { continue };
            let records = root.take_map(&field.key).unwrap_or_default();
            collections.entry(element.to_string()).or_default().extend(records);
        }
        Self { root, collections }
    }

    /// Whatever the root element held besides its collections.
    pub fn root(&self) -> &Record {
        &self.root
    }

    pub fn collection(&self, type_name: &str) -> Option<&BTreeMap<i64, Record>> {
        self.collections.get(type_name)
    }

    pub fn collection_mut(&mut self, type_name: &str) -> Option<&mut BTreeMap<i64, Record>> {
        self.collections.get_mut(type_name)
    }

    pub fn get(&self, type_name: &str, id: i64) -> Option<&Record> {
        self.collection(type_name)?.get(&id)
    }

    pub fn get_mut(&mut self, type_name: &str, id: i64) -> Option<&mut Record> {
        self.collection_mut(type_name)?.get_mut(&id)
    }

    /// Move a collection out, leaving an empty one in its slot.
    pub fn take(&mut self, type_name: &str) -> Option<BTreeMap<i64, Record>> {
        self.collections.get_mut(type_name).map(std::mem::take)
    }

    /// Put back a collection moved out with [`Corpus::take`].
    pub fn put(&mut self, type_name: &str, records: BTreeMap<i64, Record>) {
        match self.collections.get_mut(type_name) {
            Some(slot) => *slot = records,
            None => {
                self.collections.insert(type_name.to_string(), records);
            }
        }
    }

    /// `(type name, records)` in root field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<i64, Record>)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ————————————————————————————————————————————————————————————————————————————
// LOAD PIPELINE
// ————————————————————————————————————————————————————————————————————————————

/// Parse the base export, merge the plus export when given, then link.
/// Either everything succeeds or no corpus is returned.
pub fn load<B: BufRead, P: BufRead>(
    types: &CompiledTypes,
    base: B,
    plus: Option<P>,
    refinement: &mut Refinement,
) -> Result<(Corpus, LinkReport), LoadError> {
    load_named(types, ("base export", base), plus.map(|p| ("plus export", p)), refinement)
}

/// [`load`] over files on disk.
pub fn load_files(
    types: &CompiledTypes,
    base: &Path,
    plus: Option<&Path>,
    refinement: &mut Refinement,
) -> Result<(Corpus, LinkReport), LoadError> {
    let base_name = base.display().to_string();
    let base_reader = open(base)?;
    let plus = match plus {
        Some(path) => Some((path.display().to_string(), open(path)?)),
        None => None,
    };
    load_named(types, (base_name, base_reader), plus, refinement)
}

fn load_named<N: ToString, B: BufRead, P: BufRead>(
    types: &CompiledTypes,
    (base_name, base): (N, B),
    plus: Option<(N, P)>,
    refinement: &mut Refinement,
) -> Result<(Corpus, LinkReport), LoadError> {
    let base_name = base_name.to_string();
    let root = parser::parse_base(types, base, refinement)
        .map_err(|source| LoadError::Parse { input: base_name.clone(), source })?;
    tracing::info!(input = %base_name, "base export parsed");

    let root = match plus {
        Some((plus_name, plus)) => {
            let plus_name = plus_name.to_string();
            let root = parser::parse_augment(types, plus, root, refinement)
                .map_err(|source| LoadError::Parse { input: plus_name.clone(), source })?;
            tracing::info!(input = %plus_name, checked = refinement.records_checked(), "plus export merged");
            root
        }
        None => root,
    };

    let mut corpus = Corpus::from_root(types, root);
    let report = linker::link(&mut corpus);
    tracing::info!(records = corpus.len(), ?report, "corpus linked");
    Ok((corpus, report))
}

fn open(path: &Path) -> Result<BufReader<File>, LoadError> {
    File::open(path)
        .map(|f| BufReader::with_capacity(READ_BUFFER, f))
        .map_err(|source| LoadError::Io { path: path.display().to_string(), source })
}

/// `region1-00250-01-01-legends.xml` → `region1-00250-01-01-legends_plus.xml`.
/// Only the name is derived; whether the file exists is up to the caller.
pub fn plus_path_for(base: &Path) -> Option<PathBuf> {
    let name = base.file_name()?.to_str()?;
    let stem = name.strip_suffix(BASE_SUFFIX)?;
    Some(base.with_file_name(format!("{stem}{PLUS_SUFFIX}")))
}
