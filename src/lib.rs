//! Schema-driven parser and semantic linker for world history exports.
//!
//! A declarative [`schema::Schema`] is compiled once into
//! [`schema::CompiledTypes`]. The [`parser`] reads the base export and merges
//! the plus export into the same records, the [`linker`] resolves
//! cross-references, and [`corpus::load`] ties the pipeline together.
pub mod cli;
pub mod corpus;
pub mod external;
pub mod linker;
pub mod parser;
pub mod path_de;
pub mod record;
pub mod schema;
pub mod tokens;

pub use corpus::{load, load_files, Corpus, LoadError};
pub use record::{Payload, Record, Value};
pub use schema::{compile, CompiledTypes, Schema, SchemaError};
