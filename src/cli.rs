//! CLI: load exports, write their external shape, sweep reconciliation.
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::corpus::{load_files, plus_path_for};
use crate::external::corpus_to_external;
use crate::linker::LinkReport;
use crate::schema::{compile, CompiledTypes, Refinement, Schema};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// parse world history exports into a linked corpus, driven by a declarative schema
#[derive(Parser, Debug)]
#[command(version)]
pub struct CommandLineInterface {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// load and link exports, print a summary and optionally write the external JSON shape
    Load(LoadOut),
    /// load many exports in parallel and report which plus fields duplicate base fields
    Refine(RefineOut),
    /// print the compiled schema: relation predicates and enum domains
    Schema(SchemaOut),
}

#[derive(Args, Debug, Clone)]
struct InputSettings {
    /// schema JSON (the bundled world schema if omitted)
    #[arg(long, short)]
    schema: Option<PathBuf>,

    /// ignore `-legends_plus.xml` siblings
    #[arg(long, default_value_t = false)]
    no_plus: bool,

    /// One or more base exports (`*-legends.xml`). May be literal paths or quoted glob patterns
    #[arg(long, short, num_args = 1.., required = true)]
    input: Vec<String>,
}

#[derive(clap::Parser, Debug)]
struct LoadOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// output .json file for the corpus (single input only)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(clap::Parser, Debug)]
struct RefineOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// output .json file for the report (stdout if omitted)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// also list the pairs that disagreed
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(clap::Parser, Debug)]
struct SchemaOut {
    /// schema JSON (the bundled world schema if omitted)
    #[arg(long, short)]
    schema: Option<PathBuf>,

    /// only this object type
    #[arg(long)]
    object: Option<String>,
}

/// Result of a refinement sweep, ready to paste into `same_fields`.
#[derive(Debug, Serialize)]
struct RefinementReport {
    generated_at: String,
    exports: usize,
    records_checked: u64,
    same_fields: IndexMap<String, IndexMap<String, String>>,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl InputSettings {
    fn compiled_types(&self) -> Result<CompiledTypes> {
        load_types(self.schema.as_deref())
    }

    /// `(base, plus)` per input.
    fn exports(&self) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
        let paths = resolve_file_path_patterns(&self.input)?;
        Ok(paths
            .into_iter()
            .map(|base| {
                let plus = if self.no_plus { None } else { plus_path_for(&base).filter(|p| p.is_file()) };
                (base, plus)
            })
            .collect())
    }
}

impl CommandLineInterface {
    pub fn load() -> Self {
        Self::parse()
    }
    pub fn run(&self) -> Result<()> {
        match &self.cmd {
            Command::Load(target) => target.run(),
            Command::Refine(target) => target.run(),
            Command::Schema(target) => target.run(),
        }
    }
}

impl LoadOut {
    fn run(&self) -> Result<()> {
        let types = self.input_settings.compiled_types()?;
        let exports = self.input_settings.exports()?;
        if self.out.is_some() && exports.len() != 1 {
            bail!("--out takes exactly one input, got {}", exports.len());
        }
        for (base, plus) in &exports {
            let mut refinement = Refinement::seed(&types);
            let (corpus, report) = load_files(&types, base, plus.as_deref(), &mut refinement)
                .with_context(|| format!("failed to load {}", base.display()))?;

            eprintln!("{} {}", "loaded".green().bold(), base.display());
            if let Some(plus) = plus {
                eprintln!("  {} {}", "with".dimmed(), plus.display());
            }
            for (type_name, records) in corpus.iter() {
                eprintln!("  {:<28} {:>8}", type_name, records.len());
            }
            print_link_report(&report);

            if let Some(out) = self.out.as_ref() {
                let json = corpus_to_external(&types, &corpus);
                write_output(Some(out), &serde_json::to_string_pretty(&json)?)?;
            }
        }
        Ok(())
    }
}

impl RefineOut {
    fn run(&self) -> Result<()> {
        let types = self.input_settings.compiled_types()?;
        let exports = self.input_settings.exports()?;
        let plus_count = exports.iter().filter(|(_, plus)| plus.is_some()).count();
        if plus_count == 0 {
            bail!("no `-legends_plus.xml` sibling found: nothing to compare");
        }

        // one refinement per export, merged afterwards
        let runs: Vec<Result<Refinement>> = exports
            .par_iter()
            .map(|(base, plus)| {
                let mut refinement = Refinement::seed(&types);
                load_files(&types, base, plus.as_deref(), &mut refinement)
                    .with_context(|| format!("failed to load {}", base.display()))?;
                Ok(refinement)
            })
            .collect();
        let mut merged: Option<Refinement> = None;
        for run in runs {
            let run = run?;
            merged = Some(match merged {
                Some(acc) => acc.merge(run),
                None => run,
            });
        }
        let merged = merged.unwrap_or_else(|| Refinement::seed(&types));

        for (object, plus, base, same) in merged.iter() {
            if same {
                eprintln!("  {} {object}.{plus} = {base}", "✓".green());
            } else if self.all {
                eprintln!("  {} {object}.{plus} ≠ {base}", "✗".red());
            }
        }

        let report = RefinementReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            exports: plus_count,
            records_checked: merged.records_checked(),
            same_fields: merged.proposed_table().to_decl(),
        };
        write_output(self.out.as_deref(), &serde_json::to_string_pretty(&report)?)
    }
}

impl SchemaOut {
    fn run(&self) -> Result<()> {
        let types = load_types(self.schema.as_deref())?;
        for ty in types.types.values() {
            if self.object.as_ref().is_some_and(|o| *o != ty.name) {
                continue;
            }
            let mut flags = Vec::new();
            if ty.id { flags.push("id") }
            if ty.named { flags.push("named") }
            if ty.is_polymorphic() { flags.push("polymorphic") }
            println!("{} {}", ty.name.bold(), flags.join(" ").dimmed());
            for (kind, predicate) in ty.relations.iter().filter(|(_, p)| !p.is_never()) {
                println!("  {:<18} {}", kind.key().cyan(), predicate);
            }
            for field in ty.fields.values().filter(|f| f.is_elided()) {
                let base = field.elided_into.as_deref().unwrap_or_default();
                println!("  {:<18} {} → {}", "elided".yellow(), field.name, base);
            }
        }
        if self.object.is_none() {
            for domain in types.enums.iter() {
                println!("{} {} ({} values)", "enum".magenta(), domain.name, domain.len());
            }
        }
        Ok(())
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn load_types(path: Option<&Path>) -> Result<CompiledTypes> {
    let schema = match path {
        Some(path) => Schema::from_path(path)?,
        None => Schema::bundled().context("bundled schema is invalid")?,
    };
    let types = compile(&schema).context("schema does not compile")?;
    tracing::debug!(types = types.types.len(), root = %types.root, "schema compiled");
    Ok(types)
}

fn print_link_report(report: &LinkReport) {
    let LinkReport { structures, entity_sites, ruin_updates, curses, event_memberships, aggregates, occasions, dangling } =
        report;
    eprintln!(
        "  {} structures={structures} entity_sites={entity_sites} ruins={ruin_updates} curses={curses} \
         memberships={event_memberships} aggregates={aggregates} occasions={occasions}",
        "linked".cyan()
    );
    if *dangling > 0 {
        eprintln!("  {} {dangling} dangling references skipped", "note".yellow());
    }
}

fn write_output(out: Option<&Path>, contents: &str) -> Result<()> {
    let Some(out) = out else {
        println!("{contents}");
        return Ok(());
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(out, contents).with_context(|| format!("failed to write {}", out.display()))
}

fn resolve_file_path_patterns<I>(patterns: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    fn has_glob_chars(s: &str) -> bool {
        s.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'{'))
    }

    let mut out = Vec::<PathBuf>::new();

    for raw in patterns {
        let pattern = raw.as_ref();

        if has_glob_chars(pattern) {
            let mut matched_any = false;
            for entry in glob::glob(pattern).with_context(|| format!("bad glob pattern: {pattern}"))? {
                out.push(entry?);
                matched_any = true;
            }
            if !matched_any {
                bail!("glob pattern matched no files: {pattern}");
            }
        } else {
            out.push(PathBuf::from(pattern));
        }
    }

    Ok(out)
}
