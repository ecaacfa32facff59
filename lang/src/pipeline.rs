//! The build driver: loads component interfaces, compiles every
//! discovered script, and publishes artifacts plus the index.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    bindings,
    bytecode::{CompiledScript, MAX_SCRIPT_ID},
    emitter::{self, EmitError},
    index::{Index, IndexError, INDEX_FILE_NAME},
    interface::{InterfaceLoadError, InterfaceTable},
    parser::{self, SyntaxError},
    resolver::{self, ResolveError},
    source::{check_unique_names, DiscoverError, Loader, ScriptSource},
};

/// Where the driver currently is. `Failed` is reachable from every state
/// but `Idle`; `Done` only via `BuildingIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    LoadingInterfaces,
    CompilingScripts,
    BuildingIndex,
    Done,
    Failed,
}

/// How a script gets its numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdRule {
    /// Every script must carry an `.id` directive.
    Declared,
    /// Ids are always derived from the script name; directives are ignored.
    NameHash,
    /// Use the directive when present, hash the name otherwise.
    #[default]
    DeclaredOrHash,
}

#[derive(thiserror::Error, Debug)]
#[error("id rule requires an .id directive, but the script declares none")]
pub struct MissingDeclaredId;

impl IdRule {
    pub fn assign(self, name: &str, declared: Option<u32>) -> Result<u32, MissingDeclaredId> {
        match self {
            IdRule::Declared => declared.ok_or(MissingDeclaredId),
            IdRule::NameHash => {
                if declared.is_some() {
                    warn!(script = %name, "ignoring .id directive under the name-hash id rule");
                }
                Ok(name_hash(name))
            }
            IdRule::DeclaredOrHash => Ok(declared.unwrap_or_else(|| name_hash(name))),
        }
    }
}

/// Id derived from a script name: the first four bytes of its SHA-256
/// digest, big-endian, with the top bit cleared so the id stays valid
/// for consumers that treat ids as signed.
pub fn name_hash(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & MAX_SCRIPT_ID
}

/// One failure in one script. Compilation keeps going across scripts, so
/// a run reports every diagnostic it found, not just the first.
#[derive(Debug)]
pub struct Diagnostic {
    pub script: String,
    pub path: PathBuf,
    pub kind: DiagnosticKind,
}

#[derive(thiserror::Error, Debug)]
pub enum DiagnosticKind {
    #[error("{0}")]
    Syntax(#[from] SyntaxError),
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("{0}")]
    Emit(#[from] EmitError),
    #[error("{0}")]
    Id(#[from] MissingDeclaredId),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.kind)
    }
}

/// Everything a compilation pass produced: the scripts that made it
/// through, and the diagnostics for the ones that did not.
#[derive(Debug, Default)]
pub struct CompileOutcome {
    pub compiled: Vec<CompiledScript>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A full build over a directory tree.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub components_file: Option<PathBuf>,
    pub id_rule: IdRule,
    /// When set, Rust binding stubs for the interface table land here.
    pub bindings_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BuildReport {
    pub compiled: usize,
    pub index_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Interface(#[from] InterfaceLoadError),
    #[error(transparent)]
    Discover(#[from] DiscoverError),
    #[error("{} script(s) failed to compile", .0.len())]
    Compile(Vec<Diagnostic>),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("unable to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The driver itself. Embedders can call the phases one at a time
/// (`compile`, then `build_index`) over in-memory sources, or hand a
/// [`BuildRequest`] to [`Pipeline::run`] for the whole directory flow.
#[derive(Debug)]
pub struct Pipeline {
    id_rule: IdRule,
    state: DriverState,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(IdRule::default())
    }
}

impl Pipeline {
    pub fn new(id_rule: IdRule) -> Self {
        Pipeline {
            id_rule,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Compiles every source. Scripts are independent, so they compile in
    /// parallel; the outcome preserves input order regardless.
    pub fn compile(
        &mut self,
        sources: &[ScriptSource],
        table: &InterfaceTable,
    ) -> Result<CompileOutcome, DiscoverError> {
        self.state = DriverState::CompilingScripts;
        if let Err(e) = check_unique_names(sources) {
            self.state = DriverState::Failed;
            return Err(e);
        }
        let id_rule = self.id_rule;
        let results: Vec<_> = sources
            .par_iter()
            .map(|source| compile_one(source, table, id_rule))
            .collect();
        let mut outcome = CompileOutcome::default();
        for result in results {
            match result {
                Ok(script) => outcome.compiled.push(script),
                Err(mut diagnostics) => outcome.diagnostics.append(&mut diagnostics),
            }
        }
        if !outcome.diagnostics.is_empty() {
            self.state = DriverState::Failed;
        }
        Ok(outcome)
    }

    /// Builds the index over the compiled scripts and settles the driver
    /// in `Done` (or `Failed` on an id collision).
    pub fn build_index(&mut self, scripts: &[CompiledScript]) -> Result<Index, IndexError> {
        self.state = DriverState::BuildingIndex;
        match Index::build(scripts) {
            Ok(index) => {
                self.state = DriverState::Done;
                Ok(index)
            }
            Err(e) => {
                self.state = DriverState::Failed;
                Err(e)
            }
        }
    }

    /// Runs the whole build: interfaces, discovery, compilation, index,
    /// publication. Nothing lands in the output directory unless every
    /// script compiled.
    pub fn run(&mut self, request: &BuildRequest) -> Result<BuildReport, RunError> {
        self.id_rule = request.id_rule;
        self.state = DriverState::LoadingInterfaces;
        let table = match &request.components_file {
            Some(path) => InterfaceTable::load(path).map_err(|e| self.fail(e))?,
            None => InterfaceTable::default(),
        };
        if let Some(dir) = &request.bindings_dir {
            bindings::write_all(&table, dir).map_err(|e| {
                self.fail(RunError::Io {
                    path: dir.clone(),
                    source: e,
                })
            })?;
        }
        let sources = Loader::new(&request.input_dir)
            .discover()
            .map_err(|e| self.fail(e))?;
        let outcome = self.compile(&sources, &table)?;
        if !outcome.diagnostics.is_empty() {
            return Err(RunError::Compile(outcome.diagnostics));
        }
        let index = self.build_index(&outcome.compiled)?;
        publish(&request.output_dir, &outcome.compiled, &index).map_err(|e| self.fail(e))?;
        info!(scripts = outcome.compiled.len(), "assembled all scripts");
        Ok(BuildReport {
            compiled: outcome.compiled.len(),
            index_path: request.output_dir.join(INDEX_FILE_NAME),
        })
    }

    fn fail(&mut self, error: impl Into<RunError>) -> RunError {
        self.state = DriverState::Failed;
        error.into()
    }
}

fn compile_one(
    source: &ScriptSource,
    table: &InterfaceTable,
    id_rule: IdRule,
) -> Result<CompiledScript, Vec<Diagnostic>> {
    let ast = parser::parse(&source.text).map_err(|e| vec![diagnostic(source, e.into())])?;
    let resolved = resolver::resolve(&ast, table, &source.text).map_err(|errors| {
        errors
            .into_iter()
            .map(|e| diagnostic(source, e.into()))
            .collect::<Vec<_>>()
    })?;
    let (code, pool) = emitter::emit(&resolved).map_err(|e| vec![diagnostic(source, e.into())])?;
    let id = id_rule
        .assign(&source.name, resolved.declared_id)
        .map_err(|e| vec![diagnostic(source, e.into())])?;
    info!(script = %source.name, id, "assembled");
    Ok(CompiledScript {
        id,
        name: source.name.clone(),
        pool,
        code,
        source_len: source.text.len(),
    })
}

fn diagnostic(source: &ScriptSource, kind: DiagnosticKind) -> Diagnostic {
    Diagnostic {
        script: source.name.clone(),
        path: source.path.clone(),
        kind,
    }
}

/// Clears the output directory and writes one `<id>.sbc` artifact per
/// script plus the index. The index goes last, through a staging file,
/// so its appearance marks a complete output set.
fn publish(output_dir: &Path, scripts: &[CompiledScript], index: &Index) -> Result<(), RunError> {
    if output_dir.exists() {
        if let Err(e) = fs::remove_dir_all(output_dir) {
            warn!(dir = %output_dir.display(), error = %e, "could not clear stale outputs");
        }
    }
    fs::create_dir_all(output_dir).map_err(|source| RunError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    for script in scripts {
        let path = output_dir.join(script.artifact_file_name());
        fs::write(&path, script.encode()).map_err(|source| RunError::Io {
            path: path.clone(),
            source,
        })?;
    }
    let index_path = output_dir.join(INDEX_FILE_NAME);
    index.write_atomic(&index_path).map_err(|source| RunError::Io {
        path: index_path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPONENTS: &str = r#"
        [[component]]
        name = "ui"
        id = 4

        [[component.member]]
        name = "say"
        kind = "method"
        args = ["string"]
    "#;

    fn table() -> InterfaceTable {
        InterfaceTable::from_str(COMPONENTS).unwrap()
    }

    #[test]
    fn a_fresh_pipeline_is_idle() {
        assert_eq!(Pipeline::default().state(), DriverState::Idle);
    }

    #[test]
    fn compiling_then_indexing_reaches_done() {
        let mut pipeline = Pipeline::default();
        let sources = vec![ScriptSource::new("greet", "ui.say(\"hi\")")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert_eq!(pipeline.state(), DriverState::CompilingScripts);
        assert_eq!(outcome.compiled.len(), 1);
        assert!(outcome.diagnostics.is_empty());
        pipeline.build_index(&outcome.compiled).unwrap();
        assert_eq!(pipeline.state(), DriverState::Done);
    }

    #[test]
    fn one_broken_script_does_not_stop_the_others() {
        let mut pipeline = Pipeline::default();
        let sources = vec![
            ScriptSource::new("good", "ui.say(\"hi\")"),
            ScriptSource::new("bad", "goto nowhere"),
            ScriptSource::new("worse", "local local"),
        ];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert_eq!(outcome.compiled.len(), 1);
        assert_eq!(outcome.compiled[0].name, "good");
        assert_eq!(outcome.diagnostics.len(), 2);
        assert_eq!(pipeline.state(), DriverState::Failed);
    }

    #[test]
    fn diagnostics_lead_with_the_file_path() {
        let mut pipeline = Pipeline::default();
        let sources = vec![ScriptSource::new("town/greet", "goto nowhere")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        let message = outcome.diagnostics[0].to_string();
        assert!(
            message.starts_with("town/greet.script: "),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn duplicate_source_names_abort_compilation() {
        let mut pipeline = Pipeline::default();
        let sources = vec![
            ScriptSource::new("greet", "return"),
            ScriptSource::new("greet", "return"),
        ];
        assert!(pipeline.compile(&sources, &table()).is_err());
        assert_eq!(pipeline.state(), DriverState::Failed);
    }

    #[test]
    fn duplicate_ids_fail_the_index_phase() {
        let mut pipeline = Pipeline::default();
        let sources = vec![
            ScriptSource::new("a", ".id 7\nreturn"),
            ScriptSource::new("b", ".id 7\nreturn"),
        ];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        let err = pipeline.build_index(&outcome.compiled).unwrap_err();
        let IndexError::DuplicateId { id, .. } = err;
        assert_eq!(id, 7);
        assert_eq!(pipeline.state(), DriverState::Failed);
    }

    #[test]
    fn declared_ids_win_under_the_default_rule() {
        let mut pipeline = Pipeline::default();
        let sources = vec![ScriptSource::new("greet", ".id 42\nreturn")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert_eq!(outcome.compiled[0].id, 42);
    }

    #[test]
    fn undeclared_ids_fall_back_to_the_name_hash() {
        let mut pipeline = Pipeline::default();
        let sources = vec![ScriptSource::new("greet", "return")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert_eq!(outcome.compiled[0].id, name_hash("greet"));
    }

    #[test]
    fn the_name_hash_rule_overrides_directives() {
        let mut pipeline = Pipeline::new(IdRule::NameHash);
        let sources = vec![ScriptSource::new("greet", ".id 42\nreturn")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert_eq!(outcome.compiled[0].id, name_hash("greet"));
        assert_ne!(outcome.compiled[0].id, 42);
    }

    #[test]
    fn the_declared_rule_demands_a_directive() {
        let mut pipeline = Pipeline::new(IdRule::Declared);
        let sources = vec![ScriptSource::new("greet", "return")];
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        assert!(outcome.compiled.is_empty());
        assert!(matches!(
            outcome.diagnostics[0].kind,
            DiagnosticKind::Id(_)
        ));
    }

    #[test]
    fn name_hashes_stay_in_the_valid_id_range() {
        for name in ["greet", "town/greet", "bank", ""] {
            assert!(name_hash(name) <= MAX_SCRIPT_ID);
        }
        assert_eq!(name_hash("greet"), name_hash("greet"));
        assert_ne!(name_hash("greet"), name_hash("bank"));
    }

    #[test]
    fn outcome_order_matches_input_order() {
        let mut pipeline = Pipeline::default();
        let sources: Vec<_> = (0..32)
            .map(|i| ScriptSource::new(format!("s{i:02}"), format!(".id {i}\nreturn")))
            .collect();
        let outcome = pipeline.compile(&sources, &table()).unwrap();
        let names: Vec<_> = outcome.compiled.iter().map(|s| s.name.as_str()).collect();
        let expected: Vec<_> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, expected);
    }
}
