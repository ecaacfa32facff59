use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sable::{
    bindings,
    interface::InterfaceTable,
    pipeline::{BuildRequest, IdRule, Pipeline},
    source::Loader,
    RunError,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile every script under a directory and publish artifacts
    /// plus the index.
    Build {
        input_dir: PathBuf,
        #[arg(long, default_value = "out")]
        out: PathBuf,
        #[arg(long)]
        components: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = IdRuleArg::DeclaredOrHash)]
        id_rule: IdRuleArg,
        /// Also generate Rust binding stubs into this directory.
        #[arg(long)]
        bindings: Option<PathBuf>,
    },
    /// Compile without writing anything.
    Check {
        input_dir: PathBuf,
        #[arg(long)]
        components: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = IdRuleArg::DeclaredOrHash)]
        id_rule: IdRuleArg,
    },
    /// Generate Rust binding stubs for a component interface file.
    Bindings {
        components: PathBuf,
        #[arg(long, default_value = "bindings")]
        out: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum IdRuleArg {
    Declared,
    NameHash,
    DeclaredOrHash,
}

impl From<IdRuleArg> for IdRule {
    fn from(arg: IdRuleArg) -> Self {
        match arg {
            IdRuleArg::Declared => IdRule::Declared,
            IdRuleArg::NameHash => IdRule::NameHash,
            IdRuleArg::DeclaredOrHash => IdRule::DeclaredOrHash,
        }
    }
}

fn build(
    input_dir: PathBuf,
    out: PathBuf,
    components: Option<PathBuf>,
    id_rule: IdRuleArg,
    bindings: Option<PathBuf>,
) -> anyhow::Result<()> {
    let request = BuildRequest {
        input_dir,
        output_dir: out,
        components_file: components,
        id_rule: id_rule.into(),
        bindings_dir: bindings,
    };
    match Pipeline::default().run(&request) {
        Ok(report) => {
            println!(
                "assembled {} script(s); index at {}",
                report.compiled,
                report.index_path.display()
            );
            Ok(())
        }
        Err(RunError::Compile(diagnostics)) => {
            for diagnostic in &diagnostics {
                eprintln!("error: {diagnostic}");
            }
            anyhow::bail!("{} script(s) failed to compile", diagnostics.len())
        }
        Err(e) => Err(e.into()),
    }
}

fn check(
    input_dir: PathBuf,
    components: Option<PathBuf>,
    id_rule: IdRuleArg,
) -> anyhow::Result<()> {
    let table = match components {
        Some(path) => InterfaceTable::load(&path)?,
        None => InterfaceTable::default(),
    };
    let sources = Loader::new(input_dir).discover()?;
    let mut pipeline = Pipeline::new(id_rule.into());
    let outcome = pipeline.compile(&sources, &table)?;
    if !outcome.diagnostics.is_empty() {
        for diagnostic in &outcome.diagnostics {
            eprintln!("error: {diagnostic}");
        }
        anyhow::bail!("{} script(s) failed to compile", outcome.diagnostics.len())
    }
    // Id collisions only surface once every script has an id.
    pipeline.build_index(&outcome.compiled)?;
    println!("checked {} script(s)", outcome.compiled.len());
    Ok(())
}

fn generate_bindings(components: PathBuf, out: PathBuf) -> anyhow::Result<()> {
    let table = InterfaceTable::load(&components)?;
    bindings::write_all(&table, &out)?;
    println!(
        "generated bindings for {} component(s) in {}",
        table.len(),
        out.display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Build {
            input_dir,
            out,
            components,
            id_rule,
            bindings,
        } => build(input_dir, out, components, id_rule, bindings),
        Commands::Check {
            input_dir,
            components,
            id_rule,
        } => check(input_dir, components, id_rule),
        Commands::Bindings { components, out } => generate_bindings(components, out),
    }
}
