use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use weft_engine::dfr::{function_hash, module_hash};
use weft_engine::{build, validate_output, OutputKind, Script};

#[derive(Parser)]
#[command(name = "weft")]
#[command(version)]
#[command(about = "Link, transform and weave x86/x64 objects into position-independent payloads")]
struct Cli {
    /// Log every applied step (`WEFT_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a JSON build script.
    Build {
        script: PathBuf,
        /// Bind a script input to a file: `name=path`. Unbound inputs are
        /// looked up next to the script.
        #[arg(short, long = "input", value_parser = parse_binding)]
        inputs: Vec<(String, PathBuf)>,
        /// Directory the outputs are written to.
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// Override the script's seed.
        #[arg(long)]
        seed: Option<u64>,
        /// Write the build log as JSON.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print ROR13 hashes.
    Hash {
        /// Hash as module names (upper case, `.DLL` appended).
        #[arg(short, long)]
        module: bool,
        names: Vec<String>,
    },
    /// Validate an output file and describe it.
    Inspect {
        kind: InspectKind,
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InspectKind {
    /// An input object as the engine sees it after loading.
    Input,
    Object,
    Pic,
    Pico,
}

fn parse_binding(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected `name=path`, got `{s}`")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Build {
            script,
            inputs,
            out_dir,
            seed,
            log,
        } => run_build(&script, inputs, &out_dir, seed, log.as_deref()),
        Command::Hash { module, names } => {
            for name in names {
                let h = if module { module_hash(&name) } else { function_hash(&name) };
                println!("{h:#010x}  {name}");
            }
            Ok(())
        }
        Command::Inspect { kind, file } => inspect(kind, &file),
    }
}

fn run_build(
    script_path: &Path,
    bindings: Vec<(String, PathBuf)>,
    out_dir: &Path,
    seed: Option<u64>,
    log_path: Option<&Path>,
) -> Result<()> {
    let text = fs::read_to_string(script_path).with_context(|| format!("reading {}", script_path.display()))?;
    let mut script = Script::from_json(&text).with_context(|| format!("parsing {}", script_path.display()))?;
    if seed.is_some() {
        script.seed = seed;
    }

    let base = script_path.parent().unwrap_or(Path::new("."));
    let bindings: HashMap<String, PathBuf> = bindings.into_iter().collect();
    let mut inputs = HashMap::new();
    for name in script.inputs() {
        let path = bindings.get(name).cloned().unwrap_or_else(|| base.join(name));
        let bytes = fs::read(&path).with_context(|| format!("reading input `{name}` from {}", path.display()))?;
        inputs.insert(name.to_string(), bytes);
    }

    let out = build(&script, &inputs)?;
    for warning in out.log.warnings() {
        eprintln!("warning: {warning}");
    }
    if out.outputs.is_empty() {
        bail!("{} links no output", script_path.display());
    }
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    for (name, bytes) in &out.outputs {
        let path = out_dir.join(name);
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), size = bytes.len(), "wrote output");
    }
    if let Some(path) = log_path {
        let json = serde_json::to_string_pretty(&out.log)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn inspect(kind: InspectKind, file: &Path) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file.display().to_string();
    let kind = match kind {
        InspectKind::Input => {
            let module = weft_obj::normalize::load(&name, &bytes)?;
            println!("{name}: {:?} {:?}", module.format, module.arch);
            for section in &module.sections {
                println!("  {:<12} {:?} {:#x} byte(s)", section.name, section.kind, section.size());
            }
            let defined = module.symbols.iter().filter(|(_, s)| s.is_defined()).count();
            println!("  {defined} defined of {} symbol(s)", module.symbols.len());
            println!("  {} relocation(s)", module.relocations.len());
            return Ok(());
        }
        InspectKind::Object => OutputKind::Object,
        InspectKind::Pic => OutputKind::Pic,
        InspectKind::Pico => OutputKind::Pico,
    };
    let report = validate_output(kind, &bytes)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
