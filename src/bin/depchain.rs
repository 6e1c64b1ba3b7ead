extern crate depchain;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser};
use depchain::apiset::parse_apiset;
use depchain::graph::{AnalysisContext, DependencyGraph};
use depchain::lookup_path::LookupPath;
use depchain::pe::{ImageParser, PeImage, PeParser};
use depchain::query::AnalysisQuery;
use depchain::reports::{self, ApisetsReport, ExportsReport, ImportsReport, KnownDllsReport};
use depchain::reports::{ManifestReport, SxsReport};
use depchain::system::WindowsSystem;
use depchain::view::{self, ChildOrder};
use depchain::LookupError;
use fs_err as fs;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "depchain", version, author)]
#[command(about = "Rebuild the chain of DLLs the Windows loader would pick for an executable")]
struct Cli {
    #[command(flatten)]
    mode: Mode,

    /// Target file (.exe or .dll)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Maximum recursion depth of --chain and --modules (0 = unlimited)
    #[arg(short = 'd', long = "depth", value_name = "N", default_value_t = 0)]
    depth: usize,

    /// Print a JSON document instead of text
    #[arg(long)]
    json: bool,

    /// List imported functions along with their modules (--imports)
    #[arg(short = 'f', long = "functions")]
    functions: bool,

    /// Demangle C++ symbol names (--imports, --exports)
    #[arg(long)]
    undecorate: bool,

    /// Working directory of the simulated process (default: the executable's directory)
    #[arg(short = 'k', long = "workdir", value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Additional ;-separated directories searched after the PATH
    #[arg(short = 'a', long = "userpath", value_name = "DIRS")]
    userpath: Option<String>,

    /// Partition where Windows is installed (default: deduced from FILE's location)
    #[arg(short = 'w', long = "windows-root", value_name = "DIR")]
    windows_root: Option<PathBuf>,

    /// More logging on stderr (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Args, Debug)]
#[group(id = "mode", required = true, multiple = false)]
struct Mode {
    /// List the known DLLs of the system
    #[arg(long)]
    knowndll: bool,
    /// List the API set schema of the system
    #[arg(long)]
    apisets: bool,
    /// List the API set schema stored in FILE (e.g. apisetschema.dll)
    #[arg(long)]
    apisetsdll: bool,
    /// Show the manifest embedded in FILE
    #[arg(long)]
    manifest: bool,
    /// List the side-by-side dependencies of FILE
    #[arg(long)]
    sxsentries: bool,
    /// List the modules imported by FILE
    #[arg(long)]
    imports: bool,
    /// List the symbols exported by FILE
    #[arg(long)]
    exports: bool,
    /// List every module FILE depends on, with the way it's found
    #[arg(long)]
    modules: bool,
    /// Show the full dependency tree of FILE
    #[arg(long)]
    chain: bool,
}

fn init_logger(verbose: u8, quiet: bool) {
    let filter = match (verbose, quiet) {
        (_, true) => EnvFilter::new("depchain=error"),
        (0, false) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("depchain=warn"))
        }
        (1, false) => EnvFilter::new("depchain=debug"),
        _ => EnvFilter::new("depchain=trace"),
    };

    // stdout is reserved for the report
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Print either the JSON document or the text rendering of a report
fn emit<T, F>(json: bool, report: &T, text: F) -> anyhow::Result<()>
where
    T: Serialize,
    F: FnOnce(&mut io::StdoutLock<'static>) -> io::Result<()>,
{
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, report).map_err(LookupError::from)?;
        writeln!(out)?;
    } else {
        text(&mut out)?;
    }
    out.flush()?;
    Ok(())
}

fn target_file(cli: &Cli) -> PathBuf {
    match &cli.file {
        Some(f) => f.clone(),
        None => Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "the selected mode requires a <FILE>",
            )
            .exit(),
    }
}

fn load_target(path: &Path) -> anyhow::Result<PeImage> {
    PeParser
        .load(path)
        .with_context(|| format!("Could not analyze {}", path.display()))
}

/// Windows installation the lookup is simulated against
fn windows_system(cli: &Cli) -> anyhow::Result<Option<WindowsSystem>> {
    if let Some(root) = &cli.windows_root {
        return WindowsSystem::from_root(root)
            .map(Some)
            .ok_or_else(|| {
                LookupError::ContextDeductionError(format!(
                    "no Windows installation found under {}",
                    root.display()
                ))
            })
            .context("Invalid --windows-root");
    }
    #[cfg(windows)]
    {
        Ok(Some(WindowsSystem::current()?))
    }
    #[cfg(not(windows))]
    {
        Ok(cli.file.as_ref().and_then(WindowsSystem::from_exe_location))
    }
}

fn require_system(cli: &Cli) -> anyhow::Result<WindowsSystem> {
    windows_system(cli)?.ok_or_else(|| {
        anyhow::anyhow!("No Windows installation available, specify one with --windows-root")
    })
}

fn build_graph(cli: &Cli, target: &Path) -> anyhow::Result<DependencyGraph> {
    let mut query = AnalysisQuery::deduce_from_executable_location(target)
        .with_context(|| format!("Could not analyze {}", target.display()))?;
    if let Some(root) = &cli.windows_root {
        query.set_windows_root(root)?;
    }
    if let Some(workdir) = &cli.workdir {
        query.target.working_dir = fs::canonicalize(workdir)?;
    }
    if let Some(userpath) = &cli.userpath {
        query.extend_user_path(userpath);
    }
    query.parameters.max_depth = cli.depth;
    match &query.system {
        Some(system) => debug!("Windows directory: {}", system.win_dir.display()),
        None => debug!("no Windows installation found, system lookups are skipped"),
    }

    let target_exe = query.target.target_exe.clone();
    let max_depth = query.parameters.max_depth;
    let parser = PeParser;
    let resolver = LookupPath::new(query)?;
    let ctx = AnalysisContext::new(&parser, &resolver);
    DependencyGraph::build(&ctx, &target_exe, max_depth)
        .with_context(|| format!("Could not analyze {}", target.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.quiet);

    if cli.mode.modules && cli.json {
        return Err(LookupError::UnsupportedOutput(
            "--modules does not support JSON output".to_owned(),
        )
        .into());
    }

    let mode = &cli.mode;
    if mode.knowndll {
        let report = KnownDllsReport::from_system(&require_system(&cli)?);
        emit(cli.json, &report, |o| reports::write_known_dlls(o, &report))
    } else if mode.apisets {
        let system = require_system(&cli)?;
        let report = ApisetsReport {
            source: Some(system.sys_dir.join("apisetschema.dll")),
            schema: system
                .apiset_map
                .context("The API set schema of the system could not be read")?,
        };
        emit(cli.json, &report, |o| reports::write_apisets(o, &report))
    } else if mode.apisetsdll {
        let file = target_file(&cli);
        if !file.is_file() {
            return Err(LookupError::InputNotFound(file).into());
        }
        let report = ApisetsReport {
            schema: parse_apiset(&file)
                .with_context(|| format!("Could not read the API set schema of {}", file.display()))?,
            source: Some(file),
        };
        emit(cli.json, &report, |o| reports::write_apisets(o, &report))
    } else if mode.manifest {
        let image = load_target(&target_file(&cli))?;
        let report = ManifestReport::from_image(&image);
        emit(cli.json, &report, |o| reports::write_manifest(o, &report))
    } else if mode.sxsentries {
        let image = load_target(&target_file(&cli))?;
        let system = windows_system(&cli)?;
        let report = SxsReport::from_image(&image, system.as_ref());
        emit(cli.json, &report, |o| reports::write_sxs_entries(o, &report))
    } else if mode.imports {
        let image = load_target(&target_file(&cli))?;
        let report = ImportsReport::from_image(&image, cli.undecorate);
        emit(cli.json, &report, |o| {
            reports::write_imports(o, &report, cli.functions)
        })
    } else if mode.exports {
        let image = load_target(&target_file(&cli))?;
        let report = ExportsReport::from_image(&image, cli.undecorate);
        emit(cli.json, &report, |o| reports::write_exports(o, &report))
    } else if mode.modules {
        let graph = build_graph(&cli, &target_file(&cli))?;
        let modules = view::modules(&graph);
        emit(false, &modules, |o| view::write_modules(o, &modules))
    } else {
        let graph = build_graph(&cli, &target_file(&cli))?;
        let order = if cli.json {
            ChildOrder::Full
        } else {
            ChildOrder::Deduplicated
        };
        let tree = view::tree(&graph, order);
        emit(cli.json, &tree, |o| view::write_tree(o, &tree))
    }
}
