//! Batch instrumentation CLI.
//!
//! Each positional argument is a build-set directory of `.rbx` module blobs.
//! By default all build sets form one match and are checked against their
//! union (an inherited method in one set may legally be called from another).
//! With `--independent`, each build set is its own match and the batch is
//! instrumented in parallel.
//!
//! **Key modes**
//! - One match: `arena-instrument --policy policy.json --out-dir out/ a/ b/`
//! - Batch: `arena-instrument --policy policy.json --independent --out-dir out/ sets/*/`
//! - Report only: add `--emit-json report.json`, omit `--out-dir`
//!
//! **Guardrails**
//! - Nothing is written for a rejected match; violations exit non-zero.
//! - Build-set files are read in sorted order so runs are reproducible.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arena_policy::{parse_policy_json, PolicyTable};
use arena_sandbox_core::{
    content_fingerprint, instrument_match, BuildSet, InstrumentedModule, PipelineError, Violation,
    ViolationReport,
};

#[derive(Debug, Parser)]
#[command(name = "arena-instrument", author, version, about)]
struct Args {
    /// Policy table JSON.
    #[arg(long, value_name = "PATH")]
    policy: PathBuf,

    /// Write instrumented modules as `<name>.rbx` under this directory.
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Write a JSON run report (fingerprints and module sizes, or the
    /// violation list on rejection).
    #[arg(long, value_name = "PATH")]
    emit_json: Option<PathBuf>,

    /// Instrument each build set as an independent match instead of one
    /// joint match over the union.
    #[arg(long, default_value_t = false)]
    independent: bool,

    /// Build-set directories, one per submission, each holding `.rbx` files.
    #[arg(required = true, value_name = "DIR")]
    build_sets: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ModuleReport {
    name: String,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct BuildSetReport {
    dir: String,
    fingerprint: String,
    modules: Vec<ModuleReport>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum RunReport {
    Instrumented { policy_version: String, build_sets: Vec<BuildSetReport> },
    Rejected { policy_version: String, violations: Vec<Violation> },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let policy_text = fs::read_to_string(&args.policy)
        .with_context(|| format!("reading policy file {}", args.policy.display()))?;
    let policy = parse_policy_json(&policy_text)
        .with_context(|| format!("loading policy table from {}", args.policy.display()))?;
    info!(version = policy.version(), "policy table loaded");

    let sets = args
        .build_sets
        .iter()
        .map(|dir| read_build_set(dir))
        .collect::<Result<Vec<BuildSet>>>()?;

    let report = if args.independent {
        run_independent(&args, &sets, &policy)?
    } else {
        run_joint(&args, &sets, &policy)?
    };

    if let Some(path) = &args.emit_json {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    }

    if let RunReport::Rejected { violations, .. } = &report {
        eprintln!("{}", ViolationReport { violations: violations.clone() });
        std::process::exit(2);
    }
    Ok(())
}

/// Collect the `.rbx` blobs of one build-set directory, sorted by file name.
fn read_build_set(dir: &Path) -> Result<BuildSet> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading build-set directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "rbx"))
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("build-set directory {} contains no .rbx modules", dir.display());
    }
    let mut modules = Vec::with_capacity(paths.len());
    for path in paths {
        modules.push(fs::read(&path).with_context(|| format!("reading {}", path.display()))?);
    }
    Ok(BuildSet::new(modules))
}

fn run_joint(args: &Args, sets: &[BuildSet], policy: &PolicyTable) -> Result<RunReport> {
    match instrument_match(sets, policy) {
        Ok(output) => {
            let mut reports = Vec::with_capacity(sets.len());
            for (i, dir) in args.build_sets.iter().enumerate() {
                reports.push(write_build_set(
                    args,
                    dir,
                    &sets[i],
                    &output.build_sets[i],
                    policy,
                )?);
            }
            Ok(RunReport::Instrumented {
                policy_version: policy.version().to_string(),
                build_sets: reports,
            })
        }
        Err(PipelineError::Violations(report)) => {
            warn!(count = report.violations.len(), "match rejected");
            Ok(RunReport::Rejected {
                policy_version: policy.version().to_string(),
                violations: report.violations,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn run_independent(args: &Args, sets: &[BuildSet], policy: &PolicyTable) -> Result<RunReport> {
    let results: Vec<Result<_, PipelineError>> = sets
        .par_iter()
        .map(|set| instrument_match(std::slice::from_ref(set), policy))
        .collect();

    let mut reports = Vec::with_capacity(sets.len());
    let mut violations = Vec::new();
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => {
                reports.push(write_build_set(
                    args,
                    &args.build_sets[i],
                    &sets[i],
                    &output.build_sets[0],
                    policy,
                )?);
            }
            Err(PipelineError::Violations(report)) => {
                warn!(
                    dir = %args.build_sets[i].display(),
                    count = report.violations.len(),
                    "build set rejected"
                );
                violations.extend(report.violations);
            }
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("instrumenting {}", args.build_sets[i].display()));
            }
        }
    }

    if violations.is_empty() {
        Ok(RunReport::Instrumented {
            policy_version: policy.version().to_string(),
            build_sets: reports,
        })
    } else {
        Ok(RunReport::Rejected {
            policy_version: policy.version().to_string(),
            violations,
        })
    }
}

fn write_build_set(
    args: &Args,
    dir: &Path,
    set: &BuildSet,
    instrumented: &[InstrumentedModule],
    policy: &PolicyTable,
) -> Result<BuildSetReport> {
    let fingerprint =
        content_fingerprint(set.modules.iter().map(Vec::as_slice), policy.version());
    let mut modules = Vec::with_capacity(instrumented.len());
    for module in instrumented {
        // Module names are untrusted symbols; one must never steer the
        // output path outside --out-dir.
        if module.name.contains(['/', '\\']) {
            bail!("module name {:?} is not a writable file name", module.name);
        }
        if let Some(out_dir) = &args.out_dir {
            fs::create_dir_all(out_dir)
                .with_context(|| format!("creating output directory {}", out_dir.display()))?;
            let path = out_dir.join(format!("{}.rbx", module.name));
            fs::write(&path, &module.bytes)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        modules.push(ModuleReport { name: module.name.clone(), bytes: module.bytes.len() });
    }
    info!(dir = %dir.display(), modules = modules.len(), %fingerprint, "build set instrumented");
    Ok(BuildSetReport { dir: dir.display().to_string(), fingerprint, modules })
}
