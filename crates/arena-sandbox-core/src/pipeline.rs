//! Pipeline orchestration for one instrumentation request.
//!
//! All build sets competing in a match are processed together so that
//! hierarchy resolution and policy checking see the union (one module's
//! inherited method may legally be called from another build set). Any
//! Forbidden verdict rejects everything; no partial instrumentation is ever
//! returned.

use std::fmt;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use arena_ir::{
    emit_module, parse_module, verify_module, EmitError, MalformedModuleError, VerificationError,
};
use arena_policy::PolicyTable;
use arena_resolver::{Hierarchy, UnresolvedHierarchyError};

use crate::checker::{check_modules, ViolationReport};
use crate::rewriter::{rewrite_module, RewriteError};

/// The unit of instrumentation: the submitted module plus every module
/// transitively reachable through nesting/closure synthesis, as raw bytes.
#[derive(Debug, Clone, Default)]
pub struct BuildSet {
    pub modules: Vec<Vec<u8>>,
}

impl BuildSet {
    pub fn new(modules: Vec<Vec<u8>>) -> BuildSet {
        BuildSet { modules }
    }
}

/// Instrumented bytes for one module, keyed by its qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedModule {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Per-build-set instrumented output, in submission order.
#[derive(Debug, Clone, Default)]
pub struct MatchOutput {
    pub build_sets: Vec<Vec<InstrumentedModule>>,
}

/// Post-check defects: always the pipeline's fault, never the submitter's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    Verification(VerificationError),
    Rewrite(RewriteError),
    Emit(EmitError),
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalError::Verification(e) => write!(f, "internal defect: {}", e),
            InternalError::Rewrite(e) => write!(f, "internal defect: {}", e),
            InternalError::Emit(e) => write!(f, "internal defect: {}", e),
        }
    }
}

impl std::error::Error for InternalError {}

#[derive(Debug)]
pub enum PipelineError {
    /// Structurally invalid input module; fatal to the whole request.
    Malformed(MalformedModuleError),
    /// Incomplete build set (missing internal supertype); fatal.
    Unresolved(UnresolvedHierarchyError),
    /// Forbidden operations reached. A normal rejection, reported in full.
    Violations(ViolationReport),
    /// Rewriter/verifier defect; logged for the maintainers.
    Internal(InternalError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Malformed(e) => write!(f, "malformed module: {}", e),
            PipelineError::Unresolved(e) => write!(f, "unresolved hierarchy: {}", e),
            PipelineError::Violations(r) => write!(f, "{}", r),
            PipelineError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Malformed(e) => Some(e),
            PipelineError::Unresolved(e) => Some(e),
            PipelineError::Violations(e) => Some(e),
            PipelineError::Internal(e) => Some(e),
        }
    }
}

impl From<MalformedModuleError> for PipelineError {
    fn from(e: MalformedModuleError) -> Self {
        PipelineError::Malformed(e)
    }
}

impl From<UnresolvedHierarchyError> for PipelineError {
    fn from(e: UnresolvedHierarchyError) -> Self {
        PipelineError::Unresolved(e)
    }
}

impl From<ViolationReport> for PipelineError {
    fn from(e: ViolationReport) -> Self {
        PipelineError::Violations(e)
    }
}

/// Instrument every build set of a match against one policy table.
///
/// Deterministic pure function: same bytes and policy in, same bytes out.
pub fn instrument_match(
    build_sets: &[BuildSet],
    policy: &PolicyTable,
) -> Result<MatchOutput, PipelineError> {
    // Parse everything first; a malformed module aborts the whole request.
    let mut flat = Vec::new();
    let mut set_sizes = Vec::with_capacity(build_sets.len());
    for set in build_sets {
        set_sizes.push(set.modules.len());
        for bytes in &set.modules {
            flat.push(parse_module(bytes)?);
        }
    }
    debug!(modules = flat.len(), build_sets = build_sets.len(), "build sets parsed");

    {
        let hierarchy = Hierarchy::build(&flat)?;
        let summary = check_modules(&flat, &hierarchy, policy)?;
        info!(
            modules = summary.modules_checked,
            call_sites = summary.call_sites_checked,
            "policy check passed"
        );
    }

    for module in &mut flat {
        rewrite_module(module, policy)
            .map_err(|e| PipelineError::Internal(InternalError::Rewrite(e)))?;
    }

    let mut output = MatchOutput::default();
    let mut cursor = flat.into_iter();
    for size in set_sizes {
        let mut instrumented = Vec::with_capacity(size);
        for module in cursor.by_ref().take(size) {
            verify_module(&module)
                .map_err(|e| PipelineError::Internal(InternalError::Verification(e)))?;
            instrumented.push(InstrumentedModule {
                name: module.name.clone(),
                bytes: emit_module(&module)
                    .map_err(|e| PipelineError::Internal(InternalError::Emit(e)))?,
            });
        }
        output.build_sets.push(instrumented);
    }
    Ok(output)
}

/// Stable cache key for instrumented output: content hash of the raw module
/// bytes plus the policy-table version. Caching itself is the module
/// loader's responsibility; the core only supplies the fingerprint.
pub fn content_fingerprint<'a>(
    raw_modules: impl IntoIterator<Item = &'a [u8]>,
    policy_version: &str,
) -> String {
    let mut hasher = Sha256::new();
    for bytes in raw_modules {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hasher.update(policy_version.as_bytes());
    hex::encode(hasher.finalize())
}
