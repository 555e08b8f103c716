//! Compiler entry point.
//!
//! `compile()` parses one module, resolves scopes, runs the call rewriter and
//! emits the rewritten code with its source map.

use lazy_static::lazy_static;
use oxc_allocator::Allocator;
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{api_table, ApiEntry, ProtocolKind};
use crate::edits::{emit, Pieces, SourceMap};
use crate::error::{CompileError, CompilerError, ERR_PARSE};
use crate::imports::BindingRegistration;
use crate::minter::{IdMinter, DEFAULT_PREFIX};
use crate::scope::{NameCollector, UidGenerator};
use crate::transform::Extractor;

lazy_static! {
    static ref TYPESCRIPT_PATH: Regex = Regex::new(r"\.[mc]?tsx?$").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS AND OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    pub prefix: String,
    pub origin: Option<String>,
    pub mode: Mode,
    pub dev_mode: bool,
    pub extra_api_table: Vec<ApiEntry>,
    /// Fail on tracked calls without a literal argument instead of skipping them.
    pub strict: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            prefix: DEFAULT_PREFIX.to_string(),
            origin: None,
            mode: Mode::Server,
            dev_mode: false,
            extra_api_table: Vec::new(),
            strict: true,
        }
    }
}

impl CompileOptions {
    pub fn server() -> Self {
        Self::default()
    }

    pub fn client() -> Self {
        CompileOptions {
            mode: Mode::Client,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionArtifact {
    pub id: String,
    pub kind: ProtocolKind,
    pub scoping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutput {
    pub code: String,
    pub source_map: SourceMap,
    pub functions: Vec<FunctionArtifact>,
}

/// `.ts`, `.mts`, `.cts` parse without JSX; `.tsx` with it; everything else
/// is JavaScript with JSX enabled.
pub fn source_type_for(file_path: &str) -> SourceType {
    let typescript = TYPESCRIPT_PATH.is_match(file_path);
    let jsx = !typescript || file_path.ends_with('x');
    SourceType::default()
        .with_module(true)
        .with_typescript(typescript)
        .with_jsx(jsx)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE
// ═══════════════════════════════════════════════════════════════════════════════

pub fn compile(
    file_path: &str,
    source: &str,
    options: &CompileOptions,
) -> Result<CompileOutput, CompileError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, source_type_for(file_path)).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return Err(CompileError::Parse {
            file: file_path.to_string(),
            diagnostics: parsed
                .errors
                .iter()
                .map(|e| CompilerError::new(ERR_PARSE, &e.to_string(), file_path, 0, 0))
                .collect(),
        });
    }
    let program = parsed.program;

    let semantic = SemanticBuilder::new().build(&program);
    if !semantic.errors.is_empty() {
        return Err(CompileError::Parse {
            file: file_path.to_string(),
            diagnostics: semantic
                .errors
                .iter()
                .map(|e| CompilerError::new(ERR_PARSE, &e.to_string(), file_path, 0, 0))
                .collect(),
        });
    }
    let scoping = semantic.semantic.into_scoping();

    let table = api_table(&options.extra_api_table);
    let registration = BindingRegistration::collect(&program, &table);
    if registration.is_empty() {
        let mut untouched = Pieces::new();
        untouched.push_original(0, source.len() as u32);
        let (code, source_map) = emit(&untouched, source, file_path);
        return Ok(CompileOutput {
            code,
            source_map,
            functions: Vec::new(),
        });
    }

    let mut names = NameCollector::default();
    names.visit_program(&program);

    let minter = IdMinter::new(
        file_path,
        Some(options.prefix.as_str()),
        options.origin.as_deref(),
        options.dev_mode,
    );
    let mut extractor = Extractor::new(
        file_path,
        source,
        options.mode,
        options.strict,
        &scoping,
        &registration,
        minter,
        UidGenerator::new(names.names),
    );
    extractor.run(&program);

    if !extractor.diagnostics.is_empty() {
        return Err(CompileError::Extraction {
            file: file_path.to_string(),
            diagnostics: extractor.diagnostics,
        });
    }

    let (code, source_map) = emit(&extractor.edits.finish(), source, file_path);
    debug!(
        file = file_path,
        mode = ?options.mode,
        functions = extractor.functions.len(),
        "compiled module"
    );
    Ok(CompileOutput {
        code,
        source_map,
        functions: extractor.functions,
    })
}
