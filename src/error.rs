use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[cfg(feature = "napi")]
use napi_derive::napi;

use crate::value::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_PARSE: &str = "T-ERR-PARSE";
pub const ERR_SHAPE: &str = "T-ERR-SHAPE";
pub const ERR_ROOT: &str = "T-ERR-ROOT";
pub const ERR_IO: &str = "T-ERR-IO";

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_PARSE => "Only syntactically valid modules are rewritten.",
        ERR_SHAPE => "Every tracked call receives an inline function literal (or, for ref$, a value).",
        ERR_ROOT => "Registrations are hoisted before a top-level statement and run once at module load.",
        ERR_IO => "Sources are read from disk before compilation.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct CompilerError {
    pub code: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}:{}:{})",
            self.code, self.message, self.file, self.line, self.column
        )
    }
}

fn join(diagnostics: &[CompilerError]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to parse {file}:\n{}", join(.diagnostics))]
    Parse {
        file: String,
        diagnostics: Vec<CompilerError>,
    },
    #[error("failed to rewrite {file}:\n{}", join(.diagnostics))]
    Extraction {
        file: String,
        diagnostics: Vec<CompilerError>,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CompileError {
    pub fn diagnostics(&self) -> Vec<CompilerError> {
        match self {
            CompileError::Parse { diagnostics, .. } | CompileError::Extraction { diagnostics, .. } => {
                diagnostics.clone()
            }
            CompileError::Io { path, source } => vec![CompilerError::new(
                ERR_IO,
                &source.to_string(),
                path,
                0,
                0,
            )],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Raised by every tracked factory when it runs without having been compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{api} cannot be called during runtime.")]
pub struct NotCompiled {
    pub api: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(String),
    #[error("unknown node tag {0:?}")]
    UnknownTag(String),
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("reference to unknown shared node {0}")]
    DanglingShared(u32),
    #[error("message for unknown deferred value {0}")]
    DanglingDeferred(u32),
    #[error("unknown stable reference {0:?}")]
    UnknownReference(String),
    #[error("malformed chunk header at byte {0}")]
    BadHeader(usize),
    #[error("stream ended inside a chunk: expected {expected} more bytes, got {received}")]
    Truncated { expected: usize, received: usize },
    #[error("stream ended before any value was received")]
    Empty,
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("malformed form body: {0}")]
    Form(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(error: serde_json::Error) -> Self {
        DecodeError::Json(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("function {0:?} is already registered")]
    Duplicate(String),
    #[error("{0} is not a registrable kind")]
    NotRegistrable(crate::api::ProtocolKind),
    #[error("cannot register a {found} handler as {expected}")]
    KindMismatch {
        expected: crate::api::ProtocolKind,
        found: crate::api::ProtocolKind,
    },
    #[error("invalid function id {0:?}")]
    InvalidId(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("interceptor rejected the request: {0}")]
    Interceptor(String),
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("function {id:?} failed: {error}")]
    Remote { id: String, error: Value },
    #[error("function {id:?} responded with status {status}")]
    Status { id: String, status: http::StatusCode },
    #[error("response for {expected:?} was tagged {received:?}")]
    Mismatch { expected: String, received: String },
    #[error("{0} functions cannot be called through a stub")]
    Unsupported(crate::api::ProtocolKind),
}

/// A failure thrown by a registered handler. Carries the thrown value so that
/// development builds can send it back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError(pub Value);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(Value::error("Error", message))
    }

    pub fn from_value(value: Value) -> Self {
        HandlerError(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for HandlerError {
    fn from(error: E) -> Self {
        HandlerError::new(error.to_string())
    }
}
