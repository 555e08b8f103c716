//! Tracked API Table
//!
//! The set of factory functions the compiler recognizes. Each entry names the
//! export users import (`fn$` from `thaler`), the call protocol it selects and
//! the runtime helpers the rewritten code imports instead, per build variant.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NotCompiled;

pub const SOURCE_MODULE: &str = "thaler";
pub const CLIENT_MODULE: &str = "thaler/client";
pub const SERVER_MODULE: &str = "thaler/server";

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL KIND
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Server,
    Get,
    Post,
    Fn,
    Pure,
    Loader,
    Action,
    Ref,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 8] = [
        ProtocolKind::Server,
        ProtocolKind::Get,
        ProtocolKind::Post,
        ProtocolKind::Fn,
        ProtocolKind::Pure,
        ProtocolKind::Loader,
        ProtocolKind::Action,
        ProtocolKind::Ref,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Server => "server",
            ProtocolKind::Get => "get",
            ProtocolKind::Post => "post",
            ProtocolKind::Fn => "fn",
            ProtocolKind::Pure => "pure",
            ProtocolKind::Loader => "loader",
            ProtocolKind::Action => "action",
            ProtocolKind::Ref => "ref",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Kinds whose requests carry an instance id and expect a streamed,
    /// serialized result.
    pub fn is_correlated(self) -> bool {
        match self {
            ProtocolKind::Fn | ProtocolKind::Pure | ProtocolKind::Loader | ProtocolKind::Action => {
                true
            }
            ProtocolKind::Server | ProtocolKind::Get | ProtocolKind::Post | ProtocolKind::Ref => {
                false
            }
        }
    }

    /// `ref$` wraps a value, every other kind wraps a function literal.
    pub fn takes_function(self) -> bool {
        !matches!(self, ProtocolKind::Ref)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TABLE ENTRIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ImportDefinition {
    Named { name: String, source: String },
    Default { source: String },
}

impl ImportDefinition {
    pub fn named(name: &str, source: &str) -> Self {
        ImportDefinition::Named {
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            ImportDefinition::Named { source, .. } | ImportDefinition::Default { source } => source,
        }
    }

    /// Name used when generating a local alias for this import.
    pub fn preferred_local(&self) -> String {
        match self {
            ImportDefinition::Named { name, .. } => name.clone(),
            ImportDefinition::Default { source } => {
                let tail = source.rsplit('/').next().unwrap_or(source);
                let cleaned: String = tail
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '$' { c } else { '_' })
                    .collect();
                format!("_{}", cleaned)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEntry {
    /// Exported name users call, e.g. `fn$`.
    pub name: String,
    pub kind: ProtocolKind,
    pub scoping: bool,
    pub target: ImportDefinition,
    pub client: ImportDefinition,
    pub server: ImportDefinition,
}

impl ApiEntry {
    fn builtin(name: &str, kind: ProtocolKind, scoping: bool, helper: &str) -> Self {
        ApiEntry {
            name: name.to_string(),
            kind,
            scoping,
            target: ImportDefinition::named(name, SOURCE_MODULE),
            client: ImportDefinition::named(helper, CLIENT_MODULE),
            server: ImportDefinition::named(helper, SERVER_MODULE),
        }
    }

    pub fn import_for(&self, mode: crate::compile::Mode) -> &ImportDefinition {
        match mode {
            crate::compile::Mode::Server => &self.server,
            crate::compile::Mode::Client => &self.client,
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_API_TABLE: Vec<ApiEntry> = vec![
        ApiEntry::builtin("server$", ProtocolKind::Server, false, "$$server"),
        ApiEntry::builtin("get$", ProtocolKind::Get, false, "$$get"),
        ApiEntry::builtin("post$", ProtocolKind::Post, false, "$$post"),
        ApiEntry::builtin("fn$", ProtocolKind::Fn, true, "$$fn"),
        ApiEntry::builtin("pure$", ProtocolKind::Pure, false, "$$pure"),
        ApiEntry::builtin("loader$", ProtocolKind::Loader, false, "$$loader"),
        ApiEntry::builtin("action$", ProtocolKind::Action, false, "$$action"),
        ApiEntry::builtin("ref$", ProtocolKind::Ref, false, "$$ref"),
    ];
}

/// Default entries followed by caller-provided ones. A custom entry with the
/// same target as a default one replaces it.
pub fn api_table(extra: &[ApiEntry]) -> Vec<ApiEntry> {
    let mut table: Vec<ApiEntry> = DEFAULT_API_TABLE
        .iter()
        .filter(|entry| !extra.iter().any(|custom| custom.target == entry.target))
        .cloned()
        .collect();
    table.extend(extra.iter().cloned());
    table
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME MARKERS
// ═══════════════════════════════════════════════════════════════════════════════

/// What a tagged factory does when the calling module was never compiled:
/// it always fails, naming the factory.
pub fn call_uncompiled<T>(api: &str) -> Result<T, NotCompiled> {
    Err(NotCompiled {
        api: api.to_string(),
    })
}

pub fn server<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("server$")
}

pub fn get<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("get$")
}

pub fn post<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("post$")
}

pub fn r#fn<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("fn$")
}

pub fn pure<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("pure$")
}

pub fn loader<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("loader$")
}

pub fn action<H>(_handler: H) -> Result<(), NotCompiled> {
    call_uncompiled("action$")
}

pub fn r#ref<T>(_value: T) -> Result<T, NotCompiled> {
    call_uncompiled("ref$")
}
