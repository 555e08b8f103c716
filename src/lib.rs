//! # Thaler
//!
//! Server functions written inline in client code.
//!
//! ## Compiler
//!
//! `compile()` rewrites every call to a tracked factory (`server$`, `get$`,
//! `post$`, `fn$`, `pure$`, `loader$`, `action$`) whose argument is a function
//! literal:
//!
//! 1. **Identity**: the call site gets an id, `/<prefix>/<hash32(file)>-<n>`.
//!    Server and client builds of the same file mint the same ids.
//! 2. **Registration**: `const _fn = $$fn("<id>", <literal>);` is hoisted before
//!    the enclosing top-level statement. The client build drops the literal.
//! 3. **Capture**: for `fn$`, the variables the literal reads from enclosing
//!    non-top-level scopes are captured at the call site with a thunk and
//!    restored on the server with `const [a, b] = $$scope();`.
//! 4. **Invocation**: the call becomes `$$clone(_fn, () => [a, b])`.
//!
//! `ref$(value)` becomes `$$ref("<id>", value)`.
//!
//! ## Runtime
//!
//! The [`Registry`] and [`Dispatcher`] serve registered handlers; the
//! [`Client`] builds one stub per kind. `fn`/`pure` values travel as framed
//! chunks of a serialized value graph, so deferred values can settle after
//! the caller already has the root.

#[cfg(feature = "napi")]
use napi_derive::napi;

pub mod api;
pub mod body;
mod cache;
pub mod client;
pub mod compile;
pub mod context;
mod discovery;
pub mod dispatch;
mod edits;
pub mod error;
pub mod framing;
mod imports;
mod minter;
pub mod protocol;
pub mod registry;
mod scope;
pub mod serialize;
mod transform;
pub mod value;

#[cfg(test)]
mod client_tests;
#[cfg(test)]
mod dispatch_tests;
#[cfg(test)]
mod serialize_tests;

pub use api::{api_table, ApiEntry, ImportDefinition, ProtocolKind, DEFAULT_API_TABLE};
pub use body::Body;
pub use cache::IncrementalCache;
pub use client::{Client, FunctionStub, Interceptor, LocalTransport, RequestInit, Stub, Transport};
pub use compile::{compile, source_type_for, CompileOptions, CompileOutput, FunctionArtifact, Mode};
pub use context::{scope, with_scope, FunctionContext, RequestContext};
pub use discovery::{compile_tree, find_source_files, DiscoveryOptions, FileResult};
pub use dispatch::{Dispatcher, RuntimeMode};
pub use edits::SourceMap;
pub use error::{
    ClientError, CompileError, CompilerError, DecodeError, HandlerError, NotCompiled, RegistryError,
};
pub use minter::{hash32, IdMinter, DEFAULT_PREFIX};
pub use protocol::{FormData, FormValue, OneOrMany, QueryParams};
pub use registry::{Handler, HandlerResult, Registry};
pub use serialize::References;
pub use value::{Deferred, Value};

/// Compiles one module for a Node host. `options` follows the camelCase
/// shape of [`CompileOptions`].
#[cfg(feature = "napi")]
#[napi]
pub fn compile_native(
    file_path: String,
    source: String,
    options: Option<serde_json::Value>,
) -> napi::Result<serde_json::Value> {
    let options: CompileOptions = match options {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| napi::Error::from_reason(format!("invalid options: {}", e)))?,
        None => CompileOptions::default(),
    };
    let output = compile(&file_path, &source, &options).map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_value(output).map_err(|e| napi::Error::from_reason(e.to_string()))
}
