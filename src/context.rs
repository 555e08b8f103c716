//! Invocation Context
//!
//! Each handler invocation gets its own context. The captured scope of a `fn`
//! call lives in a task-local slot for exactly the duration of that call, so
//! concurrent or nested invocations never observe each other's scope.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

use crate::api::ProtocolKind;
use crate::value::Value;

pub type Scope = Arc<[Value]>;

tokio::task_local! {
    static CURRENT_SCOPE: Option<Scope>;
}

/// The captured values of the `fn` invocation running on this task, in
/// capture order. Empty outside such an invocation. This is what the
/// generated `$$scope()` prelude reads.
pub fn scope() -> Scope {
    try_scope().unwrap_or_else(|| Arc::from(Vec::new()))
}

pub fn try_scope() -> Option<Scope> {
    CURRENT_SCOPE.try_with(|scope| scope.clone()).ok().flatten()
}

/// Runs `future` with `scope` as the current scope. `None` hides any scope
/// set by an enclosing invocation.
pub async fn with_scope<F: Future>(scope: Option<Scope>, future: F) -> F::Output {
    CURRENT_SCOPE.scope(scope, future).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST AND RESPONSE METADATA
// ═══════════════════════════════════════════════════════════════════════════════

/// The parts of the incoming request a handler may inspect.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestInfo {
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        RequestInfo {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }
}

/// Status and headers a value handler wants on its response.
#[derive(Debug, Clone, Default)]
pub struct ResponseInit {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

/// Context handed to `get` and `post` handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    pub kind: ProtocolKind,
    pub request: RequestInfo,
}

/// Context handed to value handlers (`fn`, `pure`, `loader`, `action`).
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub id: String,
    pub kind: ProtocolKind,
    pub instance: Option<String>,
    pub request: RequestInfo,
    scope: Option<Scope>,
    response: Arc<Mutex<ResponseInit>>,
}

impl FunctionContext {
    pub fn new(
        id: impl Into<String>,
        kind: ProtocolKind,
        instance: Option<String>,
        request: RequestInfo,
        scope: Option<Scope>,
    ) -> Self {
        FunctionContext {
            id: id.into(),
            kind,
            instance,
            request,
            scope,
            response: Arc::new(Mutex::new(ResponseInit::default())),
        }
    }

    /// Captured values of this call. Always empty for kinds other than `fn`.
    pub fn scope(&self) -> &[Value] {
        self.scope.as_deref().unwrap_or(&[])
    }

    pub(crate) fn scope_handle(&self) -> Option<Scope> {
        self.scope.clone()
    }

    pub fn set_status(&self, status: StatusCode) {
        self.response.lock().status = Some(status);
    }

    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.response.lock().headers.insert(name, value);
    }

    pub(crate) fn take_response_init(&self) -> ResponseInit {
        std::mem::take(&mut *self.response.lock())
    }
}
