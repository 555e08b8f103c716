//! Runtime Registry
//!
//! Maps function ids to their handlers. Filled while the server modules load,
//! then frozen behind an `Arc` and only read from.

use futures::future::{BoxFuture, FutureExt};
use http::Response;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::api::ProtocolKind;
use crate::body::Body;
use crate::context::{FunctionContext, RequestContext};
use crate::error::{HandlerError, RegistryError};
use crate::protocol::{FormData, QueryParams};
use crate::value::Value;

pub type HandlerResult<T> = Result<T, HandlerError>;

type RawFn = dyn Fn(http::Request<Body>) -> BoxFuture<'static, HandlerResult<Response<Body>>> + Send + Sync;
type QueryFn = dyn Fn(QueryParams, RequestContext) -> BoxFuture<'static, HandlerResult<Response<Body>>> + Send + Sync;
type FormFn = dyn Fn(FormData, RequestContext) -> BoxFuture<'static, HandlerResult<Response<Body>>> + Send + Sync;
type ValueFn = dyn Fn(Value, FunctionContext) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync;
type LoaderFn = dyn Fn(QueryParams, FunctionContext) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync;
type ActionFn = dyn Fn(FormData, FunctionContext) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync;

/// A registered handler. `ref` has no variant: references are values, not
/// callable functions.
#[derive(Clone)]
pub enum Handler {
    /// Receives the raw request, returns the raw response.
    Server(Arc<RawFn>),
    Get(Arc<QueryFn>),
    Post(Arc<FormFn>),
    /// Runs with the captured scope of the call.
    Fn(Arc<ValueFn>),
    /// Runs without any scope.
    Pure(Arc<ValueFn>),
    Loader(Arc<LoaderFn>),
    Action(Arc<ActionFn>),
}

impl Handler {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Handler::Server(_) => ProtocolKind::Server,
            Handler::Get(_) => ProtocolKind::Get,
            Handler::Post(_) => ProtocolKind::Post,
            Handler::Fn(_) => ProtocolKind::Fn,
            Handler::Pure(_) => ProtocolKind::Pure,
            Handler::Loader(_) => ProtocolKind::Loader,
            Handler::Action(_) => ProtocolKind::Action,
        }
    }

    pub fn server<F, Fut>(handler: F) -> Self
    where
        F: Fn(http::Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Response<Body>>> + Send + 'static,
    {
        Handler::Server(Arc::new(move |request| handler(request).boxed()))
    }

    pub fn get<F, Fut>(handler: F) -> Self
    where
        F: Fn(QueryParams, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Response<Body>>> + Send + 'static,
    {
        Handler::Get(Arc::new(move |query, ctx| handler(query, ctx).boxed()))
    }

    pub fn post<F, Fut>(handler: F) -> Self
    where
        F: Fn(FormData, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Response<Body>>> + Send + 'static,
    {
        Handler::Post(Arc::new(move |form, ctx| handler(form, ctx).boxed()))
    }

    pub fn function<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        Handler::Fn(Arc::new(move |value, ctx| handler(value, ctx).boxed()))
    }

    pub fn pure<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        Handler::Pure(Arc::new(move |value, ctx| handler(value, ctx).boxed()))
    }

    pub fn loader<F, Fut>(handler: F) -> Self
    where
        F: Fn(QueryParams, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        Handler::Loader(Arc::new(move |query, ctx| handler(query, ctx).boxed()))
    }

    pub fn action<F, Fut>(handler: F) -> Self
    where
        F: Fn(FormData, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        Handler::Action(Arc::new(move |form, ctx| handler(form, ctx).boxed()))
    }
}

pub struct Registration {
    pub id: String,
    pub handler: Handler,
}

impl Registration {
    pub fn kind(&self) -> ProtocolKind {
        self.handler.kind()
    }
}

/// URL path an id is served under. Ids minted with an origin are absolute
/// URLs; the rest are already paths.
pub fn path_of(id: &str) -> Result<String, RegistryError> {
    if id.starts_with('/') {
        return Ok(id.to_string());
    }
    url::Url::parse(id)
        .map(|url| url.path().to_string())
        .map_err(|_| RegistryError::InvalidId(id.to_string()))
}

#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Arc<Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the generated `$$fn("<id>", handler)` call does on the server.
    pub fn register(&mut self, id: &str, handler: Handler) -> Result<(), RegistryError> {
        let path = path_of(id)?;
        if self.entries.contains_key(&path) {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        debug!(id, kind = handler.kind().as_str(), "registered function");
        self.entries.insert(
            path,
            Arc::new(Registration {
                id: id.to_string(),
                handler,
            }),
        );
        Ok(())
    }

    /// Rejects kinds that cannot be served, then registers.
    pub fn register_kind(
        &mut self,
        kind: ProtocolKind,
        id: &str,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        if kind == ProtocolKind::Ref {
            return Err(RegistryError::NotRegistrable(kind));
        }
        if kind != handler.kind() {
            return Err(RegistryError::KindMismatch {
                expected: kind,
                found: handler.kind(),
            });
        }
        self.register(id, handler)
    }

    /// Registration served under `path`.
    pub fn get(&self, path: &str) -> Option<Arc<Registration>> {
        self.entries.get(path).cloned()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Registration>> {
        self.get(&path_of(id).ok()?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
