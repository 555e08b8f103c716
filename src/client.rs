//! Client Stub Factory
//!
//! Builds the callable a client-build `$$clone` produces for each kind. Every
//! outgoing request runs through the client's interceptor chain before it
//! reaches the transport.

use async_trait::async_trait;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::api::ProtocolKind;
use crate::body::Body;
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::protocol::{
    encode_multipart, encode_query, FormData, ProtocolHeaders, QueryParams, CHUNKED_CONTENT_TYPE,
};
use crate::serialize::{decode_stream, serialize_body, References};
use crate::value::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT AND INTERCEPTORS
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ClientError>;
}

/// Sends requests straight into an in-process dispatcher. Requests it does
/// not handle get a `404`.
#[derive(Clone)]
pub struct LocalTransport {
    dispatcher: Dispatcher,
}

impl LocalTransport {
    pub fn new(dispatcher: Dispatcher) -> Self {
        LocalTransport { dispatcher }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ClientError> {
        match self.dispatcher.handle_request(request).await {
            Some(response) => Ok(response),
            None => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NOT_FOUND;
                Ok(response)
            }
        }
    }
}

/// Sees every outgoing request and returns the one to send instead.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: Request<Body>) -> Result<Request<Body>, ClientError>;
}

#[async_trait]
impl<F> Interceptor for F
where
    F: Fn(Request<Body>) -> Result<Request<Body>, ClientError> + Send + Sync,
{
    async fn intercept(&self, request: Request<Body>) -> Result<Request<Body>, ClientError> {
        self(request)
    }
}

/// Extra options for one call, merged into the request the stub builds.
#[derive(Debug, Default)]
pub struct RequestInit {
    pub method: Option<Method>,
    pub headers: HeaderMap,
    /// Only used by `server` stubs; other kinds own their body.
    pub body: Option<Body>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Client {
    origin: String,
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    instances: AtomicU64,
    references: Arc<References>,
}

impl Client {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Client {
            origin: String::new(),
            transport: Arc::new(transport),
            interceptors: Vec::new(),
            instances: AtomicU64::new(0),
            references: Arc::new(References::new()),
        }
    }

    /// Prefix for ids minted without an origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_references(mut self, references: Arc<References>) -> Self {
        self.references = references;
        self
    }

    /// Appends to the interceptor chain. Interceptors run in the order they
    /// were added.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn references(&self) -> &Arc<References> {
        &self.references
    }

    fn next_instance(&self) -> String {
        self.instances.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn url_for(&self, id: &str) -> String {
        if id.starts_with('/') {
            format!("{}{}", self.origin, id)
        } else {
            id.to_string()
        }
    }

    async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>, ClientError> {
        for interceptor in &self.interceptors {
            request = interceptor.intercept(request).await?;
        }
        self.transport.send(request).await
    }

    /// What the client build's `$$clone` returns for a function of `kind`.
    pub fn stub(self: &Arc<Self>, kind: ProtocolKind, id: &str) -> Result<Stub, ClientError> {
        let target = Target {
            client: self.clone(),
            kind,
            id: id.to_string(),
        };
        Ok(match kind {
            ProtocolKind::Server => Stub::Server(RawStub { target }),
            ProtocolKind::Get => Stub::Get(QueryStub { target }),
            ProtocolKind::Post => Stub::Post(FormStub { target }),
            ProtocolKind::Fn => Stub::Fn(FunctionStub {
                target,
                scope: Vec::new(),
            }),
            ProtocolKind::Pure => Stub::Pure(FunctionStub {
                target,
                scope: Vec::new(),
            }),
            ProtocolKind::Loader => Stub::Loader(LoaderStub { target }),
            ProtocolKind::Action => Stub::Action(ActionStub { target }),
            ProtocolKind::Ref => return Err(ClientError::Unsupported(kind)),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STUBS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Target {
    client: Arc<Client>,
    kind: ProtocolKind,
    id: String,
}

impl Target {
    fn request(
        &self,
        method: Method,
        query: Option<String>,
        instance: Option<String>,
        init: RequestInit,
        body: Body,
    ) -> Result<Request<Body>, ClientError> {
        let mut url = self.client.url_for(&self.id);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(&query);
        }
        let mut request = Request::builder()
            .method(init.method.unwrap_or(method))
            .uri(url)
            .body(body)?;
        let headers = request.headers_mut();
        headers.extend(init.headers);
        ProtocolHeaders::new(self.kind, instance, &self.id).apply(headers);
        Ok(request)
    }

    async fn send_raw(&self, request: Request<Body>) -> Result<Response<Body>, ClientError> {
        debug!(id = self.id.as_str(), kind = self.kind.as_str(), "sending request");
        self.client.send(request).await
    }

    /// Sends a correlated request and decodes its streamed result.
    async fn call(
        &self,
        method: Method,
        query: Option<String>,
        init: RequestInit,
        body: Body,
        content_type: Option<String>,
    ) -> Result<Value, ClientError> {
        let instance = self.client.next_instance();
        let mut request = self.request(method, query, Some(instance.clone()), init, body)?;
        if let Some(content_type) = content_type.and_then(|c| HeaderValue::from_str(&c).ok()) {
            request.headers_mut().insert(CONTENT_TYPE, content_type);
        }

        let response = self.send_raw(request).await?;
        let status = response.status();
        let received = ProtocolHeaders::from_headers(response.headers());
        let references = self.client.references.clone();

        if !status.is_success() {
            return match decode_stream(response.into_body(), references).await {
                Ok(error) => Err(ClientError::Remote {
                    id: self.id.clone(),
                    error,
                }),
                Err(_) => Err(ClientError::Status {
                    id: self.id.clone(),
                    status,
                }),
            };
        }

        if received.instance.as_deref() != Some(instance.as_str()) {
            return Err(ClientError::Mismatch {
                expected: instance,
                received: received.instance.unwrap_or_default(),
            });
        }
        if received.function_id.as_deref() != Some(self.id.as_str()) {
            return Err(ClientError::Mismatch {
                expected: self.id.clone(),
                received: received.function_id.unwrap_or_default(),
            });
        }

        Ok(decode_stream(response.into_body(), references).await?)
    }
}

/// `server$`: forwards a request built from the init options.
#[derive(Clone)]
pub struct RawStub {
    target: Target,
}

impl RawStub {
    pub async fn send(&self, mut init: RequestInit) -> Result<Response<Body>, ClientError> {
        let body = init.body.take().unwrap_or_default();
        let request = self.target.request(Method::POST, None, None, init, body)?;
        self.target.send_raw(request).await
    }
}

/// `get$`: the record travels as a sorted query string.
#[derive(Clone)]
pub struct QueryStub {
    target: Target,
}

impl QueryStub {
    pub async fn send(&self, query: &QueryParams, init: RequestInit) -> Result<Response<Body>, ClientError> {
        let request =
            self.target
                .request(Method::GET, Some(encode_query(query)), None, init, Body::empty())?;
        self.target.send_raw(request).await
    }
}

/// `post$`: the record travels as multipart form data.
#[derive(Clone)]
pub struct FormStub {
    target: Target,
}

impl FormStub {
    pub async fn send(&self, form: &FormData, init: RequestInit) -> Result<Response<Body>, ClientError> {
        let (content_type, body) = encode_multipart(form);
        let mut request = self
            .target
            .request(Method::POST, None, None, init, Body::from(body))?;
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            request.headers_mut().insert(CONTENT_TYPE, value);
        }
        self.target.send_raw(request).await
    }
}

/// `fn$` and `pure$`. A `fn` stub carries the values captured at its call
/// site; `pure` stubs never send a scope.
#[derive(Clone)]
pub struct FunctionStub {
    target: Target,
    scope: Vec<Value>,
}

impl FunctionStub {
    /// Binds the values returned by the call site's capture thunk.
    pub fn with_scope(mut self, scope: Vec<Value>) -> Self {
        self.scope = scope;
        self
    }

    pub async fn call(&self, value: impl Into<Value>) -> Result<Value, ClientError> {
        self.call_with(value, RequestInit::default()).await
    }

    pub async fn call_with(&self, value: impl Into<Value>, init: RequestInit) -> Result<Value, ClientError> {
        let payload = match self.target.kind {
            ProtocolKind::Fn => Value::object([
                ("scope", Value::Array(self.scope.clone())),
                ("value", value.into()),
            ]),
            _ => Value::object([("value", value.into())]),
        };
        self.target
            .call(
                Method::POST,
                None,
                init,
                serialize_body(payload),
                Some(CHUNKED_CONTENT_TYPE.to_string()),
            )
            .await
    }
}

/// `loader$`: query record in, decoded value out.
#[derive(Clone)]
pub struct LoaderStub {
    target: Target,
}

impl LoaderStub {
    pub async fn call(&self, query: &QueryParams, init: RequestInit) -> Result<Value, ClientError> {
        self.target
            .call(Method::GET, Some(encode_query(query)), init, Body::empty(), None)
            .await
    }
}

/// `action$`: form record in, decoded value out.
#[derive(Clone)]
pub struct ActionStub {
    target: Target,
}

impl ActionStub {
    pub async fn call(&self, form: &FormData, init: RequestInit) -> Result<Value, ClientError> {
        let (content_type, body) = encode_multipart(form);
        self.target
            .call(Method::POST, None, init, Body::from(body), Some(content_type))
            .await
    }
}

/// One callable per kind. `ref` has no stub.
#[derive(Clone)]
pub enum Stub {
    Server(RawStub),
    Get(QueryStub),
    Post(FormStub),
    Fn(FunctionStub),
    Pure(FunctionStub),
    Loader(LoaderStub),
    Action(ActionStub),
}

impl Stub {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Stub::Server(_) => ProtocolKind::Server,
            Stub::Get(_) => ProtocolKind::Get,
            Stub::Post(_) => ProtocolKind::Post,
            Stub::Fn(_) => ProtocolKind::Fn,
            Stub::Pure(_) => ProtocolKind::Pure,
            Stub::Loader(_) => ProtocolKind::Loader,
            Stub::Action(_) => ProtocolKind::Action,
        }
    }

    /// The `fn`/`pure` callable, if this is one.
    pub fn into_function(self) -> Result<FunctionStub, ClientError> {
        match self {
            Stub::Fn(stub) | Stub::Pure(stub) => Ok(stub),
            other => Err(ClientError::Unsupported(other.kind())),
        }
    }
}
