//! Dispatcher
//!
//! Resolves an incoming request to a registered handler, validates the
//! protocol headers, decodes the arguments for the handler's kind, runs it
//! inside its own invocation context and encodes the outcome.

use futures::FutureExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::api::ProtocolKind;
use crate::body::Body;
use crate::context::{with_scope, FunctionContext, RequestContext, RequestInfo, Scope};
use crate::error::{DecodeError, HandlerError};
use crate::protocol::{decode_form, decode_query, ProtocolHeaders, CHUNKED_CONTENT_TYPE};
use crate::registry::{Handler, Registration, Registry};
use crate::serialize::{decode_stream, serialize_body, References};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    /// Handler failures are sent back as they were thrown.
    Development,
    /// Handler failures are replaced by a generic message.
    #[default]
    Production,
}

pub fn unhandled_error_message(id: &str) -> String {
    format!("function \"{}\" threw an unhandled server-side error.", id)
}

fn plain(status: StatusCode, text: String) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Why a request cannot be dispatched to the registration it resolved to.
fn validate(registration: &Registration, headers: &ProtocolHeaders) -> Result<(), String> {
    let kind = registration.kind();
    if let Some(request_type) = &headers.request_type {
        if headers.kind() != Some(kind) {
            return Err(format!(
                "request type {:?} does not match {} function {:?}",
                request_type, kind, registration.id
            ));
        }
    }
    if !kind.is_correlated() {
        return Ok(());
    }
    if headers.request_type.is_none() {
        return Err(format!("missing request type for {} function", kind));
    }
    if headers.instance.is_none() {
        return Err("missing instance id".to_string());
    }
    match &headers.function_id {
        Some(function_id) if *function_id == registration.id => Ok(()),
        Some(function_id) => Err(format!(
            "function id {:?} does not match {:?}",
            function_id, registration.id
        )),
        None => Err("missing function id".to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Awaits a handler, turning a panic into an ordinary handler failure.
async fn guarded<T, F>(future: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::new(panic_message(payload))),
    }
}

/// Splits the `{scope, value}` envelope of a `fn`/`pure` request.
fn open_envelope(payload: Value) -> (Option<Scope>, Value) {
    let scope = payload
        .get("scope")
        .and_then(Value::as_array)
        .map(|items| Scope::from(items.to_vec()));
    let value = payload.get("value").cloned().unwrap_or(Value::Undefined);
    (scope, value)
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    mode: RuntimeMode,
    references: Arc<References>,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Dispatcher {
            registry: Arc::new(registry),
            mode: RuntimeMode::default(),
            references: Arc::new(References::new()),
        }
    }

    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_references(mut self, references: Arc<References>) -> Self {
        self.references = references;
        self
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn references(&self) -> &Arc<References> {
        &self.references
    }

    fn failure_value(&self, id: &str, failure: HandlerError) -> Value {
        match self.mode {
            RuntimeMode::Development => failure.into_value(),
            RuntimeMode::Production => Value::error("Error", unhandled_error_message(id)),
        }
    }

    /// Handles `request` if its path belongs to a registered function.
    /// `None` means the request is not ours and should fall through to the
    /// embedding application.
    pub async fn handle_request(&self, request: Request<Body>) -> Option<Response<Body>> {
        let registration = self.registry.get(request.uri().path())?;
        let headers = ProtocolHeaders::from_headers(request.headers());

        if let Err(reason) = validate(&registration, &headers) {
            warn!(id = registration.id.as_str(), %reason, "rejected request");
            return Some(plain(StatusCode::BAD_REQUEST, reason));
        }
        debug!(
            id = registration.id.as_str(),
            kind = registration.kind().as_str(),
            instance = headers.instance.as_deref(),
            "dispatching request"
        );

        let response = match self.dispatch(&registration, headers, request).await {
            Ok(response) => response,
            Err(reason) => {
                warn!(id = registration.id.as_str(), %reason, "malformed request body");
                plain(StatusCode::BAD_REQUEST, reason.to_string())
            }
        };
        Some(response)
    }

    async fn dispatch(
        &self,
        registration: &Registration,
        headers: ProtocolHeaders,
        request: Request<Body>,
    ) -> Result<Response<Body>, DecodeError> {
        let id = registration.id.clone();
        let kind = registration.kind();
        let (parts, body) = request.into_parts();
        let info = RequestInfo::from_parts(&parts);
        let request_context = || RequestContext {
            id: id.clone(),
            kind,
            request: info.clone(),
        };
        let function_context =
            |scope: Option<Scope>| FunctionContext::new(id.clone(), kind, headers.instance.clone(), info.clone(), scope);

        let response = match &registration.handler {
            Handler::Server(handler) => {
                let request = Request::from_parts(parts, body);
                self.respond_raw(&id, guarded(with_scope(None, handler(request))).await)
            }
            Handler::Get(handler) => {
                let query = decode_query(info.uri.query().unwrap_or(""));
                self.respond_raw(&id, guarded(with_scope(None, handler(query, request_context()))).await)
            }
            Handler::Post(handler) => {
                let form = decode_form(&info.headers, body).await?;
                self.respond_raw(&id, guarded(with_scope(None, handler(form, request_context()))).await)
            }
            Handler::Fn(handler) => {
                let payload = decode_stream(body, self.references.clone()).await?;
                let (scope, value) = open_envelope(payload);
                let ctx = function_context(Some(scope.unwrap_or_else(|| Scope::from(Vec::new()))));
                let result = guarded(with_scope(ctx.scope_handle(), handler(value, ctx.clone()))).await;
                self.respond_value(&id, &headers, &ctx, result)
            }
            Handler::Pure(handler) => {
                let payload = decode_stream(body, self.references.clone()).await?;
                let (_, value) = open_envelope(payload);
                let ctx = function_context(None);
                let result = guarded(with_scope(None, handler(value, ctx.clone()))).await;
                self.respond_value(&id, &headers, &ctx, result)
            }
            Handler::Loader(handler) => {
                let query = decode_query(info.uri.query().unwrap_or(""));
                let ctx = function_context(None);
                let result = guarded(with_scope(None, handler(query, ctx.clone()))).await;
                self.respond_value(&id, &headers, &ctx, result)
            }
            Handler::Action(handler) => {
                let form = decode_form(&info.headers, body).await?;
                let ctx = function_context(None);
                let result = guarded(with_scope(None, handler(form, ctx.clone()))).await;
                self.respond_value(&id, &headers, &ctx, result)
            }
        };
        Ok(response)
    }

    fn respond_raw(&self, id: &str, result: Result<Response<Body>, HandlerError>) -> Response<Body> {
        match result {
            Ok(response) => response,
            Err(failure) => {
                error!(id, error = %failure, "handler failed");
                let text = match self.mode {
                    RuntimeMode::Development => failure.to_string(),
                    RuntimeMode::Production => unhandled_error_message(id),
                };
                plain(StatusCode::INTERNAL_SERVER_ERROR, text)
            }
        }
    }

    fn respond_value(
        &self,
        id: &str,
        headers: &ProtocolHeaders,
        ctx: &FunctionContext,
        result: Result<Value, HandlerError>,
    ) -> Response<Body> {
        let init = ctx.take_response_init();
        let (status, value) = match result {
            Ok(value) => (init.status.unwrap_or(StatusCode::OK), value),
            Err(failure) => {
                error!(id, error = %failure, "handler failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.failure_value(id, failure))
            }
        };

        let mut response = Response::new(serialize_body(value));
        *response.status_mut() = status;
        let response_headers = response.headers_mut();
        response_headers.extend(init.headers);
        response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(CHUNKED_CONTENT_TYPE));
        ProtocolHeaders::new(ctx.kind, headers.instance.clone(), id).apply(response_headers);
        response
    }

    /// Calls a `fn` or `pure` function in-process, as the server build of a
    /// cloned function does. `fn` sees `scope`; `pure` sees nothing.
    pub async fn invoke_local(
        &self,
        id: &str,
        scope: Vec<Value>,
        value: Value,
    ) -> Result<Value, HandlerError> {
        let registration = self
            .registry
            .lookup(id)
            .ok_or_else(|| HandlerError::new(format!("function {:?} is not registered", id)))?;

        let result = match &registration.handler {
            Handler::Fn(handler) => {
                let ctx = FunctionContext::new(
                    id,
                    ProtocolKind::Fn,
                    None,
                    RequestInfo::default(),
                    Some(Scope::from(scope)),
                );
                guarded(with_scope(ctx.scope_handle(), handler(value, ctx.clone()))).await
            }
            Handler::Pure(handler) => {
                let ctx = FunctionContext::new(id, ProtocolKind::Pure, None, RequestInfo::default(), None);
                guarded(with_scope(None, handler(value, ctx))).await
            }
            other => {
                return Err(HandlerError::new(format!(
                    "{} function {:?} cannot be invoked locally",
                    other.kind(),
                    id
                )))
            }
        };
        result.map_err(|failure| {
            error!(id, error = %failure, "local invocation failed");
            HandlerError::from_value(self.failure_value(id, failure))
        })
    }
}
