#[cfg(test)]
mod tests {
    use crate::api::ProtocolKind;
    use crate::body::Body;
    use crate::context::{scope, try_scope};
    use crate::dispatch::{unhandled_error_message, Dispatcher, RuntimeMode};
    use crate::error::{HandlerError, RegistryError};
    use crate::protocol::{
        encode_multipart, FormData, FormValue, OneOrMany, ProtocolHeaders, FUNCTION_ID_HEADER,
        INSTANCE_HEADER, REQUEST_TYPE_HEADER,
    };
    use crate::registry::{Handler, Registry};
    use crate::serialize::{decode_all, serialize_body, References};
    use crate::value::Value;
    use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
    use http::{Request, Response, StatusCode};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    const FN_ID: &str = "/__thaler/1a2b3c4d-0";
    const PURE_ID: &str = "/__thaler/1a2b3c4d-1";

    fn fn_request(id: &str, kind: ProtocolKind, scope: Vec<Value>, value: Value) -> Request<Body> {
        let payload = Value::object([("scope", Value::Array(scope)), ("value", value)]);
        let mut request = Request::post(id).body(serialize_body(payload)).unwrap();
        ProtocolHeaders::new(kind, Some("1".to_string()), id).apply(request.headers_mut());
        request
    }

    async fn read_value(response: Response<Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap();
        decode_all(&bytes, Arc::new(References::new())).unwrap()
    }

    async fn read_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn adder() -> Handler {
        Handler::function(|value: Value, ctx| async move {
            let captured = scope();
            assert_eq!(ctx.scope(), &captured[..]);
            let sum = value.as_f64().unwrap_or(0.0) + captured[0].as_f64().unwrap_or(0.0);
            Ok::<_, HandlerError>(Value::from(sum))
        })
    }

    #[tokio::test]
    async fn test_unknown_path_falls_through() {
        let dispatcher = Dispatcher::new(Registry::new());
        let request = Request::get("/somewhere/else").body(Body::empty()).unwrap();
        assert!(dispatcher.handle_request(request).await.is_none());
    }

    #[tokio::test]
    async fn test_fn_call_sees_its_scope() {
        let mut registry = Registry::new();
        registry.register(FN_ID, adder()).unwrap();
        let dispatcher = Dispatcher::new(registry);

        let request = fn_request(FN_ID, ProtocolKind::Fn, vec![Value::from(41)], Value::from(1));
        let response = dispatcher.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let echoed = ProtocolHeaders::from_headers(response.headers());
        assert_eq!(echoed, ProtocolHeaders::new(ProtocolKind::Fn, Some("1".to_string()), FN_ID));
        assert_eq!(read_value(response).await, Value::from(42));
    }

    #[tokio::test]
    async fn test_missing_instance_is_rejected_before_the_handler_runs() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let mut registry = Registry::new();
        registry
            .register(
                FN_ID,
                Handler::function(move |_, _| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok::<_, HandlerError>(Value::Null) }
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let mut request = fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null);
        request.headers_mut().remove(INSTANCE_HEADER);
        let response = dispatcher.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mismatched_headers_are_rejected() {
        let mut registry = Registry::new();
        registry.register(FN_ID, adder()).unwrap();
        let dispatcher = Dispatcher::new(registry);

        let mut wrong_kind = fn_request(FN_ID, ProtocolKind::Fn, vec![Value::from(1)], Value::from(1));
        wrong_kind
            .headers_mut()
            .insert(REQUEST_TYPE_HEADER, HeaderValue::from_static("pure"));
        let response = dispatcher.handle_request(wrong_kind).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut wrong_id = fn_request(FN_ID, ProtocolKind::Fn, vec![Value::from(1)], Value::from(1));
        wrong_id
            .headers_mut()
            .insert(FUNCTION_ID_HEADER, HeaderValue::from_static("/__thaler/other-0"));
        let response = dispatcher.handle_request(wrong_id).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(read_text(response).await.contains("does not match"));
    }

    #[tokio::test]
    async fn test_pure_call_has_no_scope() {
        let mut registry = Registry::new();
        registry
            .register(
                PURE_ID,
                Handler::pure(|value: Value, ctx| async move {
                    assert!(ctx.scope().is_empty());
                    assert!(try_scope().is_none());
                    Ok::<_, HandlerError>(value)
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let request = fn_request(PURE_ID, ProtocolKind::Pure, vec![Value::from(9)], Value::from("echo"));
        let response = dispatcher.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_value(response).await, Value::from("echo"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_keep_their_own_scope() {
        let mut registry = Registry::new();
        registry
            .register(
                FN_ID,
                Handler::function(|delay: Value, _| async move {
                    let before = scope();
                    let millis = delay.as_f64().unwrap_or(0.0) as u64;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    let after = scope();
                    assert_eq!(before, after);
                    Ok::<_, HandlerError>(after[0].clone())
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let (slow, fast) = tokio::join!(
            dispatcher.invoke_local(FN_ID, vec![Value::from("slow")], Value::from(20)),
            dispatcher.invoke_local(FN_ID, vec![Value::from("fast")], Value::from(1)),
        );
        assert_eq!(slow.unwrap(), Value::from("slow"));
        assert_eq!(fast.unwrap(), Value::from("fast"));
        assert!(try_scope().is_none());
    }

    #[tokio::test]
    async fn test_pure_called_from_fn_does_not_inherit_scope() {
        let cell: Arc<OnceLock<Dispatcher>> = Arc::new(OnceLock::new());
        let outer_cell = cell.clone();

        let mut registry = Registry::new();
        registry
            .register(
                FN_ID,
                Handler::function(move |_, _| {
                    let cell = outer_cell.clone();
                    async move {
                        let dispatcher = cell.get().cloned().ok_or_else(|| HandlerError::new("not ready"))?;
                        let inner = dispatcher.invoke_local(PURE_ID, vec![], Value::Null).await?;
                        Ok::<_, HandlerError>(Value::from(vec![Value::from(scope().len() as i32), inner]))
                    }
                }),
            )
            .unwrap();
        registry
            .register(
                PURE_ID,
                Handler::pure(|_, _| async { Ok::<_, HandlerError>(Value::from(scope().len() as i32)) }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);
        let _ = cell.set(dispatcher.clone());

        let result = dispatcher
            .invoke_local(FN_ID, vec![Value::from(1), Value::from(2)], Value::Null)
            .await
            .unwrap();
        assert_eq!(result, Value::from(vec![Value::from(2), Value::from(0)]));
    }

    fn failing_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                FN_ID,
                Handler::function(|_, _| async { Err::<Value, _>(HandlerError::new("database is down")) }),
            )
            .unwrap();
        registry
            .register(
                "/__thaler/1a2b3c4d-2",
                Handler::server(|_| async { Err::<Response<Body>, _>(HandlerError::new("disk full")) }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_failures_in_production_are_generic() {
        let dispatcher = Dispatcher::new(failing_registry());
        assert_eq!(dispatcher.mode(), RuntimeMode::Production);

        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            read_value(response).await,
            Value::error("Error", unhandled_error_message(FN_ID))
        );

        let raw = Request::post("/__thaler/1a2b3c4d-2").body(Body::empty()).unwrap();
        let response = dispatcher.handle_request(raw).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_text(response).await, unhandled_error_message("/__thaler/1a2b3c4d-2"));
    }

    #[tokio::test]
    async fn test_failures_in_development_are_forwarded() {
        let dispatcher = Dispatcher::new(failing_registry()).with_mode(RuntimeMode::Development);

        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_value(response).await, Value::error("Error", "database is down"));

        let raw = Request::post("/__thaler/1a2b3c4d-2").body(Body::empty()).unwrap();
        let response = dispatcher.handle_request(raw).await.unwrap();
        assert!(read_text(response).await.contains("disk full"));
    }

    fn explode() -> Result<Value, HandlerError> {
        panic!("boom secret")
    }

    fn panicking_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(FN_ID, Handler::function(|_, _| async { explode() }))
            .unwrap();
        registry
            .register(
                "/__thaler/1a2b3c4d-2",
                Handler::server(|_| async {
                    explode()?;
                    Ok::<_, HandlerError>(Response::new(Body::empty()))
                }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_a_generic_failure() {
        let dispatcher = Dispatcher::new(panicking_registry());

        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![Value::from(1)], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            read_value(response).await,
            Value::error("Error", unhandled_error_message(FN_ID))
        );

        let raw = Request::post("/__thaler/1a2b3c4d-2").body(Body::empty()).unwrap();
        let response = dispatcher.handle_request(raw).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = read_text(response).await;
        assert!(!text.contains("boom secret"));
        assert_eq!(text, unhandled_error_message("/__thaler/1a2b3c4d-2"));

        // The dispatcher keeps serving after a panic.
        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_handler_panic_message_is_forwarded_in_development() {
        let dispatcher = Dispatcher::new(panicking_registry()).with_mode(RuntimeMode::Development);

        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_value(response).await, Value::error("Error", "boom secret"));

        let failure = dispatcher
            .invoke_local(FN_ID, vec![], Value::Null)
            .await
            .unwrap_err();
        assert_eq!(failure.into_value(), Value::error("Error", "boom secret"));
        assert!(try_scope().is_none());
    }

    #[tokio::test]
    async fn test_handlers_can_set_status_and_headers() {
        let mut registry = Registry::new();
        registry
            .register(
                FN_ID,
                Handler::function(|_, ctx| async move {
                    ctx.set_status(StatusCode::CREATED);
                    ctx.set_header(HeaderName::from_static("x-trace"), HeaderValue::from_static("abc"));
                    Ok::<_, HandlerError>(Value::Null)
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let response = dispatcher
            .handle_request(fn_request(FN_ID, ProtocolKind::Fn, vec![], Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-trace").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_get_handler_receives_sorted_query() {
        let mut registry = Registry::new();
        registry
            .register(
                "/__thaler/1a2b3c4d-3",
                Handler::get(|query, ctx| async move {
                    assert_eq!(ctx.kind, ProtocolKind::Get);
                    let names: Vec<String> = query.keys().cloned().collect();
                    Ok::<_, HandlerError>(Response::new(Body::from(names.join(","))))
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let request = Request::get("/__thaler/1a2b3c4d-3?b=2&a=1").body(Body::empty()).unwrap();
        let response = dispatcher.handle_request(request).await.unwrap();
        assert_eq!(read_text(response).await, "a,b");
    }

    #[tokio::test]
    async fn test_action_reads_multipart_form() {
        let mut registry = Registry::new();
        registry
            .register(
                "/__thaler/1a2b3c4d-4",
                Handler::action(|form, _| async move {
                    let title = form
                        .get("title")
                        .and_then(OneOrMany::first)
                        .and_then(FormValue::as_text)
                        .unwrap_or_default()
                        .to_string();
                    Ok::<_, HandlerError>(Value::from(title))
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        let mut form = FormData::new();
        form.insert("title".to_string(), OneOrMany::from(FormValue::from("hello")));
        let (content_type, body) = encode_multipart(&form);
        let mut request = Request::post("/__thaler/1a2b3c4d-4").body(Body::from(body)).unwrap();
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
        ProtocolHeaders::new(ProtocolKind::Action, Some("3".to_string()), "/__thaler/1a2b3c4d-4")
            .apply(request.headers_mut());

        let response = dispatcher.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_value(response).await, Value::from("hello"));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_refs() {
        let mut registry = Registry::new();
        registry.register(FN_ID, adder()).unwrap();
        assert_eq!(
            registry.register(FN_ID, adder()).unwrap_err(),
            RegistryError::Duplicate(FN_ID.to_string())
        );
        assert_eq!(
            registry.register_kind(ProtocolKind::Ref, PURE_ID, adder()).unwrap_err(),
            RegistryError::NotRegistrable(ProtocolKind::Ref)
        );
        assert_eq!(
            registry.register_kind(ProtocolKind::Pure, PURE_ID, adder()).unwrap_err(),
            RegistryError::KindMismatch {
                expected: ProtocolKind::Pure,
                found: ProtocolKind::Fn
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_absolute_ids_are_served_by_path() {
        let mut registry = Registry::new();
        registry
            .register("https://api.example.com/__thaler/ff-0", adder())
            .unwrap();
        assert!(registry.get("/__thaler/ff-0").is_some());
        assert!(registry.lookup("https://api.example.com/__thaler/ff-0").is_some());
        assert_eq!(
            registry.register("not a url", adder()).unwrap_err(),
            RegistryError::InvalidId("not a url".to_string())
        );
    }
}
