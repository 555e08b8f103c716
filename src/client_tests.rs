#[cfg(test)]
mod tests {
    use crate::api::ProtocolKind;
    use crate::body::Body;
    use crate::client::{Client, LocalTransport, RequestInit, Stub};
    use crate::context::scope;
    use crate::dispatch::{Dispatcher, RuntimeMode};
    use crate::error::{ClientError, HandlerError};
    use crate::protocol::{FormData, FormValue, OneOrMany, QueryParams};
    use crate::registry::{Handler, Registry};
    use crate::value::{Deferred, Value};
    use http::header::HeaderValue;
    use http::{Request, Response, StatusCode};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const ADD: &str = "/__thaler/9f00aa11-0";
    const ECHO: &str = "/__thaler/9f00aa11-1";
    const LOAD: &str = "/__thaler/9f00aa11-2";
    const SAVE: &str = "/__thaler/9f00aa11-3";
    const WHOAMI: &str = "/__thaler/9f00aa11-4";
    const SLOW: &str = "/__thaler/9f00aa11-5";
    const BROKEN: &str = "/__thaler/9f00aa11-6";
    const PANICKY: &str = "/__thaler/9f00aa11-7";

    fn explode(x: Value) -> Result<Value, HandlerError> {
        panic!("boom secret {:?}", x)
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ADD,
                Handler::function(|x: Value, _| async move {
                    let captured = scope();
                    let base = captured.first().and_then(Value::as_f64).unwrap_or(0.0);
                    Ok::<_, HandlerError>(Value::from(x.as_f64().unwrap_or(0.0) + base))
                }),
            )
            .unwrap();
        registry
            .register(
                ECHO,
                Handler::pure(|value: Value, _| async move {
                    Ok::<_, HandlerError>(Value::from(vec![value, Value::from(scope().len() as i32)]))
                }),
            )
            .unwrap();
        registry
            .register(
                LOAD,
                Handler::loader(|query, ctx| async move {
                    let page = query
                        .get("page")
                        .and_then(OneOrMany::first)
                        .cloned()
                        .unwrap_or_default();
                    Ok::<_, HandlerError>(Value::object([
                        ("page", Value::from(page)),
                        ("method", Value::from(ctx.request.method.as_str())),
                    ]))
                }),
            )
            .unwrap();
        registry
            .register(
                SAVE,
                Handler::action(|form, _| async move {
                    let size = match form.get("file").and_then(OneOrMany::first) {
                        Some(FormValue::File { bytes, .. }) => bytes.len() as i32,
                        _ => -1,
                    };
                    Ok::<_, HandlerError>(Value::from(size))
                }),
            )
            .unwrap();
        registry
            .register(
                WHOAMI,
                Handler::get(|_, ctx| async move {
                    let user = ctx
                        .request
                        .headers
                        .get("x-user")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string();
                    Ok::<_, HandlerError>(Response::new(Body::from(user)))
                }),
            )
            .unwrap();
        registry
            .register(
                SLOW,
                Handler::function(|_, _| async {
                    let later = Deferred::new(async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, Value>(Value::from("finally"))
                    });
                    Ok::<_, HandlerError>(Value::object([("now", Value::from(1)), ("later", later.into())]))
                }),
            )
            .unwrap();
        registry
            .register(
                BROKEN,
                Handler::function(|_, _| async { Err::<Value, _>(HandlerError::new("kaput")) }),
            )
            .unwrap();
        registry
            .register(PANICKY, Handler::function(|x: Value, _| async move { explode(x) }))
            .unwrap();
        registry
    }

    fn client(mode: RuntimeMode) -> Arc<Client> {
        let dispatcher = Dispatcher::new(registry()).with_mode(mode);
        Arc::new(Client::new(LocalTransport::new(dispatcher)))
    }

    #[tokio::test]
    async fn test_fn_stub_sends_its_captured_scope() {
        let client = client(RuntimeMode::Production);
        let add = client
            .stub(ProtocolKind::Fn, ADD)
            .unwrap()
            .into_function()
            .unwrap()
            .with_scope(vec![Value::from(41)]);
        assert_eq!(add.call(1).await.unwrap(), Value::from(42));
        assert_eq!(add.call(2).await.unwrap(), Value::from(43));
    }

    #[tokio::test]
    async fn test_pure_stub_never_sends_a_scope() {
        let client = client(RuntimeMode::Production);
        let echo = client
            .stub(ProtocolKind::Pure, ECHO)
            .unwrap()
            .into_function()
            .unwrap()
            .with_scope(vec![Value::from(1), Value::from(2)]);
        assert_eq!(
            echo.call("hi").await.unwrap(),
            Value::from(vec![Value::from("hi"), Value::from(0)])
        );
    }

    #[tokio::test]
    async fn test_loader_stub_round_trip() {
        let client = client(RuntimeMode::Production);
        let Stub::Loader(load) = client.stub(ProtocolKind::Loader, LOAD).unwrap() else {
            panic!("expected a loader stub");
        };
        let mut query = QueryParams::new();
        query.insert("page".to_string(), OneOrMany::from("3".to_string()));
        let value = load.call(&query, RequestInit::default()).await.unwrap();
        assert_eq!(value.get("page"), Some(&Value::from("3")));
        assert_eq!(value.get("method"), Some(&Value::from("GET")));
    }

    #[tokio::test]
    async fn test_action_stub_uploads_files() {
        let client = client(RuntimeMode::Production);
        let Stub::Action(save) = client.stub(ProtocolKind::Action, SAVE).unwrap() else {
            panic!("expected an action stub");
        };
        let mut form = FormData::new();
        form.insert(
            "file".to_string(),
            OneOrMany::from(FormValue::File {
                name: Some("a.bin".to_string()),
                content_type: None,
                bytes: bytes::Bytes::from_static(&[0, 1, 2, 3, 4]),
            }),
        );
        assert_eq!(save.call(&form, RequestInit::default()).await.unwrap(), Value::from(5));
    }

    #[tokio::test]
    async fn test_interceptors_run_before_the_transport() {
        let dispatcher = Dispatcher::new(registry());
        let client = Arc::new(Client::new(LocalTransport::new(dispatcher)).with_interceptor(
            |mut request: Request<Body>| {
                request
                    .headers_mut()
                    .insert("x-user", HeaderValue::from_static("ada"));
                Ok::<_, ClientError>(request)
            },
        ));
        let Stub::Get(whoami) = client.stub(ProtocolKind::Get, WHOAMI).unwrap() else {
            panic!("expected a get stub");
        };
        let response = whoami.send(&QueryParams::new(), RequestInit::default()).await.unwrap();
        let body = response.into_body().collect().await.unwrap();
        assert_eq!(&body[..], b"ada");
    }

    #[tokio::test]
    async fn test_interceptor_can_abort() {
        let dispatcher = Dispatcher::new(registry());
        let client = Arc::new(Client::new(LocalTransport::new(dispatcher)).with_interceptor(
            |_: Request<Body>| Err::<Request<Body>, _>(ClientError::Interceptor("offline".to_string())),
        ));
        let add = client.stub(ProtocolKind::Fn, ADD).unwrap().into_function().unwrap();
        assert!(matches!(add.call(1).await, Err(ClientError::Interceptor(_))));
    }

    #[tokio::test]
    async fn test_deferred_results_settle_after_the_call_returns() {
        let client = client(RuntimeMode::Production);
        let slow = client.stub(ProtocolKind::Fn, SLOW).unwrap().into_function().unwrap();
        let value = slow.call(Value::Null).await.unwrap();
        assert_eq!(value.get("now"), Some(&Value::from(1)));
        let Some(Value::Deferred(later)) = value.get("later") else {
            panic!("expected a deferred value");
        };
        assert_eq!(later.settle().await, Ok(Value::from("finally")));
    }

    #[tokio::test]
    async fn test_remote_errors_surface_per_mode() {
        let production = client(RuntimeMode::Production);
        let broken = production.stub(ProtocolKind::Fn, BROKEN).unwrap().into_function().unwrap();
        match broken.call(Value::Null).await {
            Err(ClientError::Remote { id, error }) => {
                assert_eq!(id, BROKEN);
                assert_eq!(
                    error,
                    Value::error("Error", crate::dispatch::unhandled_error_message(BROKEN))
                );
            }
            other => panic!("expected a remote error, got {:?}", other),
        }

        let development = client(RuntimeMode::Development);
        let broken = development.stub(ProtocolKind::Fn, BROKEN).unwrap().into_function().unwrap();
        match broken.call(Value::Null).await {
            Err(ClientError::Remote { error, .. }) => assert_eq!(error, Value::error("Error", "kaput")),
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_reaches_the_caller_as_a_remote_error() {
        let production = client(RuntimeMode::Production);
        let panicky = production.stub(ProtocolKind::Fn, PANICKY).unwrap().into_function().unwrap();
        match panicky.call(1).await {
            Err(ClientError::Remote { id, error }) => {
                assert_eq!(id, PANICKY);
                assert_eq!(
                    error,
                    Value::error("Error", crate::dispatch::unhandled_error_message(PANICKY))
                );
            }
            other => panic!("expected a remote error, got {:?}", other),
        }

        let development = client(RuntimeMode::Development);
        let panicky = development.stub(ProtocolKind::Fn, PANICKY).unwrap().into_function().unwrap();
        match panicky.call(1).await {
            Err(ClientError::Remote { error, .. }) => {
                assert_eq!(error, Value::error("Error", "boom secret 1"));
            }
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_function_reports_status() {
        let client = client(RuntimeMode::Production);
        let missing = client
            .stub(ProtocolKind::Pure, "/__thaler/00000000-9")
            .unwrap()
            .into_function()
            .unwrap();
        match missing.call(Value::Null).await {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("expected a status error, got {:?}", other),
        }
    }

    #[test]
    fn test_ref_has_no_stub() {
        let client = client(RuntimeMode::Production);
        assert!(matches!(
            client.stub(ProtocolKind::Ref, "/__thaler/00000000-0"),
            Err(ClientError::Unsupported(ProtocolKind::Ref))
        ));
        let loader = client.stub(ProtocolKind::Loader, LOAD).unwrap();
        assert_eq!(loader.kind(), ProtocolKind::Loader);
        assert!(matches!(
            loader.into_function(),
            Err(ClientError::Unsupported(ProtocolKind::Loader))
        ));
    }
}
