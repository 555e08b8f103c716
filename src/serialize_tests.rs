#[cfg(test)]
mod tests {
    use crate::body::Body;
    use crate::error::DecodeError;
    use crate::framing::encode_chunk;
    use crate::serialize::{decode_all, decode_stream, serialize_body, serialize_stream, References, Serializer};
    use crate::value::{Deferred, Value};
    use bytes::Bytes;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    async fn round_trip(value: Value) -> Value {
        let bytes = serialize_body(value).collect().await.unwrap();
        decode_all(&bytes, Arc::new(References::new())).unwrap()
    }

    #[tokio::test]
    async fn test_plain_values_survive() {
        let value = Value::object([
            ("name", Value::string("thaler")),
            ("count", Value::from(3)),
            ("ratio", Value::Number(f64::NAN)),
            ("limit", Value::Number(f64::NEG_INFINITY)),
            ("big", Value::BigInt("-12345678901234567890".to_string())),
            ("missing", Value::Undefined),
            ("nothing", Value::Null),
            ("flags", Value::from(vec![Value::from(true), Value::from(false)])),
            ("failure", Value::error("TypeError", "bad input")),
        ]);
        assert_eq!(round_trip(value.clone()).await, value);
    }

    #[test]
    fn test_node_tags() {
        let mut serializer = Serializer::new();
        assert_eq!(serializer.encode(&Value::Undefined).to_string(), r#"{"t":"u"}"#);
        assert_eq!(serializer.encode(&Value::from("x")).to_string(), r#""x""#);
        assert_eq!(
            serializer.encode(&Value::object([("a", Value::from(1))])).to_string(),
            r#"{"t":"o","v":[["a",1.0]]}"#
        );
    }

    #[test]
    fn test_deferred_ids_stay_unique_after_handles_drop() {
        let mut serializer = Serializer::new();
        let first = Deferred::resolved(Value::from(0));
        let id = serializer.encode(&first.clone().into())["i"].clone();
        assert_eq!(serializer.encode(&first.clone().into())["i"], id);
        drop(serializer.take_pending());
        drop(first);

        let mut seen = vec![id];
        for n in 1..64 {
            let next = Deferred::resolved(Value::from(n));
            let id = serializer.encode(&next.into())["i"].clone();
            assert!(!seen.contains(&id), "id {} reused", id);
            seen.push(id);
            drop(serializer.take_pending());
        }
    }

    #[tokio::test]
    async fn test_shared_nodes_keep_identity() {
        let shared = Value::shared(Value::object([("n", Value::from(1))]));
        let decoded = round_trip(Value::from(vec![shared.clone(), shared])).await;

        let items = decoded.as_array().unwrap();
        match (&items[0], &items[1]) {
            (Value::Shared(a), Value::Shared(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("expected shared nodes, got {:?}", other),
        }
        assert_eq!(items[0].get("n"), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn test_byte_at_a_time_body_matches_whole_decode() {
        let shared = Value::shared(Value::object([("label", Value::string("δεύτερο €𝄞"))]));
        let value = Value::object([
            ("first", shared.clone()),
            ("again", Value::from(vec![shared])),
            ("text", Value::string("日本語 ünïcødé")),
        ]);
        let data: Vec<u8> = serialize_stream(value.clone())
            .collect::<Vec<Bytes>>()
            .await
            .concat();
        let whole = decode_all(&data, Arc::new(References::new())).unwrap();

        let fragments: Vec<Result<Bytes, std::io::Error>> = data
            .iter()
            .map(|byte| Ok(Bytes::copy_from_slice(&[*byte])))
            .collect();
        let body = Body::from_stream(futures::stream::iter(fragments).boxed());
        let decoded = decode_stream(body, Arc::new(References::new())).await.unwrap();

        assert_eq!(decoded, whole);
        assert_eq!(decoded, value);
        let again = decoded.get("again").and_then(Value::as_array).unwrap();
        match (decoded.get("first"), &again[0]) {
            (Some(Value::Shared(a)), Value::Shared(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("expected shared nodes, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_shared_reference() {
        let chunk = encode_chunk(br#"{"t":"r","i":4}"#);
        let error = decode_all(&chunk, Arc::new(References::new())).unwrap_err();
        assert_eq!(error, DecodeError::DanglingShared(4));
    }

    #[tokio::test]
    async fn test_deferred_values_settle_after_the_root() {
        let value = Value::object([
            ("now", Value::from(1)),
            ("later", Deferred::resolved(Value::from(42)).into()),
            ("broken", Deferred::rejected(Value::error("Error", "nope")).into()),
        ]);
        let chunks: Vec<_> = serialize_stream(value).collect().await;
        assert_eq!(chunks.len(), 3);

        let body: Vec<u8> = chunks.concat();
        let decoded = decode_all(&body, Arc::new(References::new())).unwrap();
        let Some(Value::Deferred(later)) = decoded.get("later") else {
            panic!("expected a deferred value");
        };
        assert_eq!(later.settle().await, Ok(Value::from(42)));
        let Some(Value::Deferred(broken)) = decoded.get("broken") else {
            panic!("expected a deferred value");
        };
        assert_eq!(broken.settle().await, Err(Value::error("Error", "nope")));
    }

    #[tokio::test]
    async fn test_stream_returns_root_before_deferred_settles() {
        let (sender, receiver) = oneshot::channel::<Value>();
        let pending = Deferred::new(async move { receiver.await.map_err(|_| Value::Null) });
        let value = Value::object([("result", pending.into())]);
        let body = Body::from_stream(
            serialize_stream(value)
                .map(Ok::<_, std::io::Error>)
                .boxed(),
        );

        let root = decode_stream(body, Arc::new(References::new())).await.unwrap();
        let Some(Value::Deferred(result)) = root.get("result") else {
            panic!("expected a deferred value");
        };
        sender.send(Value::string("done")).unwrap();
        assert_eq!(result.settle().await, Ok(Value::string("done")));
    }

    #[tokio::test]
    async fn test_nested_deferred_values() {
        let inner = Deferred::resolved(Value::from(2));
        let outer = Deferred::resolved(Value::object([("inner", inner.into())]));
        let decoded = round_trip(Value::from(vec![outer.into()])).await;

        let Value::Deferred(outer) = &decoded.as_array().unwrap()[0] else {
            panic!("expected a deferred value");
        };
        let settled = outer.settle().await.unwrap();
        let Some(Value::Deferred(inner)) = settled.get("inner") else {
            panic!("expected a nested deferred value");
        };
        assert_eq!(inner.settle().await, Ok(Value::from(2)));
    }

    #[tokio::test]
    async fn test_stable_references_resolve_by_id() {
        let server = Arc::new(References::new());
        let reference = server.create("/__thaler/abc-0", Value::from("config"));
        let bytes = serialize_body(Value::from(vec![reference])).collect().await.unwrap();

        let client = Arc::new(References::new());
        assert_eq!(
            decode_all(&bytes, client).unwrap_err(),
            DecodeError::UnknownReference("/__thaler/abc-0".to_string())
        );

        let decoded = decode_all(&bytes, server.clone()).unwrap();
        match &decoded.as_array().unwrap()[0] {
            Value::Reference(reference) => {
                assert_eq!(reference.id, "/__thaler/abc-0");
                assert_eq!(reference.value, Value::from("config"));
            }
            other => panic!("expected a reference, got {:?}", other),
        }
        assert_eq!(server.len(), 1);
    }

    #[test]
    fn test_unknown_tag() {
        let chunk = encode_chunk(br#"{"t":"?"}"#);
        let error = decode_all(&chunk, Arc::new(References::new())).unwrap_err();
        assert_eq!(error, DecodeError::UnknownTag("?".to_string()));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let error = decode_stream(Body::empty(), Arc::new(References::new()))
            .await
            .unwrap_err();
        assert_eq!(error, DecodeError::Empty);
    }
}
