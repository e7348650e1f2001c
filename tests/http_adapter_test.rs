use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use channel_api::ChannelMessage;
use channel_api::mock::MockTransport;
use serde_json::{Value, json};
use switchboard::adapter::{HttpState, router};
use switchboard::config::HostConfig;
use switchboard::dispatcher::handler_fn;
use switchboard::extension::NativeModule;
use switchboard::extension::native::NativeFactory;
use switchboard::host::{EXTENSIONS_PATH, Host};
use tower::ServiceExt;

const ROOT: &str = "/virtual/adapter";

async fn host_with(extensions: Vec<(&str, NativeFactory)>) -> Arc<Host> {
    let host = Host::bootstrap(HostConfig::new(ROOT)).await.unwrap();
    for (name, factory) in extensions {
        let path = std::path::Path::new(ROOT).join("plugins/core").join(name);
        host.lifecycle().load_native(path, factory).await.unwrap();
    }
    host
}

fn app(host: &Host) -> axum::Router {
    router(HttpState { dispatcher: host.dispatcher().clone(), signer: host.signer().clone() })
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn web() -> NativeFactory {
    Arc::new(|| {
        NativeModule::new(&["http"], |caps| {
            let http = caps.http()?;
            http.get("/hello/{name}", handler_fn(|e| async move {
                Ok(json!({ "hello": e.context.path_param("name") }))
            }))?;
            http.post("/created", handler_fn(|e| async move {
                let body = e.payload.as_request().map(|r| r.body.clone());
                e.context.respond_with_status(201, json!({}));
                Ok(json!({ "received": body }))
            }))?;
            http.get("/boom", handler_fn(|_| async { anyhow::bail!("exploded") }))?;
            Ok(())
        })
        .display_name("Web")
        .into_handle()
    })
}

#[tokio::test]
async fn requests_map_to_status_codes() {
    let host = host_with(vec![("web", web())]).await;

    let (status, body) = send(app(&host), get("/hello/ada")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "hello": "ada" }));

    let created = Request::builder()
        .method("POST")
        .uri("/created")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"n":1}"#))
        .unwrap();
    let (status, body) = send(app(&host), created).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "received": { "n": 1 } }));

    let (status, body) = send(app(&host), get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "detail": "Not Found" }));

    let (status, body) = send(app(&host), get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "detail": "Internal Server Error" }));
    host.shutdown().await;
}

#[tokio::test]
async fn undecodable_bodies_become_empty_objects() {
    let host = host_with(vec![("web", web())]).await;
    let request = Request::builder().method("POST").uri("/created").body(Body::from("not json")).unwrap();
    let (status, body) = send(app(&host), request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "received": {} }));
    host.shutdown().await;
}

#[tokio::test]
async fn host_routes_list_extensions() {
    let host = host_with(vec![("web", web())]).await;
    let (status, body) = send(app(&host), get(EXTENSIONS_PATH)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["extensions"][0]["display_name"], "Web");
    assert_eq!(body["extensions"][0]["kind"], "native");
    assert!(body["capabilities"].as_array().unwrap().contains(&json!("schedule")));
    host.shutdown().await;
}

fn chatty(reply: Option<&'static str>) -> NativeFactory {
    Arc::new(move || {
        NativeModule::new(&["message"], move |caps| {
            caps.message()?.on("ping", handler_fn(move |e| async move {
                match reply {
                    Some(text) => {
                        e.context.respond(json!({ "text": text }));
                        Ok(json!(null))
                    }
                    None => anyhow::bail!("cannot reply"),
                }
            }))?;
            Ok(())
        })
        .into_handle()
    })
}

#[tokio::test]
async fn channel_messages_fan_out_past_failures() {
    let host = host_with(vec![("broken", chatty(None)), ("echo", chatty(Some("pong")))]).await;
    let mock = Arc::new(MockTransport::new());
    host.start_channel(mock.clone());

    let message = ChannelMessage::new("room", "ping", json!({ "text": "ping" }));
    mock.inject(message.clone()).await;
    mock.inject(ChannelMessage::new("room", "ignored", json!({}))).await;

    for _ in 0..100 {
        if mock.acknowledged().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let sent = mock.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, json!({ "text": "pong" }));
    assert_eq!(sent[0].in_reply_to.as_deref(), Some(message.id.as_str()));
    assert_eq!(mock.acknowledged().await.len(), 2);

    host.shutdown().await;
    assert!(!mock.is_started());
}
