use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use switchboard::config::HostConfig;
use switchboard::dispatcher::{DispatchOutcome, handler_fn};
use switchboard::docs::ApiDocs;
use switchboard::envelope::{HttpMethod, HttpRequest};
use switchboard::error::HostError;
use switchboard::extension::native::NativeFactory;
use switchboard::extension::{ExtensionState, FailureStage, NativeModule};
use switchboard::host::Host;
use switchboard::router::WebRouter;
use switchboard::scheduler::JobScheduler;

const ROOT: &str = "/virtual/switchboard";

async fn host() -> Arc<Host> {
    Host::bootstrap(HostConfig::new(ROOT)).await.unwrap()
}

fn plugin(path: &str) -> std::path::PathBuf {
    std::path::Path::new(ROOT).join("plugins").join(path)
}

fn get(path: &str) -> HttpRequest {
    HttpRequest::new(HttpMethod::Get, path)
}

/// One GET route answering with a fixed body.
fn route(path: &'static str, body: serde_json::Value) -> NativeFactory {
    Arc::new(move || {
        let body = body.clone();
        NativeModule::new(&["http"], move |caps| {
            let body = body.clone();
            caps.http()?.get(path, handler_fn(move |_| {
                let body = body.clone();
                async move { Ok(body) }
            }))?;
            Ok(())
        })
        .into_handle()
    })
}

#[tokio::test]
async fn status_extension_answers_until_unloaded() {
    let host = host().await;
    let loaded = host
        .lifecycle()
        .load_native(plugin("core/status"), route("/status", json!({ "ok": true })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.unique_name, "status");
    assert_eq!(loaded.state, ExtensionState::PostRegistered);

    let outcome = host.handle(get("/status")).await;
    assert!(!outcome.is_no_handler());
    assert_eq!(outcome.response(), Some(&json!({ "ok": true })));

    assert!(host.lifecycle().unregister("status").await);
    assert!(host.handle(get("/status")).await.is_no_handler());
    host.shutdown().await;
}

#[tokio::test]
async fn dispatch_picks_the_route_that_matches() {
    let host = host().await;
    host.lifecycle().load_native(plugin("core/a"), route("/a", json!("a"))).await.unwrap();
    host.lifecycle().load_native(plugin("core/b"), route("/b", json!("b"))).await.unwrap();

    for _ in 0..3 {
        assert_eq!(host.handle(get("/a")).await.response(), Some(&json!("a")));
        assert_eq!(host.handle(get("/b")).await.response(), Some(&json!("b")));
    }
    host.shutdown().await;
}

#[tokio::test]
async fn sibling_prefixes_are_isolated() {
    let host = host().await;
    host.lifecycle().load_native(plugin("x/foo"), route("/foo", json!("foo"))).await.unwrap();
    host.lifecycle().load_native(plugin("x/foobar"), route("/foobar", json!("foobar"))).await.unwrap();

    assert!(host.lifecycle().unregister("foo").await);
    assert!(host.handle(get("/foo")).await.is_no_handler());
    assert_eq!(host.handle(get("/foobar")).await.response(), Some(&json!("foobar")));
    assert_eq!(host.lifecycle().extensions().len(), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let host = host().await;
    host.lifecycle().load_native(plugin("core/once"), route("/once", json!(1))).await.unwrap();
    let before = host.dispatcher().len();

    assert!(host.lifecycle().unregister("once").await);
    let after = host.dispatcher().len();
    assert_eq!(after, before - 1);
    assert!(!host.lifecycle().unregister("once").await);
    assert_eq!(host.dispatcher().len(), after);
    host.shutdown().await;
}

#[tokio::test]
async fn reload_replaces_registrations_in_place() {
    let host = host().await;
    let generation = Arc::new(AtomicUsize::new(0));
    let counter = generation.clone();
    let factory: NativeFactory = Arc::new(move || {
        let version = counter.fetch_add(1, Ordering::SeqCst) + 1;
        NativeModule::new(&["http", "schedule"], move |caps| {
            caps.http()?.get("/version", handler_fn(move |_| async move { Ok(json!(version)) }))?;
            caps.schedule()?.every(3600, "sync", handler_fn(|_| async { Ok(json!(null)) }))?;
            Ok(())
        })
        .display_name("Versioned")
        .into_handle()
    });
    host.lifecycle().load_native(plugin("core/first"), route("/first", json!(0))).await.unwrap();
    host.lifecycle().load_native(plugin("core/versioned"), factory).await.unwrap();
    let listeners = host.dispatcher().len();
    let routes = host.router().routes().len();
    assert_eq!(host.handle(get("/version")).await.response(), Some(&json!(1)));

    let reloaded = host.lifecycle().reload("versioned").await.unwrap();
    assert_eq!(reloaded.unique_name, "versioned");
    assert_eq!(host.handle(get("/version")).await.response(), Some(&json!(2)));
    assert_eq!(host.dispatcher().len(), listeners);
    assert_eq!(host.router().routes().len(), routes);
    assert_eq!(host.scheduler().jobs().len(), 1);

    let names: Vec<String> = host.lifecycle().extensions().into_iter().map(|e| e.unique_name).collect();
    assert_eq!(names, vec!["first", "versioned"]);
    assert!(matches!(host.lifecycle().reload("missing").await, Err(HostError::UnknownExtension(_))));
    host.shutdown().await;
}

#[tokio::test]
async fn reload_moves_a_route_to_its_new_path() {
    let host = host().await;
    let generation = Arc::new(AtomicUsize::new(0));
    let counter = generation.clone();
    let factory: NativeFactory = Arc::new(move || {
        let path = if counter.fetch_add(1, Ordering::SeqCst) == 0 { "/old" } else { "/new" };
        NativeModule::new(&["http"], move |caps| {
            caps.http()?.get(path, handler_fn(move |_| async move { Ok(json!(path)) }))?;
            Ok(())
        })
        .into_handle()
    });
    host.lifecycle().load_native(plugin("core/moving"), factory).await.unwrap();
    assert_eq!(host.handle(get("/old")).await.response(), Some(&json!("/old")));
    let records = host.dispatcher().len();
    let routes = host.router().routes().len();

    host.lifecycle().reload("moving").await.unwrap();
    assert_eq!(generation.load(Ordering::SeqCst), 2);
    assert!(host.handle(get("/old")).await.is_no_handler());
    assert_eq!(host.handle(get("/new")).await.response(), Some(&json!("/new")));
    assert_eq!(host.dispatcher().len(), records);
    assert_eq!(host.router().routes().len(), routes);
    assert!(host.router().routes().iter().all(|r| r.spec.path != "/old"));
    host.shutdown().await;
}

#[tokio::test]
async fn unregister_restores_every_collaborator() {
    let host = host().await;
    let registrations = host.dispatcher().registrations();
    let routes = host.router().routes();
    let namespaces = host.router().namespaces();
    let jobs = host.scheduler().jobs();
    let tags = host.docs().tags();
    let job_ids = host.jobs().ids();

    let factory: NativeFactory = Arc::new(|| {
        NativeModule::new(&["http", "schedule", "message"], |caps| {
            caps.http()?.get("/everything", handler_fn(|_| async { Ok(json!("everything")) }))?;
            caps.schedule()?.every(3600, "sweep", handler_fn(|_| async { Ok(json!(null)) }))?;
            caps.message()?.on("ping", handler_fn(|_| async { Ok(json!("pong")) }))?;
            Ok(())
        })
        .display_name("Everything")
        .into_handle()
    });
    host.lifecycle().load_native(plugin("core/everything"), factory).await.unwrap();
    assert_eq!(host.dispatcher().len(), registrations.len() + 3);
    assert_eq!(host.scheduler().jobs().len(), jobs.len() + 1);
    assert_ne!(host.router().routes(), routes);

    assert!(host.lifecycle().unregister("everything").await);
    assert_eq!(host.dispatcher().registrations(), registrations);
    assert_eq!(host.router().routes(), routes);
    assert_eq!(host.router().namespaces(), namespaces);
    assert_eq!(host.scheduler().jobs(), jobs);
    assert_eq!(host.docs().tags(), tags);
    assert_eq!(host.jobs().ids(), job_ids);
    host.shutdown().await;
}

#[tokio::test]
async fn route_conflict_rolls_back_the_second_extension() {
    let host = host().await;
    host.lifecycle().load_native(plugin("core/owner"), route("/shared", json!("owner"))).await.unwrap();

    let intruder: NativeFactory = Arc::new(|| {
        NativeModule::new(&["http"], |caps| {
            let http = caps.http()?;
            http.get("/intruder", handler_fn(|_| async { Ok(json!("intruder")) }))?;
            http.get("/shared", handler_fn(|_| async { Ok(json!("intruder")) }))?;
            Ok(())
        })
        .into_handle()
    });
    let err = host.lifecycle().load_native(plugin("core/intruder"), intruder).await.unwrap_err();
    assert!(matches!(err, HostError::Registration { .. }));

    assert!(host.handle(get("/intruder")).await.is_no_handler());
    assert_eq!(host.handle(get("/shared")).await.response(), Some(&json!("owner")));
    let failed = host.lifecycle().failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "intruder");
    assert_eq!(failed[0].stage, FailureStage::Register);
    host.shutdown().await;
}

#[tokio::test]
async fn failing_handler_maps_to_handler_failed() {
    let host = host().await;
    let broken: NativeFactory = Arc::new(|| {
        NativeModule::new(&["http"], |caps| {
            caps.http()?.get("/boom", handler_fn(|_| async { anyhow::bail!("boom") }))?;
            Ok(())
        })
        .into_handle()
    });
    host.lifecycle().load_native(plugin("core/boom"), broken).await.unwrap();
    match host.handle(get("/boom")).await {
        DispatchOutcome::HandlerFailed { error, .. } => assert!(error.contains("boom")),
        other => panic!("unexpected outcome {other:?}"),
    }
    host.shutdown().await;
}

#[tokio::test]
async fn shutdown_clears_every_collaborator() {
    let host = host().await;
    host.lifecycle().load_native(plugin("core/one"), route("/one", json!(1))).await.unwrap();
    host.lifecycle().load_native(plugin("core/two"), route("/two", json!(2))).await.unwrap();
    host.shutdown().await;

    assert!(host.lifecycle().extensions().is_empty());
    assert!(host.handle(get("/one")).await.is_no_handler());
    // Only the host's own routes stay.
    assert!(host.router().routes().iter().all(|r| !r.spec.include_in_docs));
}
