use bytes::Bytes;
use capture_core::{
    capture_channel, CaptureConfig, CaptureError, CaptureEvent, CaptureLayer, NetworkCollector,
    NetworkRule, RuleAction, RuleEngine, RuleSet, TransactionStatus, UrlPattern,
};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::{service_fn, BoxError, Layer, ServiceExt};

fn layer(rules: Vec<NetworkRule>) -> (CaptureLayer, NetworkCollector) {
    let collector = NetworkCollector::new(100);
    let layer = CaptureLayer::new(collector.clone(), RuleEngine::default(), RuleSet::new(rules));
    (layer, collector)
}

fn post(url: &str, body: &'static str) -> Request<Bytes> {
    Request::post(url)
        .header("content-type", "text/plain")
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap()
}

/// Upstream that echoes the request body and reports the headers it saw
async fn echo(request: Request<Bytes>) -> Result<Response<Bytes>, Infallible> {
    let seen = request
        .headers()
        .get("x-injected")
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .unwrap_or_default();
    let mut response = Response::new(request.into_body());
    response
        .headers_mut()
        .insert("x-seen", seen.parse().unwrap());
    Ok(response)
}

#[tokio::test]
async fn test_records_completed_transaction() {
    let (layer, collector) = layer(vec![]);
    let service = layer.layer(service_fn(echo));

    let response = service
        .oneshot(post("https://api.example.com/echo", "hello"))
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"hello"));

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.len(), 1);
    let tx = &snapshot[0];
    assert_eq!(tx.status(), TransactionStatus::Complete);
    assert_eq!(tx.request().body.as_deref(), Some("hello"));
    assert_eq!(tx.request().content_type.as_deref(), Some("text/plain"));
    assert_eq!(tx.response().unwrap().status_code, 200);
    assert_eq!(tx.response().unwrap().body.as_deref(), Some("hello"));
    assert!(tx.duration_ms().unwrap() >= 0);
}

#[tokio::test]
async fn test_blocked_request_never_reaches_upstream() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let rule = NetworkRule::new(
        "block-admin",
        "Block admin",
        RuleAction::Block {
            reason: "admin is off limits".into(),
        },
    )
    .with_url(UrlPattern::Regex("/admin".into()));

    let (layer, collector) = layer(vec![rule]);
    let service = layer.layer(service_fn(move |request: Request<Bytes>| {
        counted.fetch_add(1, Ordering::SeqCst);
        echo(request)
    }));

    let err = service
        .oneshot(post("https://example.com/admin/users", ""))
        .await
        .unwrap_err();
    let capture_err = err.downcast_ref::<CaptureError>().unwrap();
    assert!(capture_err.is_blocked());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.status(), TransactionStatus::Failed);
    assert_eq!(tx.error(), Some("blocked: admin is off limits"));
    assert_eq!(layer.metrics().snapshot().rules.blocked, 1);
}

#[tokio::test]
async fn test_mock_response_short_circuits() {
    let rule = NetworkRule::new(
        "mock",
        "Mock teapot",
        RuleAction::MockResponse {
            status_code: 418,
            status_message: None,
            headers: Default::default(),
            body: Some("short and stout".into()),
            content_type: Some("text/plain".into()),
        },
    )
    .with_method("GET");

    let (layer, collector) = layer(vec![rule]);
    let service = layer.layer(service_fn(|_request: Request<Bytes>| async {
        Err::<Response<Bytes>, BoxError>("upstream must not be called".into())
    }));

    let request = Request::get("https://example.com/pot").body(Bytes::new()).unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.body(), &Bytes::from_static(b"short and stout"));

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.status(), TransactionStatus::Complete);
    assert_eq!(tx.response().unwrap().status_code, 418);
}

#[tokio::test]
async fn test_modified_request_is_sent_and_recorded() {
    let rules = vec![
        NetworkRule::new(
            "inject",
            "Inject header",
            RuleAction::SetHeaders {
                set: vec![("X-Injected", "yes")].into_iter().collect(),
                remove: vec![],
            },
        )
        .with_url(UrlPattern::Prefix("https://api.".into())),
    ];

    let (layer, collector) = layer(rules);
    let service = layer.layer(service_fn(echo));

    let response = service
        .oneshot(post("https://api.example.com/submit", "data"))
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-seen").unwrap(), "yes");

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.request().headers.get("x-injected"), Some("yes"));
    assert_eq!(layer.metrics().snapshot().rules.modified, 1);
}

#[tokio::test]
async fn test_body_rewrite_reaches_upstream() {
    let rules = vec![NetworkRule::new(
        "rewrite",
        "Rewrite user",
        RuleAction::RewriteBody {
            find: "alice".into(),
            replace: "bob".into(),
        },
    )
    .with_body_pattern("alice")];

    let (layer, _collector) = layer(rules);
    let service = layer.layer(service_fn(echo));

    let response = service
        .oneshot(post("https://example.com/login", "user=alice"))
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"user=bob"));
}

#[tokio::test]
async fn test_upstream_error_marks_failed() {
    let (layer, collector) = layer(vec![]);
    let service = layer.layer(service_fn(|_request: Request<Bytes>| async {
        Err::<Response<Bytes>, BoxError>("connection refused".into())
    }));

    let err = service
        .oneshot(post("https://down.example.com/", ""))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "connection refused");

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.status(), TransactionStatus::Failed);
    assert_eq!(tx.error(), Some("connection refused"));
}

#[tokio::test]
async fn test_dropped_call_fails_once_as_cancelled() {
    let (tx, mut rx) = capture_channel();
    let collector = NetworkCollector::new(10).with_event_sender(tx);
    let layer = CaptureLayer::new(collector.clone(), RuleEngine::default(), RuleSet::default());

    let service = layer.layer(service_fn(|request: Request<Bytes>| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        echo(request).await
    }));

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        service.oneshot(post("https://slow.example.com/", "")),
    )
    .await;
    assert!(result.is_err());

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.status(), TransactionStatus::Failed);
    assert_eq!(tx.error(), Some("cancelled"));

    let mut terminal = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, CaptureEvent::Completed { .. } | CaptureEvent::Failed { .. }) {
            terminal += 1;
        }
    }
    assert_eq!(terminal, 1);
    assert_eq!(layer.metrics().snapshot().cancelled, 1);
}

#[tokio::test]
async fn test_delay_rule_holds_request() {
    let rules = vec![NetworkRule::new("slow", "Slow", RuleAction::Delay { millis: 40 })
        .with_url(UrlPattern::Exact("https://example.com/slow".into()))];
    let (layer, collector) = layer(rules);
    let service = layer.layer(service_fn(echo));

    let started = Instant::now();
    service
        .oneshot(post("https://example.com/slow", "x"))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(collector.snapshot()[0].status(), TransactionStatus::Complete);
    assert_eq!(layer.metrics().snapshot().rules.delayed, 1);
}

#[tokio::test]
async fn test_ignored_hosts_pass_through() {
    let config = CaptureConfig {
        ignore_hosts: vec!["*.ignored.test".to_string()],
        ..Default::default()
    };
    let (layer, collector) = layer(vec![NetworkRule::new(
        "block-all",
        "Block everything",
        RuleAction::Block { reason: "no".into() },
    )]);
    let layer = layer.with_config(config);
    let service = layer.layer(service_fn(echo));

    let response = service
        .oneshot(post("http://api.ignored.test/ping", "pong"))
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"pong"));
    assert!(collector.is_empty());
    assert_eq!(layer.metrics().snapshot().total_requests, 0);
}

#[tokio::test]
async fn test_large_bodies_truncated_in_record() {
    let config = CaptureConfig {
        max_body_bytes: 4,
        ..Default::default()
    };
    let (layer, collector) = layer(vec![]);
    let service = layer.with_config(config).layer(service_fn(echo));

    let response = service
        .oneshot(post("https://example.com/big", "0123456789"))
        .await
        .unwrap();
    assert_eq!(response.body().len(), 10);

    let tx = collector.snapshot()[0].clone();
    assert_eq!(tx.request().body.as_deref(), Some("0123"));
    assert_eq!(tx.request().body_size, 10);
    assert_eq!(tx.response().unwrap().body.as_deref(), Some("0123"));
    assert_eq!(tx.response().unwrap().body_size, 10);
}

#[tokio::test]
async fn test_strict_persistence_waits_for_acknowledgement() {
    let (tx, mut rx) = capture_channel();
    let collector = NetworkCollector::new(10).with_event_sender(tx);
    let layer = CaptureLayer::new(collector, RuleEngine::default(), RuleSet::default())
        .with_config(CaptureConfig {
            strict_persistence: true,
            ..Default::default()
        });

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                CaptureEvent::Flush(ack) => {
                    let _ = ack.send(());
                }
                _ => {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    });

    layer
        .layer(service_fn(echo))
        .oneshot(post("https://example.com/", "x"))
        .await
        .unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}
