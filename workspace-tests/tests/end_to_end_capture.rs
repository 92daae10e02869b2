use bytes::Bytes;
use capture_core::{
    CaptureError, NetworkRule, OutcomeKind, RuleAction, TransactionStatus, UrlPattern,
};
use hyper::{Request, Response};
use inspector::{Inspector, InspectorConfig, TransactionStore};
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::{service_fn, Layer, ServiceExt};

// Helper to find a free port
async fn get_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn upstream(request: Request<Bytes>) -> Result<Response<Bytes>, Infallible> {
    let body = format!("{} {}", request.method(), request.uri().path());
    Ok(Response::new(Bytes::from(body)))
}

fn get(url: &str) -> Request<Bytes> {
    Request::get(url).body(Bytes::new()).unwrap()
}

#[tokio::test]
async fn test_captured_traffic_is_persisted() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("capture.db");
    let config = InspectorConfig {
        database_url: format!("sqlite://{}", db_path.display()),
        ..Default::default()
    };

    let inspector = Inspector::start(config).await.expect("Failed to start inspector");
    inspector
        .rules()
        .save(
            NetworkRule::new(
                "no-tracking",
                "Block tracker",
                RuleAction::Block {
                    reason: "tracker".into(),
                },
            )
            .with_url(UrlPattern::Wildcard("https://tracker.*".into())),
        )
        .await
        .unwrap();

    let service = inspector.capture_layer().layer(service_fn(upstream));

    let response = service
        .clone()
        .oneshot(get("https://api.example.com/users"))
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"GET /users"));

    let blocked = service
        .clone()
        .oneshot(get("https://tracker.example.net/pixel"))
        .await
        .unwrap_err();
    assert!(blocked
        .downcast_ref::<CaptureError>()
        .map(CaptureError::is_blocked)
        .unwrap_or(false));

    inspector.flush().await;

    // Persisted rows are visible without the live window
    assert_eq!(inspector.store().count().await.unwrap(), 2);

    let all = inspector.repository().all().await.unwrap();
    assert_eq!(all.len(), 2);
    let failed = inspector
        .repository()
        .by_status(TransactionStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error().unwrap().contains("tracker"));

    let history = inspector.repository().rule_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, OutcomeKind::Blocked);
    assert_eq!(history[0].transaction_id, failed[0].id());

    let metrics = inspector.metrics().snapshot();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.rules.blocked, 1);
    assert_eq!(metrics.persistence_failures, 0);

    drop(service);
    inspector.shutdown().await;

    // Everything survives a restart
    let reopened = TransactionStore::open(&db_path).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), 2);
    assert_eq!(reopened.list_rules().await.unwrap().len(), 1);
    assert_eq!(reopened.recent_rule_applications(10).await.unwrap().len(), 1);
    reopened.close().await;
}

#[tokio::test]
async fn test_rest_api_over_http() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = get_free_port().await;
    let store = TransactionStore::in_memory().await.unwrap();
    let config = InspectorConfig {
        http_port: port,
        ..Default::default()
    };
    let inspector = Inspector::with_store(config, store).await.unwrap();

    let service = inspector.capture_layer().layer(service_fn(upstream));
    service
        .oneshot(get("https://api.example.com/orders"))
        .await
        .unwrap();
    inspector.flush().await;

    let shutdown = inspector.shutdown_token();
    let server = async { inspector.serve().await };
    let client = async {
        let base = format!("http://127.0.0.1:{}", port);
        let http = reqwest::Client::new();

        // Give the listener a moment to bind
        let mut health = None;
        for _ in 0..50 {
            match http.get(format!("{}/health", base)).send().await {
                Ok(response) => {
                    health = Some(response);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let health = health.expect("API never came up");
        assert!(health.status().is_success());

        let listing: serde_json::Value = http
            .get(format!("{}/api/transactions?search=orders", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["total_count"], 1);
        assert_eq!(listing["transactions"][0]["status"], "COMPLETE");

        shutdown.cancel();
    };

    let (served, ()) = tokio::join!(server, client);
    served.expect("server shuts down cleanly");

    inspector.shutdown().await;
}
