mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_api_lists_active_reports() {
    let server = TestServer::start().await.expect("server starts");

    let response = server.get("/api/reports").await;
    assert_eq!(response.status(), 200);
    let reports: Vec<Value> = response.json().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["report_id"], "r1");
    assert_eq!(reports[0]["title"], "A");
    assert_eq!(reports[0]["author"], "Ana");
    assert_eq!(reports[0]["href"], "/?id=r1");

    server.metadata.set_offline(true);
    let response = server.get("/api/reports").await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "STORE_UNAVAILABLE");
    assert_eq!(body["error"]["path"], "/api/reports");

    server.shutdown().await;
}

#[tokio::test]
async fn test_api_render_returns_blocks() {
    let server = TestServer::start().await.expect("server starts");
    server.objects.put(
        "r1/main.js",
        r#"
        page.title(REPORT.title);
        page.json({ bucket: storage.bucket(), path: REPORT.storagePath });
        page.setPageConfig({ layout: "centered" });
        "#,
    );

    let response = server.get("/api/reports/r1/render").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["report_id"], "r1");
    assert_eq!(body["page"]["title"], "A");
    assert_eq!(body["page"]["layout"], "wide");
    assert_eq!(body["blocks"][0], serde_json::json!({ "type": "title", "text": "A" }));
    assert_eq!(body["blocks"][1]["value"]["bucket"], "reports");
    assert_eq!(body["blocks"][1]["value"]["path"], "r1/");

    server.shutdown().await;
}

#[tokio::test]
async fn test_api_render_errors_are_structured() {
    let server = TestServer::start().await.expect("server starts");

    let response = server.get("/api/reports/r1/render").await;
    assert_eq!(response.status(), 404);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("request id header");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SCRIPT_NOT_FOUND");
    assert_eq!(body["error"]["request_id"], request_id.as_str());

    let response = server.get("/api/reports/r2/render").await;
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "RECORD_NOT_FOUND");

    server
        .objects
        .put("r1/main.js", "function f() { throw new RangeError('too far'); } f();");
    let response = server.get("/api/reports/r1/render").await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SCRIPT_EXECUTION_FAILED");
    assert_eq!(body["error"]["context"]["kind"], "RangeError");
    // traces stay hidden unless debug traces are enabled
    assert!(body["error"]["context"].get("trace").is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_api_render_timeout() {
    let server = TestServer::start_with(common::fixture_items(), |config| {
        config.execution.timeout_ms = 200;
        config.execution.debug_traces = true;
    })
    .await
    .expect("server starts");
    server.objects.put("r1/main.js", "for (;;) {}");

    let response = server.get("/api/reports/r1/render").await;
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SCRIPT_TIMEOUT");
    assert!(server.staged_files().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_backends() {
    let server = TestServer::start().await.expect("server starts");

    let response = server.get("/health").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["git_sha"].is_string());
    assert!(body["timestamp"].is_string());
    assert_eq!(body["metadata"]["backend"], "memory");
    assert_eq!(body["metadata"]["reports"], 1);
    assert_eq!(body["storage"]["bucket"], "reports");

    server.metadata.set_offline(true);
    let response = server.get("/health").await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");

    server.shutdown().await;
}

#[tokio::test]
async fn test_stylesheet_and_unknown_routes() {
    let server = TestServer::start().await.expect("server starts");

    let css = server.get("/static/portal.css").await;
    assert_eq!(css.status(), 200);
    assert!(
        css.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/css")
    );

    let missing = server.get("/nowhere").await;
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    server.shutdown().await;
}
