//! Edge dispatch outcomes: 404s, timeouts, late responses, channel loss,
//! and the apex endpoints.

use std::time::Duration;

use tunl_e2e::{MockHttpService, TestClient, TestServer, TestServerOptions};

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunl=debug,tunl_server=debug,tunl_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn unknown_subdomain_is_404_and_names_it() {
    init_test();

    let server = TestServer::start().await;
    let http = reqwest::Client::new();
    let resp = http
        .get(server.edge_url("/"))
        .header("Host", server.host_for("nosuch"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("nosuch"));
}

#[tokio::test]
async fn slow_tunnel_times_out_with_504_and_late_response_is_dropped() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        dispatch_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let mock = MockHttpService::start().await;
    mock.set_response_delay(Duration::from_millis(900));
    mock.set_response_body(b"too late".to_vec());

    let client = TestClient::connect(&server, mock.port(), Some("slowpoke"), None)
        .await
        .expect("failed to establish tunnel");

    let http = reqwest::Client::new();
    let resp = http
        .get(server.edge_url("/slow"))
        .header("Host", server.host_for(&client.subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);

    // Let the late response arrive at the server; it must be dropped
    // without disturbing the session.
    tokio::time::sleep(Duration::from_millis(800)).await;

    // The tunnel still works for a fresh request.
    mock.set_response_delay(Duration::from_millis(0));
    let resp = http
        .get(server.edge_url("/fast"))
        .header("Host", server.host_for(&client.subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The timeout produced a request log with an empty response.
    let logs = server.events.requests();
    let timed_out = logs.iter().find(|l| l.path == "/slow").unwrap();
    assert_eq!(timed_out.status, 504);
    assert_eq!(timed_out.response_bytes, 0);
}

#[tokio::test]
async fn in_flight_requests_resolve_502_when_the_channel_drops() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_delay(Duration::from_millis(800));

    let client = TestClient::connect(&server, mock.port(), Some("flaky"), None)
        .await
        .expect("failed to establish tunnel");

    let http = reqwest::Client::new();
    let pending = {
        let url = server.edge_url("/hang");
        let host = server.host_for(&client.subdomain);
        let http = http.clone();
        tokio::spawn(async move { http.get(url).header("Host", host).send().await })
    };

    // Kill the control channel while the request is in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.shutdown();

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status(), 502);

    // Nothing pending leaks: the registry entry is gone too.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.registry.lookup("flaky").is_none());
}

#[tokio::test]
async fn apex_serves_landing_and_stats() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    let _client = TestClient::connect(&server, mock.port(), Some("counted"), None)
        .await
        .expect("failed to establish tunnel");

    let http = reqwest::Client::new();

    let landing = http
        .get(server.edge_url("/"))
        .header("Host", &server.base_domain)
        .send()
        .await
        .unwrap();
    assert_eq!(landing.status(), 200);

    let stats = http
        .get(server.edge_url("/api/stats"))
        .header("Host", &server.base_domain)
        .send()
        .await
        .unwrap();
    assert_eq!(stats.status(), 200);

    let body: serde_json::Value = stats.json().await.unwrap();
    assert_eq!(body["activeTunnels"], 1);
    assert!(body["timestamp"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn request_logs_capture_success_metadata() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"logged".to_vec());

    let client = TestClient::connect(&server, mock.port(), Some("audited"), None)
        .await
        .expect("failed to establish tunnel");

    let http = reqwest::Client::new();
    http.post(server.edge_url("/things"))
        .header("Host", server.host_for(&client.subdomain))
        .header("User-Agent", "e2e-suite")
        .body("0123456789")
        .send()
        .await
        .unwrap();

    // The sink is fire-and-forget; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let logs = server.events.requests();
    let log = logs.iter().find(|l| l.path == "/things").unwrap();
    assert_eq!(log.subdomain, "audited");
    assert_eq!(log.method, "POST");
    assert_eq!(log.status, 200);
    assert_eq!(log.request_bytes, 10);
    assert_eq!(log.response_bytes, 6);
    assert_eq!(log.user_agent.as_deref(), Some("e2e-suite"));
}
