//! End-to-end tests: real listeners, real TLS handshakes, real rotation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use authgate::auth::session::SessionManager;
use authgate::config::{Config, ProviderKind, SessionConfig};
use authgate::server::{BoundAddrs, Server};
use authgate::tls::{TLS_CA_FILE, TLS_CERT_FILE, TLS_KEY_FILE};
use authgate::tlsgen;

const SECRET: &str = "integration-test-secret";

fn base_config() -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = 0;
    config.metrics.bind = "127.0.0.1".to_string();
    config.metrics.port = 0;
    config.auth.provider = ProviderKind::Seamless;
    config.session = SessionConfig {
        secret: Some(SECRET.to_string()),
        cookie_insecure: true,
        ..SessionConfig::default()
    };
    config
}

struct RunningServer {
    server: Arc<Server>,
    token: CancellationToken,
    task: JoinHandle<authgate::Result<()>>,
    addrs: BoundAddrs,
}

async fn spawn_server(config: Config) -> RunningServer {
    let server = Arc::new(Server::new(Arc::new(config)).expect("server construction"));
    let token = CancellationToken::new();
    let task = {
        let server = Arc::clone(&server);
        let token = token.clone();
        tokio::spawn(async move { server.run(token).await })
    };
    let addrs = tokio::time::timeout(Duration::from_secs(10), server.serving_addrs())
        .await
        .expect("server should start serving");
    RunningServer {
        server,
        token,
        task,
        addrs,
    }
}

impl RunningServer {
    fn app_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addrs.app.unwrap())
    }

    fn app_https_url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.addrs.app.unwrap().port())
    }

    async fn stop(self) {
        self.token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("run should return promptly after cancellation")
            .expect("run task should not panic");
        result.expect("run should return Ok on clean shutdown");
        assert!(self.server.bound_addrs().app.is_none());
    }
}

fn session_cookie_header(sub: &str) -> String {
    let sessions = SessionManager::from_config(&SessionConfig {
        secret: Some(SECRET.to_string()),
        cookie_insecure: true,
        ..SessionConfig::default()
    });
    let session = sessions.issue(sub.to_string(), Some("u@example.com".to_string()), "seamless");
    let value = sessions.encode(&session).unwrap();
    format!("{}={value}", sessions.cookie_name())
}

/// Write a CA plus a server pair for it into `dir` using the gateway's
/// directory layout.
fn write_tls_dir(dir: &std::path::Path) -> tlsgen::GeneratedCert {
    let ca = tlsgen::generate_ca("Integration CA").unwrap();
    rotate_server_cert(dir, &ca);
    std::fs::write(dir.join(TLS_CA_FILE), &ca.cert_pem).unwrap();
    ca
}

fn rotate_server_cert(dir: &std::path::Path, ca: &tlsgen::GeneratedCert) {
    let server = tlsgen::generate_server_cert(ca, &["localhost".to_string()]).unwrap();
    std::fs::write(dir.join(TLS_CERT_FILE), &server.cert_pem).unwrap();
    std::fs::write(dir.join(TLS_KEY_FILE), &server.key_pem).unwrap();
}

fn https_client(ca_pem: &str, identity_pem: Option<&str>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap());
    if let Some(pem) = identity_pem {
        builder = builder.identity(reqwest::Identity::from_pem(pem.as_bytes()).unwrap());
    }
    builder.build().unwrap()
}

// ---------------------------------------------------------------------------
// Cleartext mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleartext_server_answers_plain_http11() {
    let running = spawn_server(base_config()).await;

    let response = reqwest::get(running.app_url("/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    running.stop().await;
}

#[tokio::test]
async fn verify_endpoint_denies_without_session_and_allows_with_one() {
    let running = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    // No cookie: deny.
    let response = client
        .get(running.app_url("/api/verify"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Valid cookie: allow, identity headers set for the proxy.
    let response = client
        .get(running.app_url("/api/verify"))
        .header("cookie", session_cookie_header("user-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-forwarded-user"], "user-1");
    assert_eq!(response.headers()["x-forwarded-email"], "u@example.com");

    // Tampered cookie: deny.
    let response = client
        .get(running.app_url("/api/verify"))
        .header("cookie", format!("{}zz", session_cookie_header("user-1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    running.stop().await;
}

#[tokio::test]
async fn seamless_root_establishes_session_from_trusted_headers() {
    let running = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    // No trusted identity: deny.
    let response = client.get(running.app_url("/")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // Trusted headers: allow, session cookie minted.
    let response = client
        .get(running.app_url("/"))
        .header("x-forwarded-user", "jdoe")
        .header("x-forwarded-email", "jdoe@example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-forwarded-user"], "jdoe");
    let set_cookie = response.headers()["set-cookie"].to_str().unwrap();
    assert!(set_cookie.starts_with("__authgate_session="));

    // The minted cookie satisfies the verify endpoint.
    let cookie = set_cookie.split(';').next().unwrap().to_string();
    let response = client
        .get(running.app_url("/api/verify"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    running.stop().await;
}

#[tokio::test]
async fn profile_and_logout_round_trip() {
    let running = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(running.app_url("/profile"))
        .header("cookie", session_cookie_header("user-9"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["sub"], "user-9");
    assert_eq!(body["provider"], "seamless");

    let response = client
        .get(running.app_url("/logout"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cleared = response.headers()["set-cookie"].to_str().unwrap();
    assert!(cleared.contains("Max-Age=0"));

    running.stop().await;
}

// ---------------------------------------------------------------------------
// OAuth2 flow (redirect side; the IdP exchange needs a live endpoint)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oauth2_root_redirects_to_identity_provider_with_state() {
    let mut config = base_config();
    config.auth.provider = ProviderKind::OAuth2;
    config.auth.oauth2.client_id = "gateway".to_string();
    config.auth.oauth2.client_secret = "s3cret".to_string();
    config.auth.oauth2.authorization_endpoint = "https://idp.example.com/authorize".to_string();
    config.auth.oauth2.token_endpoint = "https://idp.example.com/token".to_string();
    config.auth.oauth2.userinfo_endpoint = "https://idp.example.com/userinfo".to_string();

    let running = spawn_server(config).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client
        .get(running.app_url("/"))
        .header("x-forwarded-proto", "https")
        .header("x-forwarded-host", "app.example.com")
        .header("x-forwarded-uri", "/dashboard")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 307);
    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.starts_with("https://idp.example.com/authorize?"));
    assert!(location.contains("client_id=gateway"));
    assert!(location.contains("state="));
    assert!(location.contains(
        "redirect_uri=https%3A%2F%2Fapp.example.com%2Foauth2%2Fcallback"
    ));

    let state_cookie = response.headers()["set-cookie"].to_str().unwrap();
    assert!(state_cookie.starts_with("__authgate_state="));

    // A callback with a forged state is rejected.
    let response = client
        .get(running.app_url("/oauth2/callback?code=abc&state=forged"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    running.stop().await;
}

// ---------------------------------------------------------------------------
// Metrics listener
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_listener_serves_healthz_and_scrapes() {
    let mut config = base_config();
    config.metrics.enabled = true;

    let running = spawn_server(config).await;
    let metrics_addr = running.addrs.metrics.expect("metrics listener bound");
    let client = reqwest::Client::new();

    // Drive a counter so the scrape has content.
    let _ = client
        .get(running.app_url("/api/verify"))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!("http://{metrics_addr}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("http://{metrics_addr}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("authgate_verify_total"));

    // The metrics routes are absent from the app listener.
    let response = client
        .get(running.app_url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    running.stop().await;
}

// ---------------------------------------------------------------------------
// TLS and rotation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn https_serves_and_survives_certificate_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let ca = write_tls_dir(dir.path());

    let mut config = base_config();
    config.tls.path = Some(dir.path().to_path_buf());
    let running = spawn_server(config).await;

    let client = https_client(&ca.cert_pem, None);
    let response = client
        .get(running.app_https_url("/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Rotate the pair on disk and wait past the debounce window.
    rotate_server_cert(dir.path(), &ca);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // New connections keep succeeding - rotation never drops service.
    let client = https_client(&ca.cert_pem, None);
    let response = client
        .get(running.app_https_url("/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    running.stop().await;
}

#[tokio::test]
async fn mutual_tls_is_verify_if_given() {
    let dir = tempfile::tempdir().unwrap();
    let ca = write_tls_dir(dir.path());

    let mut config = base_config();
    config.tls.path = Some(dir.path().to_path_buf());
    config.tls.client_auth = true;
    let running = spawn_server(config).await;

    // No client certificate: the handshake still completes.
    let client = https_client(&ca.cert_pem, None);
    let response = client
        .get(running.app_https_url("/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // But the sensitive root route refuses without one.
    let response = client
        .get(running.app_https_url("/"))
        .header("x-forwarded-user", "jdoe")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // With a CA-signed client certificate the root route proceeds.
    let client_cert = tlsgen::generate_client_cert(&ca, "edge-proxy").unwrap();
    let identity_pem = format!("{}{}", client_cert.key_pem, client_cert.cert_pem);
    let client = https_client(&ca.cert_pem, Some(&identity_pem));
    let response = client
        .get(running.app_https_url("/"))
        .header("x-forwarded-user", "jdoe")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // A certificate from a foreign CA fails verification outright.
    let foreign_ca = tlsgen::generate_ca("Foreign CA").unwrap();
    let foreign_cert = tlsgen::generate_client_cert(&foreign_ca, "intruder").unwrap();
    let identity_pem = format!("{}{}", foreign_cert.key_pem, foreign_cert.cert_pem);
    let client = https_client(&ca.cert_pem, Some(&identity_pem));
    let result = client.get(running.app_https_url("/healthz")).send().await;
    assert!(result.is_err(), "foreign client cert must fail the handshake");

    running.stop().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_shuts_the_server_down_within_bounds() {
    let running = spawn_server(base_config()).await;
    let app_addr = running.addrs.app.unwrap();

    let started = std::time::Instant::now();
    running.stop().await;
    // The app drain budget is 5 s; an idle listener closes much faster,
    // and never slower.
    assert!(started.elapsed() < Duration::from_secs(6));

    // Ports are actually released once run has returned.
    assert!(std::net::TcpListener::bind(app_addr).is_ok());
}
