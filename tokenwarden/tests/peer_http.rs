//! `HttpPeer` against a local axum stand-in for the remote peer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use tokenwarden::config::Settings;
use tokenwarden::peer::{HttpPeer, PeerError, SessionCookies, TokenPeer, TokenSubmission};

#[derive(Default)]
struct Recorded {
    users: Vec<Value>,
    tokens: Vec<Value>,
    cache_headers: Vec<String>,
}

type Shared = Arc<Mutex<Recorded>>;

async fn needed_long(State(rec): State<Shared>, headers: HeaderMap) -> Json<Value> {
    if let Some(v) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        rec.lock().cache_headers.push(v.to_string());
    }
    Json(json!({"needed": true}))
}

async fn needed_short() -> StatusCode {
    StatusCode::BAD_GATEWAY
}

async fn user(State(rec): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    rec.lock().users.push(body);
    Json(json!({"name": "alice", "id": 12}))
}

async fn token(State(rec): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    rec.lock().tokens.push(body);
    StatusCode::NO_CONTENT
}

async fn spawn_peer() -> (SocketAddr, Shared) {
    let recorded = Shared::default();
    let app = Router::new()
        .route("/token-needed/long", get(needed_long))
        .route("/token-needed", get(needed_short))
        .route("/user", post(user))
        .route("/t", post(token))
        .with_state(recorded.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn settings_for(addr: SocketAddr) -> Settings {
    Settings {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..Settings::default()
    }
}

#[tokio::test]
async fn long_poll_reads_needed_flag() {
    let (addr, recorded) = spawn_peer().await;
    let peer = HttpPeer::new(&settings_for(addr));

    assert!(peer.token_needed_long().await.unwrap());
    assert_eq!(recorded.lock().cache_headers, vec!["no-store".to_string()]);
}

#[tokio::test]
async fn error_status_is_a_status_error() {
    let (addr, _) = spawn_peer().await;
    let peer = HttpPeer::new(&settings_for(addr));

    let err = peer.token_needed().await.unwrap_err();
    assert!(matches!(err, PeerError::Status(StatusCode::BAD_GATEWAY)));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn unreachable_peer_is_a_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let peer = HttpPeer::new(&settings_for(addr));
    let err = peer.token_needed().await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn session_bootstrap_posts_cookies() {
    let (addr, recorded) = spawn_peer().await;
    let peer = HttpPeer::new(&settings_for(addr));

    let info = peer
        .register_session(
            &SessionCookies {
                j: "jwt".to_string(),
                cf_clearance: Some("cf".to_string()),
            },
            Some(1_800_000_000.0),
        )
        .await
        .unwrap();
    assert_eq!(info.name, "alice");

    let recorded = recorded.lock();
    assert_eq!(
        recorded.users[0],
        json!({
            "cookies": {"j": "jwt", "cf_clearance": "cf"},
            "expirationDate": 1_800_000_000.0
        })
    );
}

#[tokio::test]
async fn token_submission_body() {
    let (addr, recorded) = spawn_peer().await;
    let peer = HttpPeer::new(&settings_for(addr));

    peer.submit_token(&TokenSubmission {
        t: "tok".to_string(),
        pawtect: Some("pw".to_string()),
        fp: None,
    })
    .await
    .unwrap();

    let recorded = recorded.lock();
    assert_eq!(recorded.tokens[0], json!({"t": "tok", "pawtect": "pw", "fp": null}));
}

#[tokio::test]
async fn settings_update_redirects_requests() {
    let (first, _) = spawn_peer().await;
    let (second, recorded) = spawn_peer().await;
    let peer = HttpPeer::new(&settings_for(first));

    peer.update_settings(&settings_for(second));
    peer.token_needed_long().await.unwrap();
    assert_eq!(recorded.lock().cache_headers.len(), 1);
}
