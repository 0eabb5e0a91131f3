//! Locally bound auth server over in-memory stores
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use auth::AppState;
use auth::invalidation::InvalidationListener;
use auth::jwt::{JwtConfig, TokenService};
use auth::models::{Role, User};
use auth::password::{Argon2Hasher, PasswordScheme};
use auth::presence::MemoryPresenceStore;
use auth::registry::ConnectionRegistry;
use auth::repositories::MemoryUserDirectory;
use auth::routes::{LoginResponse, create_router};
use auth::service::AuthService;
use auth::session::MemorySessionStore;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

pub const PASSWORD: &str = "letmein42";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub registry: ConnectionRegistry,
    pub store: MemorySessionStore,
    listener: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl TestServer {
    /// Serve the full router with `alice` (user) and `root_admin` (admin) provisioned
    pub async fn spawn() -> Self {
        let hasher = Argon2Hasher::new();
        let directory = MemoryUserDirectory::new();
        for (username, role) in [("alice", Role::User), ("root_admin", Role::Admin)] {
            directory.insert(User {
                id: Uuid::new_v4(),
                username: username.to_string(),
                password_hash: hasher.hash_password(PASSWORD).unwrap(),
                role,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }

        let store = MemorySessionStore::new();
        let registry = ConnectionRegistry::default();
        let auth = AuthService::new(
            TokenService::new(JwtConfig {
                secret: "http-test-secret".to_string(),
                issuer: "server".to_string(),
                access_token_expiry: 3600,
                session_token_expiry: 86400,
            }),
            Arc::new(store.clone()),
            Arc::new(directory),
            Arc::new(hasher),
        );
        let listener = InvalidationListener::new(Arc::new(store.clone()), registry.clone())
            .start()
            .await
            .unwrap();

        let state = AppState {
            auth,
            registry: registry.clone(),
            presence: Arc::new(MemoryPresenceStore::new()),
        };

        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(tcp, create_router(state)).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            registry,
            store,
            listener,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws_url(&self) -> String {
        format!("{}/ws/chat", self.base_url.replacen("http://", "ws://", 1))
    }

    pub async fn login(&self, username: &str) -> LoginResponse {
        self.login_with(username, PASSWORD).await
    }

    pub async fn login_with(&self, username: &str, password: &str) -> LoginResponse {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }

    pub async fn post_session_token(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&json!({ "session_token": token }))
            .send()
            .await
            .unwrap()
    }

    /// Open an authenticated realtime connection
    pub async fn connect_ws(&self, access_token: &str) -> WsClient {
        let mut request = self.ws_url().into_client_request().unwrap();
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {access_token}").parse().unwrap(),
        );
        let (stream, _) = connect_async(request).await.unwrap();
        stream
    }

    /// Wait until the registry holds exactly `count` connections
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.registry.connection_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {count} connections, registry has {}",
                self.registry.connection_count()
            )
        });
    }
}
