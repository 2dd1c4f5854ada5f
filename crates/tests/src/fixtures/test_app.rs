use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use callscribe_api::state::AppState;
use callscribe_api::build_router;
use callscribe_config::{AppSettings, HpbSettings, Settings, StorageSettings, TlsSettings};
use callscribe_platform::auth::encode_auth;
use callscribe_platform::PlatformClient;
use callscribe_services::RoomRegistry;
use callscribe_transcription::ModelRegistry;

pub const TEST_APP_ID: &str = "callscribe";
pub const TEST_APP_SECRET: &str = "test-secret";

/// A running control-API server backed by a stub host platform.
pub struct TestApp {
    pub addr: SocketAddr,
    pub base_url: String,
    pub client: reqwest::Client,
    pub settings: Settings,
}

impl TestApp {
    /// Spawns the service with a platform stub that rejects every request.
    pub async fn spawn() -> Self {
        Self::spawn_with_platform(Router::new()).await
    }

    /// Spawns the service against the given stub platform router.
    pub async fn spawn_with_platform(platform_app: Router) -> Self {
        let platform_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind platform stub");
        let platform_addr = platform_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(platform_listener, platform_app).await.unwrap();
        });

        let settings = Settings {
            app: AppSettings {
                id: TEST_APP_ID.to_string(),
                secret: TEST_APP_SECRET.to_string(),
                version: "1.0.0".to_string(),
                port: 0,
                platform_url: format!("http://{platform_addr}"),
                shared_key: None,
            },
            hpb: HpbSettings {
                url: String::new(),
                internal_secret: String::new(),
            },
            storage: StorageSettings {
                persistent_dir: std::env::temp_dir()
                    .join("callscribe-tests")
                    .display()
                    .to_string(),
            },
            tls: TlsSettings {
                skip_cert_verify: false,
            },
        };

        let platform = PlatformClient::new(&settings).expect("platform client");
        let models = Arc::new(ModelRegistry::new(&settings.storage.persistent_dir));
        let registry = RoomRegistry::new(settings.clone(), platform.clone(), models);
        let state = AppState::new(settings.clone(), platform, registry);
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind api listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with valid app-gateway auth headers.
    pub fn auth_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("EX-APP-ID", TEST_APP_ID)
            .header("AUTHORIZATION-APP-API", encode_auth("admin", TEST_APP_SECRET))
    }

    /// POST with valid app-gateway auth headers.
    pub fn auth_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("EX-APP-ID", TEST_APP_ID)
            .header("AUTHORIZATION-APP-API", encode_auth("admin", TEST_APP_SECRET))
    }

    /// PUT with valid app-gateway auth headers.
    pub fn auth_put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .put(self.url(path))
            .header("EX-APP-ID", TEST_APP_ID)
            .header("AUTHORIZATION-APP-API", encode_auth("admin", TEST_APP_SECRET))
    }
}
