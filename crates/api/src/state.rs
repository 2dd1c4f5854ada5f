use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use callscribe_config::Settings;
use callscribe_platform::PlatformClient;
use callscribe_services::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub platform: PlatformClient,
    pub registry: Arc<RoomRegistry>,
    /// Whether the host platform has enabled the app.
    pub enabled: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(settings: Settings, platform: PlatformClient, registry: Arc<RoomRegistry>) -> Self {
        Self {
            settings,
            platform,
            registry,
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }
}
