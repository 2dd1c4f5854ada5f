pub mod settings;

pub use settings::{AppSettings, HpbSettings, Settings, StorageSettings, TlsSettings};
