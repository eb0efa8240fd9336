// Compiled-in connection settings (bring-up sample)
// Dummy values only; real credentials belong in the persisted store. The
// `builtin-credentials` feature makes the config loader prefer these, and
// the loader warns loudly on every load while that bypass is active.

use crate::config::ConnectionConfig;

pub const BUILTIN_LINK_NAME: &str = "DUMMY_WIFI_SSID";
pub const BUILTIN_LINK_SECRET: &str = "DUMMY_WIFI_PASSWORD";
pub const BUILTIN_BROKER_HOST: &str = "127.0.0.1";
pub const BUILTIN_BROKER_USER: &str = "DUMMY_MQTT_USER";
pub const BUILTIN_BROKER_SECRET: &str = "DUMMY_MQTT_PASSWORD";
pub const BUILTIN_BROKER_PORT: u16 = 1883;
pub const BUILTIN_BROKER_USE_TLS: bool = false;

pub fn builtin_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        link_name: BUILTIN_LINK_NAME.into(),
        link_secret: BUILTIN_LINK_SECRET.into(),
        broker_host: BUILTIN_BROKER_HOST.into(),
        broker_user: BUILTIN_BROKER_USER.into(),
        broker_secret: BUILTIN_BROKER_SECRET.into(),
        broker_port: BUILTIN_BROKER_PORT,
        broker_use_tls: BUILTIN_BROKER_USE_TLS,
    }
}
