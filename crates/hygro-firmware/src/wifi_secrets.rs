//! Credentials baked in by the build script from `.env`

pub const WIFI_SSID: &str = env!("WIFI_SSID");
pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");
pub const WIFI_HOSTNAME: Option<&str> = option_env!("WIFI_HOSTNAME");

/// Fetched periodically once the network is ready
pub const HTTP_PROBE_URL: &str = env!("HTTP_PROBE_URL");
