//! Environment-driven configuration, read once at startup in the teacher's
//! `std::env::var(..).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! style.

#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_host: String,
    pub tcp_port: u16,
    pub http_host: String,
    pub http_port: u16,
    pub device_sending_stale_seconds: u64,
    pub device_offline_timeout_seconds: u64,
    pub trip_auto_end_stale_seconds: u64,
    pub command_default_timeout_seconds: u64,
    pub force_southern_hemisphere: bool,
    pub database_url: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_host: "0.0.0.0".to_string(),
            tcp_port: 7018,
            http_host: "0.0.0.0".to_string(),
            http_port: 8000,
            device_sending_stale_seconds: 120,
            device_offline_timeout_seconds: 300,
            trip_auto_end_stale_seconds: 300,
            command_default_timeout_seconds: 10,
            force_southern_hemisphere: false,
            database_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tcp_host: std::env::var("TCP_HOST").unwrap_or(defaults.tcp_host),
            tcp_port: env_or("TCP_PORT", defaults.tcp_port),
            http_host: std::env::var("HTTP_HOST").unwrap_or(defaults.http_host),
            http_port: env_or("HTTP_PORT", defaults.http_port),
            device_sending_stale_seconds: env_or(
                "DEVICE_SENDING_STALE_SECONDS",
                defaults.device_sending_stale_seconds,
            ),
            device_offline_timeout_seconds: env_or(
                "DEVICE_OFFLINE_TIMEOUT_SECONDS",
                defaults.device_offline_timeout_seconds,
            ),
            trip_auto_end_stale_seconds: env_or(
                "TRIP_AUTO_END_STALE_SECONDS",
                defaults.trip_auto_end_stale_seconds,
            ),
            command_default_timeout_seconds: env_or(
                "COMMAND_DEFAULT_TIMEOUT_SECONDS",
                defaults.command_default_timeout_seconds,
            ),
            force_southern_hemisphere: env_or(
                "FORCE_SOUTHERN_HEMISPHERE",
                defaults.force_southern_hemisphere,
            ),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }

    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.tcp_host, self.tcp_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.tcp_port, 7018);
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.device_sending_stale_seconds, 120);
        assert_eq!(config.device_offline_timeout_seconds, 300);
        assert_eq!(config.trip_auto_end_stale_seconds, 300);
        assert_eq!(config.command_default_timeout_seconds, 10);
        assert!(!config.force_southern_hemisphere);
    }

    #[test]
    fn tcp_addr_combines_host_and_port() {
        let config = Config::default();
        assert_eq!(config.tcp_addr(), "0.0.0.0:7018");
    }
}
