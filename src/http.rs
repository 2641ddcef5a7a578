use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared outbound client. Every remote call inherits these timeouts.
pub fn build_client(settings: HttpSettings) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_configured_timeouts() {
        let settings = HttpSettings {
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(200),
        };
        assert!(build_client(settings).is_ok());
        assert!(build_client(HttpSettings::default()).is_ok());
    }
}
