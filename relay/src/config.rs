use std::env;

/// Process configuration, read once at startup from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub webrtc: WebRTCConfig,
    pub video: VideoConfig,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct WebRTCConfig {
    pub ice_server_urls: Vec<String>,
    pub ice_server_username: String,
    pub ice_server_credential: String,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub rtsp_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            signaling: SignalingConfig {
                host: get_env("SIGNALING_SERVER_HOST", "localhost"),
                port: get_env_as("SIGNALING_SERVER_PORT", 8080),
            },
            webrtc: WebRTCConfig {
                ice_server_urls: parse_list(&get_env(
                    "ICE_SERVER_URLS",
                    "stun:stun.l.google.com:19302",
                )),
                ice_server_username: get_env("ICE_SERVER_USERNAME", ""),
                ice_server_credential: get_env("ICE_SERVER_CREDENTIAL", ""),
            },
            video: VideoConfig {
                width: get_env_as("VIDEO_WIDTH", 1280),
                height: get_env_as("VIDEO_HEIGHT", 720),
                fps: get_env_as("VIDEO_FPS", 30),
                rtsp_url: env::var("RTSP_URL").ok().filter(|url| !url.is_empty()),
            },
            allowed_origins: parse_list(&get_env(
                "ALLOWED_ORIGINS",
                "http://localhost:5173,http://localhost:3000",
            )),
        }
    }

    /// WebSocket URL of the signaling broker, as dialed by the publisher.
    pub fn signaling_url(&self) -> String {
        format!("ws://{}:{}/ws", self.signaling.host, self.signaling.port)
    }

    /// Bind address for the broker's HTTP server.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.signaling.host, self.signaling.port)
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_owned(),
    }
}

fn get_env_as<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let parsed = parse_list("stun:a.example.com:3478, turn:b.example.com:3478 ,");
        assert_eq!(
            parsed,
            vec![
                "stun:a.example.com:3478".to_owned(),
                "turn:b.example.com:3478".to_owned()
            ]
        );
    }

    #[test]
    fn test_parse_list_empty() {
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ,").is_empty());
    }

    #[test]
    fn test_get_env_as_fallback() {
        // Unset and malformed values both fall back to the default.
        std::env::remove_var("CAMRELAY_TEST_PORT");
        assert_eq!(get_env_as::<u16>("CAMRELAY_TEST_PORT", 8080), 8080);
        std::env::set_var("CAMRELAY_TEST_PORT", "not-a-number");
        assert_eq!(get_env_as::<u16>("CAMRELAY_TEST_PORT", 8080), 8080);
        std::env::set_var("CAMRELAY_TEST_PORT", "9000");
        assert_eq!(get_env_as::<u16>("CAMRELAY_TEST_PORT", 8080), 9000);
        std::env::remove_var("CAMRELAY_TEST_PORT");
    }
}
