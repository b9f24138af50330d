use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::config::WebRTCConfig;

/// Public STUN servers appended for redundancy when only one server is
/// configured.
const FALLBACK_STUN_SERVERS: [&str; 3] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
];

/// Builds the peer-connection configuration shared by every viewer
/// connection. TURN credentials, when present, are applied to every
/// configured server.
pub fn rtc_configuration(config: &WebRTCConfig) -> RTCConfiguration {
    let mut ice_servers: Vec<RTCIceServer> = Vec::new();

    for url in &config.ice_server_urls {
        let mut server = RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        };
        if !config.ice_server_username.is_empty() {
            server.username = config.ice_server_username.clone();
            server.credential = config.ice_server_credential.clone();
        }
        ice_servers.push(server);
    }

    if ice_servers.len() <= 1 {
        tracing::info!("single ICE server configured, appending public STUN fallbacks");
        for url in FALLBACK_STUN_SERVERS {
            ice_servers.push(RTCIceServer {
                urls: vec![url.to_owned()],
                ..Default::default()
            });
        }
    }

    tracing::info!("configured {} ICE server(s)", ice_servers.len());

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
