//! WebRTC API construction and peer connection configuration.

use crate::core::config::{IceServerConfig, ICE_CANDIDATE_POOL_SIZE};
use anyhow::Result;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub(crate) fn create_webrtc_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    // Data channels only; loopback candidates stay off outside tests.
    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(cfg!(test));

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

pub(crate) fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
        })
        .collect()
}

pub(crate) fn rtc_configuration(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        ice_candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_carry_credentials() {
        let servers = vec![
            IceServerConfig::stun("stun:stun.example.org:3478"),
            IceServerConfig {
                urls: vec!["turn:turn.example.org:3478".into()],
                username: "user".into(),
                credential: "pass".into(),
            },
        ];
        let cfg = rtc_configuration(&servers);
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.ice_servers[1].username, "user");
        assert_eq!(cfg.ice_candidate_pool_size, 10);
    }
}
