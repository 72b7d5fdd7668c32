use crate::config::DEFAULT_STUN_URLS;
use crate::error::TransportError;
use crate::peer::types::{IceCandidate, IceServerConfig};
use crate::utils::add_ice_url_scheme;
use log::{debug, warn};
use std::sync::Mutex;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::{configuration::RTCConfiguration, RTCPeerConnection};

/// Кандидаты, полученные до установки remote description
#[derive(Default)]
pub struct PendingCandidates {
    queue: Mutex<Vec<IceCandidate>>,
}

impl PendingCandidates {
    pub fn push(&self, candidate: IceCandidate) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(candidate);
        }
    }

    pub fn drain(&self) -> Vec<IceCandidate> {
        self.queue
            .lock()
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Применяет ICE кандидат от удаленной стороны; ошибка только логируется
pub async fn apply_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) -> bool {
    match pc.add_ice_candidate(candidate.clone().into()).await {
        Ok(_) => {
            debug!("Applied remote candidate: {}", candidate.candidate);
            true
        }
        Err(e) => {
            warn!(
                "Failed to add ICE candidate {:?}: {:?}",
                candidate.candidate, e
            );
            false
        }
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, pending: &PendingCandidates) {
    let candidates = pending.drain();
    if candidates.is_empty() {
        return;
    }
    debug!("Applying {} pending remote candidates", candidates.len());
    analyze_candidates(&candidates);
    for candidate in candidates {
        apply_candidate(pc, candidate).await;
    }
}

/// Проверка списка серверов: непустой URL, только STUN
pub fn validate_ice_servers(servers: &[IceServerConfig]) -> Result<(), TransportError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(TransportError::InvalidIceServer(format!(
                "server {} has an empty url",
                server.id
            )));
        }
        if server.r#type != "stun" || add_ice_url_scheme(server).starts_with("turn:") {
            return Err(TransportError::InvalidIceServer(format!(
                "server {} is not a STUN server",
                server.id
            )));
        }
    }
    Ok(())
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(custom_servers: Option<&[IceServerConfig]>) -> RTCConfiguration {
    let ice_servers = match custom_servers {
        Some(servers) => servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                ..Default::default()
            })
            .collect(),
        None => vec![RTCIceServer {
            urls: DEFAULT_STUN_URLS.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }],
    };

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut other_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else {
            other_count += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} other",
        host_count, srflx_count, other_count
    );
}
