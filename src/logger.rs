use crate::peer::types::IceCandidate;
use log::{debug, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::io::Write;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: OnceCell<()> = OnceCell::new();

/// Логирование с временными метками
///
/// Уровень по умолчанию зависит от `config`: в debug-сборке `debug`,
/// в release всё выключено, пока не задан `RUST_LOG`.
pub fn init() {
    INIT.get_or_init(|| {
        let default_level = if crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
        {
            LevelFilter::Debug
        } else {
            LevelFilter::Off
        };

        let mut builder = env_logger::Builder::new();
        builder.filter_level(default_level);
        // webrtc очень разговорчив на debug
        builder.filter_module("webrtc", LevelFilter::Warn);
        builder.filter_module("webrtc_ice", LevelFilter::Warn);
        builder.parse_default_env();
        builder.format(|buf, record| {
            let now = chrono::Local::now();
            writeln!(
                buf,
                "RUST: [{}] {:<5} {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        });
        // В тестах логгер может быть уже установлен
        let _ = builder.try_init();
    });
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
