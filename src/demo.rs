//! Локальный звонок: пациент начинает, команда заботы присоединяется, всё в одном процессе.

use crate::call::{CallOrchestrator, CallPhase};
use crate::config::{self, AdminCredentials, CallConfig};
use crate::error::CallError;
use crate::peer::media::{LocalStream, MediaDevices, MediaKind, SampleDevices};
use crate::peer::transport::WebRtcTransportFactory;
use crate::session::SessionContext;
use crate::store::{CallStore, MemoryStore};
use bytes::Bytes;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
// тишина Opus DTX
const SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const BLANK_VP8: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

pub async fn loopback(duration: Duration) -> Result<(), CallError> {
    let config = CallConfig::from_env();

    let store: Arc<dyn CallStore> = Arc::new(MemoryStore::new());
    let devices: Arc<dyn MediaDevices> = Arc::new(SampleDevices::default());
    let factory = Arc::new(WebRtcTransportFactory::new(devices, config.clone())?);

    let credentials = AdminCredentials::from_env().unwrap_or_else(|| AdminCredentials {
        email: "care-team@localhost".into(),
        password: "carecall".into(),
    });
    let admin_session = SessionContext::admin_login(
        &credentials.email,
        &credentials.password,
        &credentials,
        config::session_ttl_from_env(),
    )?;

    let patient = CallOrchestrator::new(
        SessionContext::patient(),
        store.clone(),
        factory.clone(),
        config.clone(),
    )?;
    let admin = CallOrchestrator::new(admin_session, store, factory, config)?;
    watch_side("patient", &patient);
    watch_side("care team", &admin);

    let row = patient.start_call().await?;
    feed(patient.snapshot().await.local_stream);

    let call = admin
        .list_open_calls()
        .await?
        .into_iter()
        .find(|c| c.id == row.id)
        .ok_or_else(|| CallError::InvalidState(format!("call {} is not listed", row.room_id)))?;
    admin.join_call(&call).await?;
    feed(admin.snapshot().await.local_stream);

    tokio::time::sleep(duration).await;

    let snapshot = patient.snapshot().await;
    if snapshot.phase == CallPhase::Connected {
        info!("Loopback call connected, hanging up");
    } else {
        warn!(
            "Loopback call did not connect: phase {:?}, error {:?}",
            snapshot.phase, snapshot.last_error
        );
    }
    if let Err(e) = patient.end_call().await {
        warn!("Patient could not end the call: {e}");
    }
    // даём второй стороне увидеть `ended`
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Care team side is now {:?}", admin.snapshot().await.phase);
    Ok(())
}

fn watch_side(label: &'static str, orch: &CallOrchestrator) {
    let mut view = orch.view();
    tokio::spawn(async move {
        while view.changed().await.is_ok() {
            let v = view.borrow_and_update().clone();
            info!(
                "[{label}] status={:?} local={} remote={} video={} audio={} error={:?}",
                v.call_status,
                v.local_stream.is_some(),
                v.remote_stream.is_some(),
                v.video_enabled,
                v.audio_enabled,
                v.error
            );
        }
    });

    let mut notices = orch.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!("[{label}] {}: {}", notice.title, notice.description);
        }
    });
}

/// Пишет пустые кадры в живые треки, пока их не остановят
fn feed(stream: Option<LocalStream>) {
    let Some(stream) = stream else {
        return;
    };
    for track in stream.tracks().iter().cloned() {
        tokio::spawn(async move {
            let frame = match track.kind() {
                MediaKind::Audio => Bytes::from_static(&SILENCE),
                MediaKind::Video => Bytes::from_static(&BLANK_VP8),
            };
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            while track.is_live() {
                ticker.tick().await;
                if let Err(e) = track.write_sample(frame.clone(), FRAME_INTERVAL).await {
                    warn!("Sample write on {} failed: {e}", track.id());
                    break;
                }
            }
        });
    }
}
