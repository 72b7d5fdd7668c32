pub mod call;
pub mod config;
mod demo;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use call::{CallOrchestrator, CallPhase, CallSnapshot, CallView, Notice};
pub use error::{CallError, MediaAccessError, RelayError, TransportError};
pub use session::SessionContext;
pub use store::{CallSession, CallStore, MemoryStore, Role};

/// Запускает локальный звонок пациент ↔ команда заботы и ждёт его завершения
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let duration = config::demo_duration_from_env();
    log::info!("Starting loopback call for {duration:?}");
    runtime.block_on(demo::loopback(duration))?;
    Ok(())
}
