//! Сигналинг через общую таблицу звонков.

pub mod payload;
pub mod relay;

pub use payload::SignalPayload;
pub use relay::{RelayAdapter, RelayEvent, RelaySubscription};
