//! Жизненный цикл звонка одного участника.

pub mod orchestrator;
pub mod state;
pub mod view;

pub use orchestrator::CallOrchestrator;
pub use state::{CallPhase, CallSnapshot, ParticipantRole, StatusLabel};
pub use view::{CallView, Notice, NoticeLevel};
