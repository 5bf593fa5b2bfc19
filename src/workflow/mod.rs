pub mod regenerate_flow;
pub mod run_ctx;
pub mod stage_flow;

pub use regenerate_flow::{RegenerateFlow, RegenerateOutcome};
pub use run_ctx::{RunCtx, STAGES_PER_RUN};
pub use stage_flow::{stage_message, RunState, StageFlow, StagePlan};
