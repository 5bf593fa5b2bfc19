pub mod event;
pub mod problem;
pub mod request;
pub mod turn;
pub mod usage;

pub use event::{Completion, StageEvent};
pub use problem::{CheckInfo, NewProblem, Problem, ProblemId, ProblemPatch, ProblemQuery};
pub use request::{GenerationRequest, ModelChoice, QuickRequest, TripleRequest};
pub use turn::{ChatTurn, Role};
pub use usage::{UsageCounter, UsageCounters};
