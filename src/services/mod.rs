pub mod extraction;
pub mod llm_service;
pub mod problem_service;
pub mod template_service;

pub use llm_service::LlmService;
pub use problem_service::ProblemService;
pub use template_service::{ReferenceSample, TemplateResolver};
