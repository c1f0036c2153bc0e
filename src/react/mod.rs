//! 推理-执行层：Planner、动作校验、会话通知与主循环

pub mod events;
pub mod loop_;
pub mod planner;
pub mod verifier;

pub use events::AgentNotification;
pub use loop_::{SessionDeps, SessionRunner};
pub use planner::{
    parse_decision, DiscoveredFact, HistoryEntry, LlmPlanner, PlanRequest, Planner, PlannerDecision,
    PlannerError, PlannerGateway, PlannerStatus,
};
pub use verifier::Verifier;
