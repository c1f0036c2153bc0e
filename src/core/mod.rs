//! 核心层：会话编排、状态视图、限流、会话锁、通知去重、卡死恢复、会话监管

pub mod builder;
pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod rate_limiter;
pub mod recovery;
pub mod session_lock;
pub mod session_supervisor;
pub mod state;

pub use builder::OrchestratorBuilder;
pub use dedup::{bigram_similarity, MessageDeduplicator};
pub use error::{AgentError, FailureKind};
pub use orchestrator::{create_planner_from_config, Orchestrator};
pub use rate_limiter::RateLimiter;
pub use recovery::{RecoveryManager, RecoveryStrategy, Severity, StuckReason, StuckState};
pub use session_lock::SessionLock;
pub use session_supervisor::SessionSupervisor;
pub use state::SessionView;
