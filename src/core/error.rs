//! 会话级错误
//!
//! 每个致命错误都映射到一个 FailureKind，会话以 error 结束时对外给出具体、可读的原因。

use thiserror::Error;
use uuid::Uuid;

use crate::actuator::ActionKind;
use crate::context::RegistryError;
use crate::memory::PersistenceError;
use crate::react::PlannerError;

/// 会话运行中止的原因
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session cancelled")]
    Cancelled,

    #[error("Session superseded by {0}")]
    Superseded(Uuid),

    #[error("action limit reached ({0} actions)")]
    ActionLimitReached(usize),

    #[error("{kind} failed after {attempts} attempts: {reason}")]
    ExecutionFailed {
        kind: ActionKind,
        attempts: usize,
        reason: String,
    },

    #[error("Planner returned no action for {0} consecutive turns")]
    PlannerMalformed(usize),

    #[error("Planner reported error: {0}")]
    PlannerRejected(String),

    #[error("Clarification needed: {0}")]
    ClarificationNeeded(String),

    #[error("Stuck: {0}")]
    Stuck(String),

    #[error("Planner unavailable: {0}")]
    Planner(#[from] PlannerError),

    #[error("Context unavailable after {attempts} attempts: {reason}")]
    ContextUnavailable { attempts: usize, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Target registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Goal must not be empty")]
    EmptyGoal,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Planner 限流 / 超时 / 配额，退避与备用均已用尽
    Transient,
    /// Actuator 重试耗尽
    Actuation,
    /// 卡死且恢复耗尽，或动作数达上限
    Stuck,
    /// Planner 连续不给动作
    MalformedPlanner,
    /// Planner 主动报告 error / needs_clarification
    PlannerReported,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Actuation => "actuation",
            FailureKind::Stuck => "stuck",
            FailureKind::MalformedPlanner => "malformed_planner",
            FailureKind::PlannerReported => "planner_reported",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl AgentError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::Cancelled | AgentError::Superseded(_) => FailureKind::Cancelled,
            AgentError::ActionLimitReached(_) | AgentError::Stuck(_) => FailureKind::Stuck,
            AgentError::ExecutionFailed { .. } => FailureKind::Actuation,
            AgentError::PlannerMalformed(_) => FailureKind::MalformedPlanner,
            AgentError::PlannerRejected(_) | AgentError::ClarificationNeeded(_) => {
                FailureKind::PlannerReported
            }
            AgentError::Planner(e) if e.is_transient() => FailureKind::Transient,
            AgentError::ContextUnavailable { .. } => FailureKind::Transient,
            AgentError::Planner(_)
            | AgentError::Persistence(_)
            | AgentError::Registry(_)
            | AgentError::EmptyGoal
            | AgentError::Config(_)
            | AgentError::Internal(_) => FailureKind::Internal,
        }
    }
}
