//! 对外只读视图
//!
//! 观察者（UI、日志）只拿 SessionView：由循环在每次修改后从 Session / MemoryStore / ContextRegistry
//! 投影并通过 watch 发布，永远不直接接触可变结构。

use serde::Serialize;
use uuid::Uuid;

use crate::actuator::{TargetId, TargetInfo};
use crate::context::ContextRegistry;
use crate::memory::MemoryStore;
use crate::session::{Session, SessionStatus};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: Option<Uuid>,
    pub goal: String,
    pub status: Option<SessionStatus>,
    pub step: usize,
    pub last_action: Option<String>,
    pub error: Option<String>,
    pub memory_summary: String,
    pub primary_target: Option<TargetId>,
    pub targets: Vec<TargetInfo>,
}

impl SessionView {
    pub fn project(session: &Session, memory: &MemoryStore, registry: &ContextRegistry) -> Self {
        let error = match session.status {
            SessionStatus::Error => session.outcome_note.clone(),
            _ => None,
        };
        Self {
            session_id: Some(session.id),
            goal: session.goal.clone(),
            status: Some(session.status),
            step: session.action_count(),
            last_action: session.actions.last().map(|r| r.planned.description.clone()),
            error,
            memory_summary: memory.summarize_for_prompt(),
            primary_target: session.primary_target.clone(),
            targets: registry.snapshot(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_some_and(|s| !s.is_terminal())
    }
}
