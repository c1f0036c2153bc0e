//! 会话通知：供 UI / 日志订阅的状态与进度事件

use serde::Serialize;
use uuid::Uuid;

use crate::session::SessionStatus;

/// 对外通知（可序列化为 JSON 推给前端）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentNotification {
    /// 状态机迁移
    StatusChanged { session_id: Uuid, status: SessionStatus },
    /// 每个动作后的进度
    StepProgress {
        session_id: Uuid,
        step: usize,
        max_steps: usize,
        text: String,
    },
    /// 阶段性进展（子目标完成、交付物生成、每 N 个动作）
    Milestone { session_id: Uuid, text: String },
    TaskComplete { session_id: Uuid, summary: String },
    /// kind 为错误分类（transient / actuation / stuck ...）
    TaskError {
        session_id: Uuid,
        reason: String,
        kind: String,
    },
    /// Planner 需要用户补充信息
    ClarificationNeeded { session_id: Uuid, question: String },
}

impl AgentNotification {
    pub fn session_id(&self) -> Uuid {
        match self {
            AgentNotification::StatusChanged { session_id, .. }
            | AgentNotification::StepProgress { session_id, .. }
            | AgentNotification::Milestone { session_id, .. }
            | AgentNotification::TaskComplete { session_id, .. }
            | AgentNotification::TaskError { session_id, .. }
            | AgentNotification::ClarificationNeeded { session_id, .. } => *session_id,
        }
    }

    /// 面向用户的一行文本
    pub fn text(&self) -> String {
        match self {
            AgentNotification::StatusChanged { status, .. } => format!("status: {}", status),
            AgentNotification::StepProgress { step, max_steps, text, .. } => {
                format!("[{}/{}] {}", step, max_steps, text)
            }
            AgentNotification::Milestone { text, .. } => text.clone(),
            AgentNotification::TaskComplete { summary, .. } => format!("done: {}", summary),
            AgentNotification::TaskError { reason, .. } => format!("error: {}", reason),
            AgentNotification::ClarificationNeeded { question, .. } => {
                format!("question: {}", question)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_json_shape() {
        let id = Uuid::new_v4();
        let n = AgentNotification::TaskError {
            session_id: id,
            reason: "action limit reached (5 actions)".into(),
            kind: "stuck".into(),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "task_error");
        assert_eq!(v["kind"], "stuck");
        assert_eq!(n.session_id(), id);

        let s = AgentNotification::StatusChanged {
            session_id: id,
            status: SessionStatus::Verifying,
        };
        assert_eq!(serde_json::to_value(&s).unwrap()["status"], "verifying");
    }
}
