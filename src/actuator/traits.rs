//! Actuator / ContextProvider 抽象
//!
//! Actuator 在某个标签页上执行单个动作；ContextProvider 抓取标签页的上下文快照。
//! 两者都是外部协作者（浏览器扩展、CDP 等），核心只依赖这里的 trait。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::{Action, ActionKind, ContextSnapshot, TargetId};

/// 执行动作失败
#[derive(Error, Debug, Clone)]
pub enum ActuatorError {
    #[error("Target not found: {0}")]
    TargetNotFound(TargetId),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Action {kind} timed out after {secs}s")]
    Timeout { kind: ActionKind, secs: u64 },

    #[error("Unsupported action: {0}")]
    Unsupported(ActionKind),

    #[error("Actuator failed: {0}")]
    Failed(String),
}

/// 抓取上下文失败
#[derive(Error, Debug, Clone)]
pub enum ContextError {
    #[error("Target not found: {0}")]
    TargetNotFound(TargetId),

    #[error("Context capture timed out after {0}s")]
    Timeout(u64),

    #[error("Context unavailable: {0}")]
    Unavailable(String),
}

/// 标签页的基本信息（打开新标签或枚举已有标签时返回）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub address: String,
    #[serde(default)]
    pub title: String,
    /// 是否为当前激活的标签页
    #[serde(default)]
    pub active: bool,
}

/// 动作成功后的附带结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// 动作输出（如 Message 文本、提取到的原文）
    pub output: Option<String>,
    /// 提取到的键值对
    pub extracted: Vec<(String, String)>,
    pub opened_target: Option<TargetInfo>,
    pub closed_target: Option<TargetId>,
    /// 执行后激活的标签页（打开、关闭、切换后可能变化）
    pub active_target: Option<TargetId>,
    /// 生成的交付物路径
    pub deliverable: Option<String>,
}

/// 动作执行器：在 target 上执行 action，成功返回 ActionOutcome，失败返回 ActuatorError
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn perform(
        &self,
        target: &TargetId,
        action: &Action,
    ) -> Result<ActionOutcome, ActuatorError>;
}

/// 上下文提供者：抓取快照、枚举已有标签页
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn capture(&self, target: &TargetId) -> Result<ContextSnapshot, ContextError>;

    /// 会话开始时已存在的标签页；默认没有
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, ContextError> {
        Ok(Vec::new())
    }
}
