//! 动作执行器
//!
//! 持有 Actuator / ContextProvider 与各自的超时，perform / capture 在截止时间内调用外部实现，
//! 超时转为可重试的错误；每次动作输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::actuator::{
    Action, ActionOutcome, Actuator, ActuatorError, ContextError, ContextProvider, ContextSnapshot,
    TargetId, TargetInfo,
};

/// 执行器：对每次外部调用施加超时
#[derive(Clone)]
pub struct ActionExecutor {
    actuator: Arc<dyn Actuator>,
    provider: Arc<dyn ContextProvider>,
    action_timeout: Duration,
    context_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        provider: Arc<dyn ContextProvider>,
        action_timeout_secs: u64,
        context_timeout_secs: u64,
    ) -> Self {
        Self {
            actuator,
            provider,
            action_timeout: Duration::from_secs(action_timeout_secs),
            context_timeout: Duration::from_secs(context_timeout_secs),
        }
    }

    /// 执行动作；超时返回 ActuatorError::Timeout；输出 JSON 审计日志
    pub async fn perform(
        &self,
        target: &TargetId,
        action: &Action,
    ) -> Result<ActionOutcome, ActuatorError> {
        let start = Instant::now();
        let result = timeout(self.action_timeout, self.actuator.perform(target, action)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "kind": action.kind().as_str(),
            "target": target.as_str(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        match result {
            Ok(r) => r,
            Err(_) => Err(ActuatorError::Timeout {
                kind: action.kind(),
                secs: self.action_timeout.as_secs(),
            }),
        }
    }

    pub async fn capture(&self, target: &TargetId) -> Result<ContextSnapshot, ContextError> {
        match timeout(self.context_timeout, self.provider.capture(target)).await {
            Ok(r) => r,
            Err(_) => Err(ContextError::Timeout(self.context_timeout.as_secs())),
        }
    }

    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>, ContextError> {
        match timeout(self.context_timeout, self.provider.list_targets()).await {
            Ok(r) => r,
            Err(_) => Err(ContextError::Timeout(self.context_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowActuator;

    #[async_trait]
    impl Actuator for SlowActuator {
        async fn perform(
            &self,
            _target: &TargetId,
            _action: &Action,
        ) -> Result<ActionOutcome, ActuatorError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(ActionOutcome::default())
        }
    }

    #[async_trait]
    impl ContextProvider for SlowActuator {
        async fn capture(&self, target: &TargetId) -> Result<ContextSnapshot, ContextError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(ContextSnapshot::new(target.clone(), "about:blank", ""))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_become_errors() {
        let slow = Arc::new(SlowActuator);
        let executor = ActionExecutor::new(slow.clone(), slow, 1, 2);
        let target = TargetId::new("t1");

        let err = executor.perform(&target, &Action::Refresh).await.unwrap_err();
        assert!(matches!(err, ActuatorError::Timeout { secs: 1, .. }));

        let err = executor.capture(&target).await.unwrap_err();
        assert!(matches!(err, ContextError::Timeout(2)));

        // 默认实现：没有预先存在的标签页
        assert!(executor.list_targets().await.unwrap().is_empty());
    }
}
