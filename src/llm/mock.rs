//! Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 默认行为：提示里的 `Step: 0` 时回复一次向下滚动，之后回复 done；
//! 也可以给定脚本，按顺序返回，用完后重复最后一条。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

const SCROLL_REPLY: &str = r#"{"rationale": "Look for more content first.",
"status": "continue", "confidence": 0.7,
"action": {"type": "scroll", "direction": "down", "amount": 400},
"description": "scroll down to look around"}"#;

const DONE_REPLY: &str = r#"{"rationale": "Mock planner has finished exploring.",
"status": "done", "confidence": 0.9}"#;

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<Vec<String>>,
    last: Mutex<Option<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定回复
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script: Vec<String> = replies.into_iter().map(Into::into).collect();
        script.reverse();
        Self {
            script: Mutex::new(script),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reply) = next {
            *last = Some(reply.clone());
            return Ok(reply);
        }
        if let Some(reply) = last.as_ref() {
            return Ok(reply.clone());
        }

        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if prompt.contains("Step: 0\n") || prompt.ends_with("Step: 0") {
            Ok(SCROLL_REPLY.to_string())
        } else {
            Ok(DONE_REPLY.to_string())
        }
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_repeat_last() {
        let llm = MockLlmClient::scripted(["a", "b"]);
        let msgs = [Message::user("hi")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "a");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_default_scrolls_then_finishes() {
        let llm = MockLlmClient::new();
        let first = llm.complete(&[Message::user("Goal: x\nStep: 0")]).await.unwrap();
        assert!(first.contains("\"scroll\""));
        let second = llm.complete(&[Message::user("Goal: x\nStep: 1")]).await.unwrap();
        assert!(second.contains("\"done\""));
    }
}
