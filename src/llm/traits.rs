//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete；错误按限流、超时、配额、其它分类，
//! 由 Planner 决定是否退避重试。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM request timed out")]
    Timeout,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 按错误文本归类（HTTP 客户端只给出字符串时使用）
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient_quota") || lower.contains("quota") {
            LlmError::QuotaExceeded
        } else if ["rate limit", "rate_limit", "429"].iter().any(|p| lower.contains(p)) {
            LlmError::RateLimited { retry_after_ms: 0 }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else {
            LlmError::ApiError(message.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::ApiError(_))
    }
}

/// LLM 客户端：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 模型名（日志用）
    fn model(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            LlmError::classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { retry_after_ms: 0 }
        );
        assert_eq!(LlmError::classify("You exceeded your current quota"), LlmError::QuotaExceeded);
        assert_eq!(LlmError::classify("operation timed out"), LlmError::Timeout);
        let other = LlmError::classify("invalid api key");
        assert!(!other.is_transient());
    }
}
