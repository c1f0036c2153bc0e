//! tabpilot - 网页智能体编排核心
//!
//! 模块划分：
//! - **actuator**: 动作模型、上下文快照、Actuator / ContextProvider 抽象、执行器、模拟页面
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 多标签页注册表与跨标签页关联
//! - **core**: 编排、状态视图、限流、会话锁、去重、卡死恢复、会话监管
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 会话记忆与持久化
//! - **observability**: 日志初始化
//! - **react**: Planner、Verifier、会话通知与主循环
//! - **session**: 会话数据模型

pub mod actuator;
pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod session;

pub use crate::core::{AgentError, Orchestrator, OrchestratorBuilder};
pub use crate::session::{SessionOutcome, SessionStatus};
