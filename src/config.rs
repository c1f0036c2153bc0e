//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TABPILOT__*` 覆盖（双下划线表示嵌套，如 `TABPILOT__SESSION__MAX_ACTIONS=20`）。
//! 所有阈值（去重相似度、卡死判定、校验置信度）都是可调配置，默认值只是经验起点。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::actuator::ActionKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub session: SessionSection,
    pub rate_limit: RateLimitSection,
    pub planner: PlannerSection,
    pub timeouts: TimeoutsSection,
    pub targets: TargetsSection,
    pub recovery: RecoverySection,
    pub verifier: VerifierSection,
    pub dedup: DedupSection,
    pub memory: MemorySection,
}

/// [app] 段：应用名、会话持久化目录
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// JSON 持久化目录，未设置时只保存在内存中
    pub state_dir: Option<PathBuf>,
}

impl AppSection {
    /// 会话日志 span 中的应用名，未配置时为 "tabpilot"
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or("tabpilot")
    }
}

/// [llm] 段：Planner 背后的模型选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 主模型持续失败后切换的备用模型（同一 provider）
    pub fallback_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            fallback_model: None,
        }
    }
}

/// [session] 段：单次会话的动作上限、节奏与重试预算
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 单会话最多记录的 ActionRecord 数
    pub max_actions: usize,
    /// 每轮执行后的固定间隔（毫秒）
    pub action_delay_ms: u64,
    /// Planner 连续多少次不给动作即判定为输出异常
    pub max_consecutive_no_action: usize,
    /// 同一动作执行失败的最大尝试次数
    pub max_execution_retries: usize,
    /// 校验失败后按建议重试的预算（校验成功后重置）
    pub max_verification_retries: usize,
    /// 保留前后快照的最近 ActionRecord 数
    pub context_retention: usize,
    /// 每隔多少个动作发一次 milestone
    pub milestone_every: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_actions: 50,
            action_delay_ms: 500,
            max_consecutive_no_action: 3,
            max_execution_retries: 3,
            max_verification_retries: 2,
            context_retention: 5,
            milestone_every: 10,
        }
    }
}

/// [rate_limit] 段：滑动窗口 + 最小调用间隔
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_calls: usize,
    pub window_ms: u64,
    pub min_delay_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window_ms: 60_000,
            min_delay_ms: 1_000,
        }
    }
}

/// [planner] 段：瞬时错误的指数退避与备用 Planner 切换
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 连续多少次瞬时失败后切到备用 Planner
    pub fallback_after: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            fallback_after: 2,
        }
    }
}

/// [timeouts] 段：外部调用的截止时间（秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub planner_secs: u64,
    pub actuator_secs: u64,
    pub context_secs: u64,
    /// stop 时等待循环完成清理的时间
    pub stop_grace_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            planner_secs: 60,
            actuator_secs: 30,
            context_secs: 15,
            stop_grace_secs: 5,
        }
    }
}

/// [targets] 段：并发标签页上限、快照历史深度、跨标签关联
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsSection {
    pub max_targets: usize,
    pub history_depth: usize,
    pub cross_target_tracking: bool,
    /// 给 Planner 的摘要最多列出的标签页数
    pub summary_max_targets: usize,
    /// 连续抓取上下文失败多少次后终止会话
    pub max_context_failures: usize,
}

impl Default for TargetsSection {
    fn default() -> Self {
        Self {
            max_targets: 5,
            history_depth: 10,
            cross_target_tracking: true,
            summary_max_targets: 5,
            max_context_failures: 3,
        }
    }
}

/// [recovery] 段：卡死判定阈值与恢复次数上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 最近 N 个动作全部失败且类型相同
    pub repeated_failure_threshold: usize,
    /// 地址与结构哈希连续 M 个动作未变化
    pub no_progress_threshold: usize,
    /// 在最近 window 个已校验动作中统计失败
    pub verification_loop_window: usize,
    /// 失败数达到该值即判定为校验死循环
    pub verification_loop_threshold: usize,
    pub max_recovery_attempts: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            repeated_failure_threshold: 3,
            no_progress_threshold: 5,
            verification_loop_window: 5,
            verification_loop_threshold: 3,
            max_recovery_attempts: 3,
        }
    }
}

/// [verifier] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierSection {
    /// 置信度低于该值时附带重试建议
    pub retry_confidence_threshold: f64,
    /// 免校验的动作类型（总是成功、置信度 1.0）
    pub exempt_kinds: Vec<ActionKind>,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            retry_confidence_threshold: 0.6,
            exempt_kinds: vec![
                ActionKind::MouseMove,
                ActionKind::Wait,
                ActionKind::ExtractText,
                ActionKind::Message,
                ActionKind::Deliver,
            ],
        }
    }
}

/// [dedup] 段：通知去重窗口
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    /// 字符二元组 Jaccard 相似度阈值
    pub threshold: f64,
    pub capacity: usize,
    pub expiry_secs: u64,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            capacity: 20,
            expiry_secs: 30,
        }
    }
}

/// [memory] 段：各类记忆容量与摘要尺寸
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_goals: usize,
    pub max_facts: usize,
    pub max_visited: usize,
    pub max_failures: usize,
    pub summary_facts: usize,
    pub summary_visited: usize,
    pub summary_failures: usize,
    pub summary_max_chars: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_goals: 50,
            max_facts: 100,
            max_visited: 30,
            max_failures: 20,
            summary_facts: 10,
            summary_visited: 5,
            summary_failures: 3,
            summary_max_chars: 2_000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TABPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TABPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TABPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；Orchestrator::reload_config 用它替换会话级配置
pub fn reload_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    tracing::debug!(path = ?config_path, "reloading config");
    load_config(config_path)
}
