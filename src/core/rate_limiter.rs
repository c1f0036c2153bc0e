//! Planner 调用限流：滑动窗口 + 最小调用间隔
//!
//! wait() 阻塞（不丢弃）直到放行，再记录本次调用。等待期间持有 tokio::Mutex，
//! 排队的调用方按 FIFO 顺序依次放行。

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::RateLimitSection;

#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    min_delay: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitSection) -> Self {
        Self {
            max_calls: cfg.max_calls.max(1),
            window: Duration::from_millis(cfg.window_ms),
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// 等待直到允许调用，然后记录本次调用时间
    pub async fn wait(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|&t| now.duration_since(t) >= self.window)
            {
                calls.pop_front();
            }

            let mut delay = Duration::ZERO;
            if let Some(&last) = calls.back() {
                delay = self.min_delay.saturating_sub(now.duration_since(last));
            }
            if calls.len() >= self.max_calls {
                if let Some(&oldest) = calls.front() {
                    delay = delay.max(self.window.saturating_sub(now.duration_since(oldest)));
                }
            }

            if delay.is_zero() {
                calls.push_back(now);
                return;
            }
            tracing::debug!(delay_ms = delay.as_millis() as u64, "rate limiter holding call");
            sleep(delay).await;
        }
    }

    /// 当前窗口内已记录的调用数
    pub async fn calls_in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }

    /// 会话结束时清空
    pub async fn reset(&self) {
        self.calls.lock().await.clear();
    }
}
