//! 会话互斥锁
//!
//! start / stop 等修改会话的操作通过 run_exclusive 串行执行（tokio::Mutex 按 FIFO 唤醒，不会饿死）。
//! 另外记录「持锁会话」的标识：循环每轮开始时比对，不一致说明已被新会话取代。

use std::future::Future;

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

#[derive(Debug)]
pub struct SessionLock {
    gate: Mutex<()>,
    holder: watch::Sender<Option<Uuid>>,
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLock {
    pub fn new() -> Self {
        let (holder, _) = watch::channel(None);
        Self {
            gate: Mutex::new(()),
            holder,
        }
    }

    /// 独占执行 f；f 返回（无论成功失败）或 panic 展开时释放，唤醒下一个等待者
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.gate.lock().await;
        f().await
    }

    /// 记录持锁会话
    pub fn claim(&self, session_id: Uuid) {
        self.holder.send_replace(Some(session_id));
    }

    /// 仅当持锁者是 session_id 时释放
    pub fn release(&self, session_id: Uuid) -> bool {
        self.holder.send_if_modified(|h| {
            if *h == Some(session_id) {
                *h = None;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> Option<Uuid> {
        *self.holder.borrow()
    }

    pub fn is_current(&self, session_id: Uuid) -> bool {
        self.current() == Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_and_fifo() {
        let lock = Arc::new(SessionLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let tasks = (0..5).map(|i| {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let order = order.clone();
            async move {
                lock.run_exclusive(|| async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });
        join_all(tasks).await;

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_released_after_failure() {
        let lock = SessionLock::new();
        let r: Result<(), &str> = lock.run_exclusive(|| async { Err("boom") }).await;
        assert!(r.is_err());
        let ok = lock.run_exclusive(|| async { 42 }).await;
        assert_eq!(ok, 42);
    }

    #[test]
    fn test_claim_and_release() {
        let lock = SessionLock::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        lock.claim(a);
        assert!(lock.is_current(a));
        assert!(!lock.release(b));
        lock.claim(b);
        assert!(!lock.is_current(a));
        assert!(lock.release(b));
        assert_eq!(lock.current(), None);
    }
}
