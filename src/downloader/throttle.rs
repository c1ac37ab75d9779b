//! 通知节流
//!
//! 流媒体任务的进度行可能每秒几十条，只有间隔足够时才向观察者推送。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 尚未发布过的标记
const NEVER: u64 = u64::MAX;

#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布时间（相对 origin 的纳秒）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 距上次发布超过间隔时返回 true（首次调用总是 true）
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（状态变化、结束时）
    pub fn force_emit(&self) {
        let now = self.origin.elapsed().as_nanos() as u64;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_emit_then_throttled() {
        let throttler = ProgressThrottler::new(Duration::from_millis(1000));
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_emit_after_interval() {
        let throttler = ProgressThrottler::new(Duration::from_millis(20));
        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(30));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_restarts_interval() {
        let throttler = ProgressThrottler::new(Duration::from_millis(1000));
        throttler.force_emit();
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_only_one_thread_wins() {
        let throttler = Arc::new(ProgressThrottler::new(Duration::from_millis(10_000)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = throttler.clone();
                thread::spawn(move || t.should_emit())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
