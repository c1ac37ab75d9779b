//! 速度统计与限速
//!
//! `SpeedMeter` 只做纯计算：调用方喂入"本次写入字节数 + 距上次采样的时长"，
//! 得到需要休眠的时长。同一个任务的所有分片共享一个 meter，限速对整个任务生效。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 实时速度统计窗口
const INSTANT_WINDOW_MS: u64 = 2000;
/// 窗口覆盖时长低于此值时不更新最高速度
const MIN_SPAN_FOR_MAX_MS: u64 = 500;
/// 限速记账周期，没有欠账时在周期结束后清零，避免空闲后突发
const THROTTLE_PERIOD_MS: u64 = 1000;

/// 速度快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedSnapshot {
    pub realtime: u64,
    pub average: u64,
    pub max: u64,
}

#[derive(Debug)]
pub struct SpeedMeter {
    /// 限速上限（字节/秒，0 不限速）
    max_speed_cap: u64,
    /// (会话内时间戳ms, 字节数)
    window: VecDeque<(u64, u64)>,
    window_bytes: u64,
    session_elapsed_ms: u64,
    session_bytes: u64,
    max_speed: u64,
    throttle_bytes: u64,
    throttle_elapsed_ms: u64,
    last_sample: Option<Instant>,
}

impl SpeedMeter {
    pub fn new(max_speed_cap: u64) -> Self {
        Self {
            max_speed_cap,
            window: VecDeque::new(),
            window_bytes: 0,
            session_elapsed_ms: 0,
            session_bytes: 0,
            max_speed: 0,
            throttle_bytes: 0,
            throttle_elapsed_ms: 0,
            last_sample: None,
        }
    }

    /// 喂入一次采样，返回建议休眠时长
    pub fn sample(&mut self, bytes: u64, elapsed: Duration) -> Duration {
        let elapsed_ms = elapsed.as_millis() as u64;
        self.session_elapsed_ms += elapsed_ms;
        self.session_bytes += bytes;

        if bytes > 0 {
            self.window.push_back((self.session_elapsed_ms, bytes));
            self.window_bytes += bytes;
        }
        while let Some(&(at, old)) = self.window.front() {
            if at + INSTANT_WINDOW_MS > self.session_elapsed_ms {
                break;
            }
            self.window.pop_front();
            self.window_bytes -= old;
        }

        if self.session_elapsed_ms >= MIN_SPAN_FOR_MAX_MS {
            self.max_speed = self.max_speed.max(self.instantaneous());
        }

        self.throttle_hint(bytes, elapsed_ms)
    }

    /// 使用单调时钟采样
    pub fn sample_now(&mut self, bytes: u64) -> Duration {
        let now = Instant::now();
        let elapsed = self
            .last_sample
            .map(|last| now.duration_since(last))
            .unwrap_or_default();
        self.last_sample = Some(now);
        self.sample(bytes, elapsed)
    }

    fn throttle_hint(&mut self, bytes: u64, elapsed_ms: u64) -> Duration {
        if self.max_speed_cap == 0 {
            return Duration::ZERO;
        }

        self.throttle_bytes += bytes;
        self.throttle_elapsed_ms += elapsed_ms;

        // 按上限应当耗费的时间
        let allowed_ms = self.throttle_bytes.saturating_mul(1000) / self.max_speed_cap;
        if allowed_ms > self.throttle_elapsed_ms {
            return Duration::from_millis(allowed_ms - self.throttle_elapsed_ms);
        }

        if self.throttle_elapsed_ms >= THROTTLE_PERIOD_MS {
            self.throttle_bytes = 0;
            self.throttle_elapsed_ms = 0;
        }
        Duration::ZERO
    }

    /// 滑动窗口内的速度（字节/秒）
    pub fn instantaneous(&self) -> u64 {
        let span = self.session_elapsed_ms.min(INSTANT_WINDOW_MS);
        if span == 0 {
            return 0;
        }
        self.window_bytes * 1000 / span
    }

    /// 本次会话平均速度
    pub fn average(&self) -> u64 {
        if self.session_elapsed_ms == 0 {
            return 0;
        }
        self.session_bytes * 1000 / self.session_elapsed_ms
    }

    /// 本次会话最高速度
    pub fn max(&self) -> u64 {
        self.max_speed
    }

    /// 剩余字节所需时间（秒），速度为 0 时无法估计
    pub fn eta_for(&self, remaining_bytes: u64) -> Option<u64> {
        let speed = match self.instantaneous() {
            0 => self.average(),
            speed => speed,
        };
        if speed == 0 {
            return None;
        }
        Some(remaining_bytes.div_ceil(speed))
    }

    pub fn snapshot(&self) -> SpeedSnapshot {
        SpeedSnapshot {
            realtime: self.instantaneous(),
            average: self.average(),
            max: self.max(),
        }
    }

}
