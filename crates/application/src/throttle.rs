//! 前沿节流
//!
//! 窗口内的第一次发射立即放行，之后距上一次放行不足窗口时长的发射直接丢弃，
//! 既不排队也不延迟补发。

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// 纯函数形式的节流判定：给定上一次放行时间与当前时间，决定放行还是丢弃
pub fn should_emit(last_emitted: Option<Instant>, now: Instant, window: Duration) -> bool {
    match last_emitted {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= window,
    }
}

/// 记录上一次放行时间的前沿节流器
#[derive(Debug)]
pub struct LeadingEdgeThrottle {
    window: Duration,
    last_emitted: Mutex<Option<Instant>>,
}

impl LeadingEdgeThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 按当前时间尝试放行
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// 按指定时间尝试放行，放行时记录该时间
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if should_emit(*last, now, self.window) {
            *last = Some(now);
            true
        } else {
            false
        }
    }

    /// 清除记录，下一次发射必然放行
    pub fn reset(&self) {
        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = None;
    }
}
