//! 网络状态
//!
//! 宿主应用负责更新在线状态，
//! 引擎在分片失败时据此决定是重试还是等待网络恢复。

use std::sync::atomic::{AtomicBool, Ordering};

pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// 始终在线
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// 由外部切换的在线状态
#[derive(Debug)]
pub struct ToggleNetworkMonitor {
    online: AtomicBool,
}

impl ToggleNetworkMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!("网络状态变化: {}", if online { "在线" } else { "离线" });
        }
    }
}

impl Default for ToggleNetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ToggleNetworkMonitor {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle() {
        let monitor = ToggleNetworkMonitor::default();
        assert!(monitor.is_online());
        monitor.set_online(false);
        assert!(!monitor.is_online());
        assert!(AlwaysOnline.is_online());
    }
}
