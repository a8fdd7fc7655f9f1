use std::sync::atomic::{AtomicU64, Ordering};

/// 进程内的处理计数，由心跳定期写入存储
#[derive(Debug, Default)]
pub struct ProcessStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个执行完的任务调用一次
    pub fn record(&self, failed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 取出并清零，返回 (processed, failed)
    pub fn take(&self) -> (u64, u64) {
        (
            self.processed.swap(0, Ordering::Relaxed),
            self.failed.swap(0, Ordering::Relaxed),
        )
    }

    /// 写入存储失败时把取出的计数加回去
    pub fn restore(&self, processed: u64, failed: u64) {
        self.processed.fetch_add(processed, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
    }

    /// 只读当前累计值，不清零
    pub fn pending(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_and_restore_adds_back() {
        let stats = ProcessStats::new();
        stats.record(false);
        stats.record(true);
        assert_eq!(stats.take(), (2, 1));
        assert_eq!(stats.pending(), (0, 0));

        stats.record(false);
        stats.restore(2, 1);
        assert_eq!(stats.take(), (3, 1));
    }
}
