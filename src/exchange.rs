/// 单槽帧交换 (Single-slot frame exchange)
///
/// 采集端 push 覆盖旧帧, 永不阻塞; 推理端 wait_and_take 阻塞等待最新帧。
/// 慢推理只会让中间帧被丢弃, 不会拖慢采集。
use crate::frame::Frame;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot {
    pending: Option<Frame>,
    running: bool,
}

pub struct FrameExchange {
    slot: Mutex<Slot>,
    ready: Condvar,
    pushed: AtomicU64,
    dropped: AtomicU64, // 被覆盖、从未被取走的帧数
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExchange {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                running: true,
            }),
            ready: Condvar::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// 放入最新帧, 覆盖未被取走的旧帧, 唤醒一个等待者
    pub fn push(&self, frame: Frame) {
        let replaced = {
            let mut slot = self.slot.lock();
            slot.pending.replace(frame).is_some()
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }

    /// 阻塞直到有帧或已关闭; 关闭且无待处理帧时返回 None
    pub fn wait_and_take(&self) -> Option<Frame> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(frame) = slot.pending.take() {
                return Some(frame);
            }
            if !slot.running {
                return None;
            }
            self.ready.wait(&mut slot);
        }
    }

    /// 非阻塞取帧
    pub fn try_take(&self) -> Option<Frame> {
        self.slot.lock().pending.take()
    }

    /// 在锁内清除运行标志并唤醒所有等待者
    pub fn shutdown(&self) {
        {
            let mut slot = self.slot.lock();
            slot.running = false;
        }
        self.ready.notify_all();
        tracing::debug!(
            pushed = self.pushed(),
            dropped = self.dropped(),
            "frame exchange shut down"
        );
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
