/// 消息总线与停止信号 (Message bus and stop signal)
///
/// 流水线线程把 EOS/警告/错误投递到总线; BusMonitor 在主线程分发,
/// 只记录日志或设置 StopSignal, 从不阻塞。
use crate::error::StopReason;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    EndOfStream,
    Warning { message: String },
    Error { message: String },
}

pub type BusSender = Sender<BusEvent>;
pub type BusReceiver = Receiver<BusEvent>;

/// 无界通道, 发送端永不阻塞
pub fn bus() -> (BusSender, BusReceiver) {
    unbounded()
}

/// 线程安全的停止请求, 第一个原因生效
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    reason: Mutex<Option<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 请求停止; 已有原因时返回 false 且不覆盖
    pub fn request(&self, reason: StopReason) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.lock().clone()
    }
}

pub struct BusMonitor {
    signal: Arc<StopSignal>,
}

impl BusMonitor {
    pub fn new(signal: Arc<StopSignal>) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> &Arc<StopSignal> {
        &self.signal
    }

    /// 分发一条总线消息, 返回本次触发的停止原因
    pub fn dispatch(&self, event: BusEvent) -> Option<StopReason> {
        let reason = match event {
            BusEvent::EndOfStream => {
                tracing::info!("end of stream");
                StopReason::EndOfStream
            }
            BusEvent::Warning { message } => {
                tracing::warn!("{}", message);
                return None;
            }
            BusEvent::Error { message } => StopReason::Fatal(message),
        };
        if let Some(err) = reason.to_error() {
            tracing::error!("{}", err);
        }
        if self.signal.request(reason.clone()) {
            Some(reason)
        } else {
            None
        }
    }

    /// 等待最多 `timeout` 处理消息, 并排空其余已到达的消息; 返回是否已请求停止
    pub fn poll(&self, rx: &BusReceiver, timeout: Duration) -> bool {
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                self.dispatch(event);
                while let Ok(event) = rx.try_recv() {
                    self.dispatch(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // 所有发送端已关闭, 按流结束处理
                self.dispatch(BusEvent::EndOfStream);
            }
        }
        self.signal.is_requested()
    }
}
