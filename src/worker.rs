/// 推理工作线程 (Inference worker thread)
///
/// 循环: wait_and_take → 回调推理 → 发布叠加层。
/// 回调的错误与 panic 都在单帧内捕获, 记录后按 "无叠加" 处理, 线程继续运行。
use crate::error::{InferenceError, Result};
use crate::exchange::FrameExchange;
use crate::frame::{CropBox, Frame, Size};
use crate::overlay::{LatestOverlay, OverlayDocument};
use crate::telemetry::spawn_thread;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// 推理回调: 帧 + 源尺寸 + 推理框 → 可选叠加层
pub trait FrameHandler: Send {
    fn handle(
        &mut self,
        frame: &Frame,
        source: Size,
        crop: CropBox,
    ) -> anyhow::Result<Option<OverlayDocument>>;
}

impl<F> FrameHandler for F
where
    F: FnMut(&Frame, Size, CropBox) -> anyhow::Result<Option<OverlayDocument>> + Send,
{
    fn handle(
        &mut self,
        frame: &Frame,
        source: Size,
        crop: CropBox,
    ) -> anyhow::Result<Option<OverlayDocument>> {
        self(frame, source, crop)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub published: u64,
    pub failed: u64,
}

pub struct InferenceWorker {
    handle: JoinHandle<WorkerStats>,
}

impl InferenceWorker {
    pub fn spawn<H>(
        exchange: Arc<FrameExchange>,
        overlay: Arc<LatestOverlay>,
        source: Size,
        crop: CropBox,
        handler: H,
    ) -> Result<Self>
    where
        H: FrameHandler + 'static,
    {
        let handle = spawn_thread("inference-worker", move || {
            run(&exchange, &overlay, source, crop, handler)
        })?;
        Ok(Self { handle })
    }

    /// 等待线程退出 (需先关闭 FrameExchange)
    pub fn join(self) -> WorkerStats {
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("inference worker panicked outside the callback");
                WorkerStats::default()
            }
        }
    }
}

fn run<H: FrameHandler>(
    exchange: &FrameExchange,
    overlay: &LatestOverlay,
    source: Size,
    crop: CropBox,
    mut handler: H,
) -> WorkerStats {
    let _span = tracing::info_span!("inference.worker").entered();
    tracing::debug!(%source, ?crop, "inference worker started");
    let mut stats = WorkerStats::default();

    while let Some(frame) = exchange.wait_and_take() {
        stats.processed += 1;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&frame, source, crop)));
        let result = match outcome {
            Ok(Ok(doc)) => Ok(doc),
            Ok(Err(e)) => Err(InferenceError::Callback(e)),
            Err(payload) => Err(InferenceError::from_panic(payload)),
        };
        match result {
            Ok(Some(doc)) => {
                overlay.publish(doc);
                stats.published += 1;
            }
            Ok(None) => {}
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(frame = frame.sequence, "{}", e);
            }
        }
    }

    tracing::debug!(
        processed = stats.processed,
        published = stats.published,
        failed = stats.failed,
        "inference worker stopped"
    );
    stats
}
