/// 流水线生命周期 (Pipeline lifecycle)
///
/// Idle → Running → Stopping → Stopped。
/// Stopping 顺序固定: 图置 null → 关闭 FrameExchange → 等待推理线程 → 释放设备与输出。
use crate::compose::OverlayCompositor;
use crate::error::{PipelineError, Result, StopReason};
use crate::exchange::FrameExchange;
use crate::overlay::LatestOverlay;
use crate::pipeline::{
    bus, BusEvent, BusMonitor, BusReceiver, BusSender, FrameSink, FrameSource, GraphContext,
    PipelineBuilder, PipelineGraph, StopSignal,
};
use crate::worker::{FrameHandler, InferenceWorker, WorkerStats};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct PipelineLifecycle {
    state: PipelineState,
    graph: PipelineGraph,
    exchange: Arc<FrameExchange>,
    overlay: Arc<LatestOverlay>,
    compositor: Arc<OverlayCompositor>,
    signal: Arc<StopSignal>,
    monitor: BusMonitor,
    bus_tx: Option<BusSender>,
    bus_rx: BusReceiver,
    worker: Option<InferenceWorker>,
    worker_stats: Option<WorkerStats>,
    poll_interval: Duration,
}

impl PipelineLifecycle {
    /// 组装流水线 (Idle); source 必须已按 builder 的格式打开
    pub fn new(
        builder: &PipelineBuilder,
        source: Box<dyn FrameSource>,
        sink: Option<Box<dyn FrameSink>>,
        compositor: OverlayCompositor,
        signal: Arc<StopSignal>,
    ) -> Result<Self> {
        Self::with_bus(builder, source, sink, compositor, signal, bus())
    }

    /// 同 new, 但使用外部创建的总线; 采集源在此之前已可向总线投递警告
    pub fn with_bus(
        builder: &PipelineBuilder,
        source: Box<dyn FrameSource>,
        sink: Option<Box<dyn FrameSink>>,
        compositor: OverlayCompositor,
        signal: Arc<StopSignal>,
        (bus_tx, bus_rx): (BusSender, BusReceiver),
    ) -> Result<Self> {
        let (topology, plan) = builder.topology()?;
        let graph = PipelineGraph::new(topology, plan, source, sink)?;
        Ok(Self {
            state: PipelineState::Idle,
            graph,
            exchange: Arc::new(FrameExchange::new()),
            overlay: Arc::new(LatestOverlay::new()),
            compositor: Arc::new(compositor),
            monitor: BusMonitor::new(signal.clone()),
            signal,
            bus_tx: Some(bus_tx),
            bus_rx,
            worker: None,
            worker_stats: None,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn overlay(&self) -> &Arc<LatestOverlay> {
        &self.overlay
    }

    pub fn exchange(&self) -> &Arc<FrameExchange> {
        &self.exchange
    }

    pub fn signal(&self) -> &Arc<StopSignal> {
        &self.signal
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.worker_stats
    }

    /// Idle → Running: 启动推理线程, 再启动图
    pub fn start<H>(&mut self, handler: H) -> Result<()>
    where
        H: FrameHandler + 'static,
    {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::construction(format!(
                "cannot start a pipeline in state {:?}",
                self.state
            )));
        }
        let bus_tx = self
            .bus_tx
            .take()
            .ok_or_else(|| PipelineError::construction("bus already handed out"))?;
        let plan = *self.graph.plan();

        self.worker = Some(InferenceWorker::spawn(
            self.exchange.clone(),
            self.overlay.clone(),
            plan.source,
            plan.crop,
            handler,
        )?);

        let ctx = GraphContext {
            exchange: self.exchange.clone(),
            overlay: self.overlay.clone(),
            compositor: self.compositor.clone(),
            bus: bus_tx,
        };
        self.state = PipelineState::Running;
        if let Err(e) = self.graph.play(ctx) {
            self.stop();
            return Err(e);
        }
        tracing::info!(
            source = %plan.source,
            inference = %plan.target,
            scale = plan.scale,
            "pipeline running"
        );
        Ok(())
    }

    /// 分发总线消息直到收到停止请求, 然后执行完整的 Stopping 序列
    pub fn run(&mut self) -> Result<StopReason> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::construction(format!(
                "cannot run a pipeline in state {:?}",
                self.state
            )));
        }
        while !self.monitor.poll(&self.bus_rx, self.poll_interval) {}
        Ok(self.stop())
    }

    /// Running → Stopping → Stopped; 没有停止原因时记为中断
    pub fn stop(&mut self) -> StopReason {
        match self.state {
            PipelineState::Stopped | PipelineState::Stopping => {
                return self.signal.reason().unwrap_or(StopReason::Interrupted);
            }
            PipelineState::Idle | PipelineState::Running => {}
        }
        self.signal.request(StopReason::Interrupted);
        self.state = PipelineState::Stopping;
        tracing::info!("stopping pipeline");

        let released = self.graph.set_null();
        self.exchange.shutdown();
        if let Some(worker) = self.worker.take() {
            let stats = worker.join();
            tracing::info!(
                processed = stats.processed,
                failed = stats.failed,
                dropped = self.exchange.dropped(),
                "inference worker joined"
            );
            self.worker_stats = Some(stats);
        }

        released.release_all();

        // 停止过程中到达的消息只记录
        while let Ok(event) = self.bus_rx.try_recv() {
            match event {
                BusEvent::Warning { message } | BusEvent::Error { message } => {
                    tracing::debug!("after stop: {}", message)
                }
                BusEvent::EndOfStream => {}
            }
        }

        self.state = PipelineState::Stopped;
        let reason = self.signal.reason().unwrap_or(StopReason::Interrupted);
        tracing::info!(%reason, "pipeline stopped");
        reason
    }
}

impl Drop for PipelineLifecycle {
    fn drop(&mut self) {
        // 组装后未启动的流水线也持有设备
        if matches!(self.state, PipelineState::Idle | PipelineState::Running) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CropBox, Frame, Size};
    use crate::overlay::{OverlayDocument, OverlayRenderer};
    use crate::pipeline::{Caps, MemorySink, SourceSpec, TestPatternSource};
    use parking_lot::Mutex;
    use std::time::Instant;

    fn builder(headless: bool) -> PipelineBuilder {
        PipelineBuilder::new(SourceSpec::TestPattern, Size::new(640, 480), Size::new(224, 224))
            .headless(headless)
    }

    fn caps() -> Caps {
        Caps {
            size: Size::new(640, 480),
            framerate: 30,
        }
    }

    #[test]
    fn test_three_frames_then_eos() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = PipelineLifecycle::new(
            &builder(true),
            Box::new(TestPatternSource::new(caps(), Some(3))),
            None,
            OverlayCompositor::new(None),
            StopSignal::new(),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(5));
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let record = seen.clone();
        pipeline
            .start(
                move |frame: &Frame, source: Size, crop: CropBox| -> anyhow::Result<Option<OverlayDocument>> {
                    assert_eq!(frame.size(), Size::new(224, 224));
                    assert_eq!(source, Size::new(640, 480));
                    assert_eq!((crop.x, crop.y, crop.width, crop.height), (0, 28, 224, 168));
                    record.lock().push(frame.sequence);
                    let mut svg = OverlayRenderer::begin(source.width, source.height);
                    svg.add_text(10.0, 20.0, &format!("frame {}", frame.sequence), 20.0);
                    Ok(Some(svg.finish()))
                },
            )
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);

        let reason = pipeline.run().unwrap();
        assert_eq!(reason, StopReason::EndOfStream);
        assert_eq!(reason.exit_code(), 0);
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // 按产生顺序, 允许有间隔; 至少处理了一帧
        let seen = seen.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(seen.iter().all(|&s| (1..=3).contains(&s)));
        assert!(pipeline.overlay().current().is_some());
        let stats = pipeline.worker_stats().unwrap();
        assert_eq!(stats.processed as usize, seen.len());
    }

    #[test]
    fn test_interrupt_is_graceful() {
        let signal = StopSignal::new();
        let sink = MemorySink::new();
        let mut pipeline = PipelineLifecycle::new(
            &builder(false),
            Box::new(TestPatternSource::new(caps(), None)),
            Some(Box::new(sink.clone())),
            OverlayCompositor::new(None),
            signal.clone(),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(5));
        pipeline
            .start(|_: &Frame, _: Size, _: CropBox| -> anyhow::Result<Option<OverlayDocument>> {
                // 慢推理不能拖住采集
                std::thread::sleep(Duration::from_millis(100));
                Ok(None)
            })
            .unwrap();

        let interrupter = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                signal.request(StopReason::Interrupted);
            })
        };
        let started = Instant::now();
        let reason = pipeline.run().unwrap();
        interrupter.join().unwrap();

        assert_eq!(reason, StopReason::Interrupted);
        assert_eq!(reason.exit_code(), 130);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sink.is_released());
        assert!(sink.frames().len() > 3);
        assert!(!pipeline.exchange().is_running());
    }

    #[test]
    fn test_source_error_is_fatal() {
        struct Failing(Caps);
        impl FrameSource for Failing {
            fn caps(&self) -> Caps {
                self.0
            }
            fn next_frame(&mut self) -> crate::error::Result<Option<crate::frame::RawFrame>> {
                Err(PipelineError::Source("device unplugged".into()))
            }
            fn interrupter(&self) -> crate::pipeline::source::Interrupter {
                Arc::new(|| {})
            }
            fn release(&mut self) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let mut pipeline = PipelineLifecycle::new(
            &builder(true),
            Box::new(Failing(caps())),
            None,
            OverlayCompositor::new(None),
            StopSignal::new(),
        )
        .unwrap();
        pipeline
            .start(|_: &Frame, _: Size, _: CropBox| -> anyhow::Result<Option<OverlayDocument>> { Ok(None) })
            .unwrap();
        let reason = pipeline.run().unwrap();
        assert!(matches!(&reason, StopReason::Fatal(msg) if msg.contains("device unplugged")));
        assert_eq!(reason.exit_code(), 1);
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut pipeline = PipelineLifecycle::new(
            &builder(true),
            Box::new(TestPatternSource::new(caps(), Some(1))),
            None,
            OverlayCompositor::new(None),
            StopSignal::new(),
        )
        .unwrap();
        let noop = |_: &Frame, _: Size, _: CropBox| -> anyhow::Result<Option<OverlayDocument>> { Ok(None) };
        pipeline.start(noop).unwrap();
        assert!(pipeline.start(noop).is_err());
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_drop_while_idle_releases_sink() {
        let sink = MemorySink::new();
        let pipeline = PipelineLifecycle::new(
            &builder(false),
            Box::new(TestPatternSource::new(caps(), None)),
            Some(Box::new(sink.clone())),
            OverlayCompositor::new(None),
            StopSignal::new(),
        )
        .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        drop(pipeline);
        assert!(sink.is_released());
    }
}
