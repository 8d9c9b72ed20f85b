/// 流水线图 (Pipeline graph)
///
/// 采集线程驱动整张图; 显示模式下 tee 到两个漏桶队列,
/// 推理分支写 FrameExchange, 显示分支读取最新叠加层后合成输出。
/// 停止时 (置 null) 所有线程归还各自持有的设备与输出, 由生命周期统一释放。
use crate::compose::OverlayCompositor;
use crate::error::{PipelineError, Result};
use crate::exchange::FrameExchange;
use crate::frame::RawFrame;
use crate::overlay::LatestOverlay;
use crate::pipeline::bus::{BusEvent, BusSender};
use crate::pipeline::elements::{convert, leaky_queue, InferencePrep, LeakySender};
use crate::pipeline::sink::{FrameSink, NullSink};
use crate::pipeline::source::{FrameSource, Interrupter};
use crate::pipeline::topology::{ScalePlan, Topology, LEAKY_QUEUE_CAPACITY};
use crate::telemetry::spawn_thread;
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// 各线程共享的句柄
#[derive(Clone)]
pub struct GraphContext {
    pub exchange: Arc<FrameExchange>,
    pub overlay: Arc<LatestOverlay>,
    pub compositor: Arc<OverlayCompositor>,
    pub bus: BusSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Ready,
    Playing,
    Null,
}

/// 置 null 后归还的资源
pub struct Released {
    pub source: Option<Box<dyn FrameSource>>,
    pub sink: Option<Box<dyn FrameSink>>,
}

impl Released {
    /// 释放设备与输出; 失败只记录日志
    pub fn release_all(self) {
        if let Some(mut source) = self.source {
            if let Err(e) = source.release() {
                tracing::warn!("failed to release source: {}", e);
            }
        }
        if let Some(mut sink) = self.sink {
            if let Err(e) = sink.release() {
                tracing::error!("failed to release sink: {}", e);
            }
        }
    }
}

pub struct PipelineGraph {
    topology: Topology,
    plan: ScalePlan,
    state: GraphState,
    stop: Arc<AtomicBool>,
    interrupter: Interrupter,
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
    capture: Option<JoinHandle<Box<dyn FrameSource>>>,
    inference_branch: Option<JoinHandle<()>>,
    presentation_branch: Option<JoinHandle<Box<dyn FrameSink>>>,
}

impl PipelineGraph {
    /// 组装图; 源格式与拓扑不一致时返回构建错误
    pub fn new(
        topology: Topology,
        plan: ScalePlan,
        source: Box<dyn FrameSource>,
        sink: Option<Box<dyn FrameSink>>,
    ) -> Result<Self> {
        let caps = source.caps();
        if caps.size != plan.source {
            return Err(PipelineError::construction(format!(
                "source negotiated {} but the pipeline expects {}",
                caps.size, plan.source
            )));
        }
        let sink = match (&topology, sink) {
            (Topology::Headless { .. }, _) => None,
            (Topology::Display { .. }, Some(sink)) => Some(sink),
            (Topology::Display { .. }, None) => Some(Box::new(NullSink::default()) as Box<dyn FrameSink>),
        };
        tracing::info!("pipeline: {}", topology.describe());
        Ok(Self {
            interrupter: source.interrupter(),
            topology,
            plan,
            state: GraphState::Ready,
            stop: Arc::new(AtomicBool::new(false)),
            source: Some(source),
            sink,
            capture: None,
            inference_branch: None,
            presentation_branch: None,
        })
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn plan(&self) -> &ScalePlan {
        &self.plan
    }

    /// 启动采集与分支线程
    pub fn play(&mut self, ctx: GraphContext) -> Result<()> {
        if self.state != GraphState::Ready {
            return Err(PipelineError::construction("graph can only be started once"));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| PipelineError::construction("graph has no source"))?;
        let stop = self.stop.clone();

        match self.topology {
            Topology::Headless { .. } => {
                let prep = InferencePrep::new(self.plan);
                self.capture = Some(spawn_thread("pipeline-capture", move || {
                    capture_headless(source, prep, ctx, stop)
                })?);
            }
            Topology::Display { .. } => {
                let (to_inference, inference_rx) = leaky_queue::<Arc<RawFrame>>(LEAKY_QUEUE_CAPACITY);
                let (to_display, display_rx) = leaky_queue::<Arc<RawFrame>>(LEAKY_QUEUE_CAPACITY);

                let prep = InferencePrep::new(self.plan);
                let branch_ctx = ctx.clone();
                self.inference_branch = Some(spawn_thread("pipeline-inference-branch", move || {
                    inference_branch(inference_rx, prep, branch_ctx)
                })?);

                let sink = self
                    .sink
                    .take()
                    .ok_or_else(|| PipelineError::construction("display topology has no sink"))?;
                let branch_ctx = ctx.clone();
                self.presentation_branch = Some(spawn_thread("pipeline-presentation-branch", move || {
                    presentation_branch(display_rx, sink, branch_ctx)
                })?);

                self.capture = Some(spawn_thread("pipeline-capture", move || {
                    capture_tee(source, [to_inference, to_display], ctx, stop)
                })?);
            }
        }
        self.state = GraphState::Playing;
        Ok(())
    }

    /// 置 null: 停止采集、关闭队列、等待所有图线程退出, 归还资源
    pub fn set_null(&mut self) -> Released {
        if self.state == GraphState::Null {
            return Released {
                source: None,
                sink: None,
            };
        }
        self.stop.store(true, Ordering::SeqCst);
        (self.interrupter)();

        let mut source = self.source.take();
        if let Some(handle) = self.capture.take() {
            match handle.join() {
                Ok(s) => source = Some(s),
                Err(_) => tracing::error!("capture thread panicked"),
            }
        }
        // 采集线程退出后队列写端已释放, 分支线程随之结束
        if let Some(handle) = self.inference_branch.take() {
            if handle.join().is_err() {
                tracing::error!("inference branch panicked");
            }
        }
        let mut sink = self.sink.take();
        if let Some(handle) = self.presentation_branch.take() {
            match handle.join() {
                Ok(s) => sink = Some(s),
                Err(_) => tracing::error!("presentation branch panicked"),
            }
        }
        self.state = GraphState::Null;
        Released { source, sink }
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        if self.state != GraphState::Null {
            self.set_null().release_all();
        }
    }
}

/// 读取下一帧; EOS 或错误时投递总线消息并返回 None
fn pull(source: &mut dyn FrameSource, ctx: &GraphContext, stop: &AtomicBool) -> Option<RawFrame> {
    match source.next_frame() {
        Ok(Some(raw)) => Some(raw),
        Ok(None) => {
            if !stop.load(Ordering::SeqCst) {
                let _ = ctx.bus.send(BusEvent::EndOfStream);
            }
            None
        }
        Err(e) => {
            if !stop.load(Ordering::SeqCst) {
                let _ = ctx.bus.send(BusEvent::Error {
                    message: e.to_string(),
                });
            }
            None
        }
    }
}

fn capture_headless(
    mut source: Box<dyn FrameSource>,
    mut prep: InferencePrep,
    ctx: GraphContext,
    stop: Arc<AtomicBool>,
) -> Box<dyn FrameSource> {
    let _span = tracing::info_span!("pipeline.capture").entered();
    let mut sequence = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let Some(raw) = pull(source.as_mut(), &ctx, &stop) else {
            break;
        };
        sequence += 1;
        match prep.process(&raw, sequence) {
            Ok(frame) => ctx.exchange.push(frame),
            Err(e) => {
                let _ = ctx.bus.send(BusEvent::Warning {
                    message: format!("frame {} dropped: {}", sequence, e),
                });
            }
        }
    }
    tracing::debug!(frames = sequence, "capture stopped");
    source
}

fn capture_tee(
    mut source: Box<dyn FrameSource>,
    queues: [LeakySender<Arc<RawFrame>>; 2],
    ctx: GraphContext,
    stop: Arc<AtomicBool>,
) -> Box<dyn FrameSource> {
    let _span = tracing::info_span!("pipeline.capture").entered();
    let mut frames = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let Some(raw) = pull(source.as_mut(), &ctx, &stop) else {
            break;
        };
        frames += 1;
        let raw = Arc::new(raw);
        for queue in &queues {
            queue.push(raw.clone());
        }
    }
    tracing::debug!(
        frames,
        inference_dropped = queues[0].dropped(),
        display_dropped = queues[1].dropped(),
        "capture stopped"
    );
    source
}

fn inference_branch(rx: Receiver<Arc<RawFrame>>, mut prep: InferencePrep, ctx: GraphContext) {
    let _span = tracing::info_span!("pipeline.branch", branch = "inference").entered();
    let mut sequence = 0u64;
    while let Ok(raw) = rx.recv() {
        sequence += 1;
        match prep.process(&raw, sequence) {
            Ok(frame) => ctx.exchange.push(frame),
            Err(e) => {
                let _ = ctx.bus.send(BusEvent::Warning {
                    message: format!("frame {} dropped: {}", sequence, e),
                });
            }
        }
    }
}

fn presentation_branch(
    rx: Receiver<Arc<RawFrame>>,
    mut sink: Box<dyn FrameSink>,
    ctx: GraphContext,
) -> Box<dyn FrameSink> {
    let _span = tracing::info_span!("pipeline.branch", branch = "presentation").entered();
    let mut failed = false;
    while let Ok(raw) = rx.recv() {
        if failed {
            continue;
        }
        let mut image = match convert(&raw) {
            Ok(image) => image,
            Err(e) => {
                let _ = ctx.bus.send(BusEvent::Warning {
                    message: e.to_string(),
                });
                continue;
            }
        };
        if let Some(doc) = ctx.overlay.current() {
            ctx.compositor.compose(&mut image, &doc);
        }
        if let Err(e) = sink.write(&image) {
            // 输出失败是致命错误, 之后只排空队列
            let _ = ctx.bus.send(BusEvent::Error {
                message: e.to_string(),
            });
            failed = true;
        }
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Size;
    use crate::overlay::OverlayRenderer;
    use crate::pipeline::bus::bus;
    use crate::pipeline::sink::MemorySink;
    use crate::pipeline::source::TestPatternSource;
    use crate::pipeline::topology::{Caps, PipelineBuilder, SourceSpec};
    use image::Rgb;
    use std::time::Duration;

    fn ctx(bus: BusSender) -> GraphContext {
        GraphContext {
            exchange: Arc::new(FrameExchange::new()),
            overlay: Arc::new(LatestOverlay::new()),
            compositor: Arc::new(OverlayCompositor::new(None)),
            bus,
        }
    }

    fn caps() -> Caps {
        Caps {
            size: Size::new(64, 48),
            framerate: 30,
        }
    }

    #[test]
    fn test_caps_mismatch_is_construction_error() {
        let builder = PipelineBuilder::new(SourceSpec::TestPattern, Size::new(640, 480), Size::new(32, 32));
        let (topology, plan) = builder.topology().unwrap();
        let source = Box::new(TestPatternSource::new(caps(), Some(1)));
        assert!(matches!(
            PipelineGraph::new(topology, plan, source, None),
            Err(PipelineError::Construction(_))
        ));
    }

    #[test]
    fn test_headless_graph_reaches_eos() {
        let builder = PipelineBuilder::new(SourceSpec::TestPattern, Size::new(64, 48), Size::new(32, 32));
        let (topology, plan) = builder.topology().unwrap();
        let source = Box::new(TestPatternSource::new(caps(), Some(3)).unpaced());
        let mut graph = PipelineGraph::new(topology, plan, source, None).unwrap();

        let (tx, rx) = bus();
        let ctx = ctx(tx);
        graph.play(ctx.clone()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), BusEvent::EndOfStream);

        let released = graph.set_null();
        assert!(released.source.is_some());
        assert!(released.sink.is_none());
        assert_eq!(graph.state(), GraphState::Null);
        let frame = ctx.exchange.try_take().unwrap();
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.size(), Size::new(32, 32));
    }

    #[test]
    fn test_display_graph_composites_overlay() {
        let builder = PipelineBuilder::new(SourceSpec::TestPattern, Size::new(64, 48), Size::new(32, 32))
            .headless(false);
        let (topology, plan) = builder.topology().unwrap();
        let sink = MemorySink::new();
        let mut graph = PipelineGraph::new(
            topology,
            plan,
            Box::new(TestPatternSource::new(caps(), None)),
            Some(Box::new(sink.clone())),
        )
        .unwrap();

        let (tx, _rx) = bus();
        let ctx = ctx(tx);
        let mut svg = OverlayRenderer::begin(64, 48);
        svg.add_rect(1.0, 1.0, 10.0, 10.0, "#010203", 1.0);
        ctx.overlay.publish(svg.finish());

        graph.play(ctx.clone()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.frames().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let released = graph.set_null();
        assert!(released.source.is_some());
        assert!(released.sink.is_some());

        let frames = sink.frames();
        assert!(!frames.is_empty());
        assert_eq!(*frames[0].get_pixel(1, 1), Rgb([1, 2, 3]));
        assert!(ctx.exchange.try_take().is_some());
    }

    struct ReleaseFails {
        inner: TestPatternSource,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ReleaseFails {
        fn caps(&self) -> Caps {
            self.inner.caps()
        }
        fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            self.inner.next_frame()
        }
        fn interrupter(&self) -> Interrupter {
            self.inner.interrupter()
        }
        fn release(&mut self) -> Result<()> {
            self.released.store(true, Ordering::SeqCst);
            Err(PipelineError::Source("device busy".into()))
        }
    }

    fn display_graph(released: &Arc<AtomicBool>, sink: &MemorySink) -> PipelineGraph {
        let builder = PipelineBuilder::new(SourceSpec::TestPattern, Size::new(64, 48), Size::new(32, 32))
            .headless(false);
        let (topology, plan) = builder.topology().unwrap();
        let source = ReleaseFails {
            inner: TestPatternSource::new(caps(), None),
            released: released.clone(),
        };
        PipelineGraph::new(topology, plan, Box::new(source), Some(Box::new(sink.clone()))).unwrap()
    }

    #[test]
    fn test_drop_playing_graph_releases_despite_errors() {
        let released = Arc::new(AtomicBool::new(false));
        let sink = MemorySink::new();
        let mut graph = display_graph(&released, &sink);
        let (tx, _rx) = bus();
        graph.play(ctx(tx)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(graph);
        // 源释放失败不影响输出的释放
        assert!(released.load(Ordering::SeqCst));
        assert!(sink.is_released());
    }

    #[test]
    fn test_drop_ready_graph_releases() {
        let released = Arc::new(AtomicBool::new(false));
        let sink = MemorySink::new();
        drop(display_graph(&released, &sink));
        assert!(released.load(Ordering::SeqCst));
        assert!(sink.is_released());
    }
}
