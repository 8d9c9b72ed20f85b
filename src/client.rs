/// 客户端启动流程 (Client launch sequence)
///
/// classify 与 detect 共用: 打开采集源 → 组装流水线 → 启动 → 分发总线直到停止。
use crate::compose::OverlayCompositor;
use crate::config::{Args, PipelineConfig};
use crate::error::StopReason;
use crate::frame::Size;
use crate::lifecycle::PipelineLifecycle;
use crate::pipeline::sink::recording_path;
use crate::pipeline::{bus, open_source, EncoderSink, FrameSink, PipelineBuilder, SourceSpec, StopSignal};
use crate::worker::FrameHandler;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// 字体未配置时返回无字体的合成器
pub fn load_compositor(config: &PipelineConfig) -> Result<OverlayCompositor> {
    match config.font_path.as_ref() {
        Some(path) => OverlayCompositor::from_font_file(path),
        None => {
            tracing::warn!("no --font given, overlay text will not be drawn");
            Ok(OverlayCompositor::new(None))
        }
    }
}

/// 模型输入尺寸: 配置优先, 否则用客户端默认值
pub fn input_size(config: &PipelineConfig, fallback: u32) -> Size {
    let side = config.input_size.unwrap_or(fallback);
    Size::new(side, side)
}

/// 按参数组装并运行流水线, 返回停止原因
pub fn run_client<H>(
    args: &Args,
    config: &PipelineConfig,
    target: Size,
    signal: Arc<StopSignal>,
    handler: H,
) -> Result<StopReason>
where
    H: FrameHandler + 'static,
{
    let spec = SourceSpec::parse(&args.videosrc);
    let builder = PipelineBuilder::new(spec.clone(), config.source_size(), target)
        .headless(args.headless)
        .framerate(config.framerate);
    // 先校验拓扑, 避免打开设备后才发现参数非法
    let (topology, _) = builder.topology()?;
    tracing::info!("{}", topology.describe());

    let compositor = load_compositor(config)?;
    let (bus_tx, bus_rx) = bus();
    let source = open_source(
        &spec,
        builder.caps(),
        &config.ffmpeg_bin,
        config.frame_limit,
        Some(bus_tx.clone()),
    )
    .with_context(|| format!("failed to open video source {}", spec))?;

    let sink: Option<Box<dyn FrameSink>> = match (args.headless, config.output.as_deref()) {
        (false, Some(output)) => Some(Box::new(EncoderSink::open(
            &config.ffmpeg_bin,
            builder.caps(),
            &recording_path(output),
        )?)),
        (true, Some(_)) => {
            tracing::warn!("--output ignored in headless mode");
            None
        }
        _ => None,
    };

    let mut pipeline =
        PipelineLifecycle::with_bus(&builder, source, sink, compositor, signal, (bus_tx, bus_rx))?
            .with_poll_interval(Duration::from_millis(config.bus_poll_ms.max(1)));
    pipeline.start(handler)?;
    let reason = pipeline.run()?;
    if let Some(stats) = pipeline.worker_stats() {
        tracing::info!(
            processed = stats.processed,
            published = stats.published,
            failed = stats.failed,
            "session summary"
        );
    }
    Ok(reason)
}

/// Ctrl+C 请求协作式停止
pub fn install_interrupt(signal: &Arc<StopSignal>) -> Result<()> {
    let signal = signal.clone();
    ctrlc::set_handler(move || {
        if signal.request(StopReason::Interrupted) {
            tracing::info!("interrupt received, stopping");
        }
    })
    .context("failed to install Ctrl+C handler")
}
