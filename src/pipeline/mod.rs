/// 视频处理流水线 (Video Processing Pipeline)
///
/// - topology: 拓扑与缩放计划 (PipelineBuilder)
/// - source:   采集源 (ffmpeg / 测试图案)
/// - elements: 转换、缩放、自动裁剪、漏桶队列
/// - sink:     显示分支输出
/// - graph:    线程化的流水线图
/// - bus:      总线消息与 BusMonitor
pub mod bus;
pub mod elements;
pub mod graph;
pub mod sink;
pub mod source;
pub mod topology;

pub use bus::{bus, BusEvent, BusMonitor, BusReceiver, BusSender, StopSignal};
pub use graph::{GraphContext, GraphState, PipelineGraph, Released};
pub use sink::{EncoderSink, FrameSink, MemorySink, NullSink};
pub use source::{open_source, FfmpegSource, FrameSource, TestPatternSource};
pub use topology::{Caps, PipelineBuilder, ScalePlan, SourceSpec, Stage, Topology};
