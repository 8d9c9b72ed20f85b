#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod actuator; // 分拣执行器
pub mod classify; // 分类客户端
pub mod client; // 客户端启动流程
pub mod compose; // 叠加层合成
pub mod config; // 命令行与配置文件
pub mod detect; // 检测客户端
pub mod error; // 错误类型
pub mod exchange; // 最新帧交换槽
pub mod frame; // 帧与尺寸
pub mod inference; // 推理引擎接口与 ONNX 实现
pub mod lifecycle; // 流水线生命周期
pub mod overlay; // SVG 叠加层
pub mod pipeline; // 视频处理流水线
pub mod status; // 终端状态行
pub mod telemetry; // 日志
pub mod worker; // 推理工作线程

pub use crate::config::{Args, PipelineConfig};
pub use crate::error::{InferenceError, PipelineError, StopReason};
pub use crate::exchange::FrameExchange;
pub use crate::frame::{CropBox, Frame, Size};
pub use crate::lifecycle::{PipelineLifecycle, PipelineState};
pub use crate::overlay::{LatestOverlay, OverlayDocument, OverlayRenderer};
pub use crate::pipeline::{BusMonitor, PipelineBuilder, SourceSpec};
pub use crate::status::StatusLine;
pub use crate::worker::{FrameHandler, InferenceWorker};
