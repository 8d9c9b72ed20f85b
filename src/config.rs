/// 命令行参数与流水线配置 (CLI arguments and pipeline configuration)
///
/// 可调参数保存在 JSON 文件中; 命令行显式给出的值覆盖文件中的值。
use crate::error::{PipelineError, Result};
use crate::frame::Size;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// `--output` 不带值时的占位, 由 sink::recording_path 换成带时间戳的文件名
pub const AUTO_RECORDING: &str = "auto";

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// ONNX model file
    #[arg(long, required = true)]
    pub model: PathBuf,

    /// label file, one "<id> <label>" per line
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// number of categories with highest score to report
    #[arg(long = "top-k", alias = "top_k", default_value_t = 1)]
    pub top_k: usize,

    /// score threshold (defaults per client)
    #[arg(long)]
    pub threshold: Option<f32>,

    /// video source: /dev/videoN, a camera index, a stream URL, or "test"
    #[arg(long, default_value_t = String::from("/dev/video0"))]
    pub videosrc: String,

    /// run without the presentation branch
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub headless: bool,

    /// source width
    #[arg(long)]
    pub width: Option<u32>,

    /// source height
    #[arg(long)]
    pub height: Option<u32>,

    /// source frame rate
    #[arg(long)]
    pub framerate: Option<u32>,

    /// override the model input size, e.g. 224
    #[arg(long)]
    pub input_size: Option<u32>,

    /// TTF/OTF font used to draw overlay text
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// record composited frames to this file (display mode);
    /// without a value a timestamped classibin-*.mp4 is used
    #[arg(long, num_args = 0..=1, default_missing_value = AUTO_RECORDING)]
    pub output: Option<String>,

    /// stop after this many frames (test source only)
    #[arg(long)]
    pub frame_limit: Option<u64>,

    /// drive the sorting actuator on category changes
    #[arg(long, default_value_t = false)]
    pub actuate: bool,

    /// pipeline config file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// debug logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// 流水线参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 采集参数 ===
    pub source_width: u32,  // 采集宽度
    pub source_height: u32, // 采集高度
    pub framerate: u32,     // 帧率
    pub frame_limit: Option<u64>,

    // === 推理参数 ===
    pub input_size: Option<u32>, // 为空时使用模型输入尺寸

    // === 叠加层参数 ===
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub box_stroke: String,
    pub box_stroke_width: f32,

    // === 输出 ===
    pub output: Option<String>,
    pub ffmpeg_bin: String,
    pub bus_poll_ms: u64, // 主循环轮询总线的间隔
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_width: 640,
            source_height: 480,
            framerate: 30,
            frame_limit: None,

            input_size: None,

            font_path: None,
            font_size: 20.0,
            box_stroke: "red".to_string(),
            box_stroke_width: 2.0,

            output: None,
            ffmpeg_bin: "ffmpeg".to_string(),
            bus_poll_ms: 50,
        }
    }
}

impl PipelineConfig {
    /// 默认配置文件位置: <config_dir>/classibin/pipeline.json
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("classibin").join("pipeline.json"))
    }

    /// 从JSON文件加载配置; 文件不存在时返回默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&json)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        fs::write(path, json)?;
        tracing::info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// 命令行显式参数覆盖文件值
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(w) = args.width {
            self.source_width = w;
        }
        if let Some(h) = args.height {
            self.source_height = h;
        }
        if let Some(f) = args.framerate {
            self.framerate = f;
        }
        if args.frame_limit.is_some() {
            self.frame_limit = args.frame_limit;
        }
        if args.input_size.is_some() {
            self.input_size = args.input_size;
        }
        if args.font.is_some() {
            self.font_path = args.font.clone();
        }
        if args.output.is_some() {
            self.output = args.output.clone();
        }
    }

    pub fn source_size(&self) -> Size {
        Size::new(self.source_width, self.source_height)
    }

    /// 读取 --config 指定的文件或默认位置, 再叠加命令行参数
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut config = match args.config.as_ref() {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) => Self::load(path)?,
                None => Self::default(),
            },
        };
        config.apply_args(args);
        Ok(config)
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        tracing::info!(
            source = %self.source_size(),
            framerate = self.framerate,
            input_size = ?self.input_size,
            font = ?self.font_path,
            output = ?self.output,
            "pipeline config"
        );
    }
}
