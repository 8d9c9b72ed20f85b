/// 流水线拓扑 (Pipeline topology)
///
/// 无头模式: 采集 → 解码 → 转换 → 缩放 → 自动裁剪 → 推理汇
/// 显示模式: 采集 → tee → {漏桶队列 → 推理分支, 漏桶队列 → 叠加显示分支}
use crate::error::{PipelineError, Result};
use crate::frame::{CropBox, Size};
use std::fmt;
use std::path::PathBuf;

/// 漏桶队列容量: 只保留最新一帧
pub const LEAKY_QUEUE_CAPACITY: usize = 1;

/// 采集源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// V4L2 设备, 如 /dev/video0
    Device(PathBuf),
    /// ffmpeg 能打开的 URL 或文件
    Stream(String),
    /// 合成测试图案
    TestPattern,
}

impl SourceSpec {
    /// 解析设备标识: "test"、纯数字索引、/dev/videoN 或 URL
    pub fn parse(id: &str) -> Self {
        let id = id.trim();
        if id.eq_ignore_ascii_case("test") || id.eq_ignore_ascii_case("videotestsrc") {
            SourceSpec::TestPattern
        } else if let Ok(index) = id.parse::<u32>() {
            SourceSpec::Device(PathBuf::from(format!("/dev/video{}", index)))
        } else if id.starts_with("/dev/") {
            SourceSpec::Device(PathBuf::from(id))
        } else {
            SourceSpec::Stream(id.to_string())
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Device(path) => write!(f, "v4l2src device={}", path.display()),
            SourceSpec::Stream(url) => write!(f, "uridecodebin uri={}", url),
            SourceSpec::TestPattern => write!(f, "videotestsrc"),
        }
    }
}

/// 采集格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    pub size: Size,
    pub framerate: u32,
}

/// 缩放与裁剪计划
///
/// s = min(Wi/Ws, Hi/Hs), 缩放尺寸取四舍五入, 再居中放入目标框。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePlan {
    pub source: Size,
    pub target: Size,
    pub scale: f64,
    pub scaled: Size,
    pub crop: CropBox,
}

impl ScalePlan {
    pub fn new(source: Size, target: Size) -> Result<Self> {
        if source.is_empty() {
            return Err(PipelineError::construction(format!(
                "invalid source size {}",
                source
            )));
        }
        if target.is_empty() {
            return Err(PipelineError::construction(format!(
                "invalid inference size {}",
                target
            )));
        }
        let scale = f64::min(
            target.width as f64 / source.width as f64,
            target.height as f64 / source.height as f64,
        );
        let scaled = Size::new(
            ((source.width as f64 * scale).round() as u32).max(1),
            ((source.height as f64 * scale).round() as u32).max(1),
        );
        // 正值为补边, 负值为裁剪; 奇数差额时多出的一像素在右/下
        let crop = CropBox {
            x: (target.width as i32 - scaled.width as i32) / 2,
            y: (target.height as i32 - scaled.height as i32) / 2,
            width: scaled.width,
            height: scaled.height,
        };
        Ok(Self {
            source,
            target,
            scale,
            scaled,
            crop,
        })
    }
}

/// 流水线阶段
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Decode,
    Convert,
    Scale { to: Size },
    Autocrop { to: Size },
    LeakyQueue { capacity: usize },
    ComposeOverlay,
    InferenceSink,
    PresentationSink,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => write!(f, "decodebin"),
            Stage::Convert => write!(f, "videoconvert"),
            Stage::Scale { to } => write!(
                f,
                "videoscale ! video/x-raw,width={},height={}",
                to.width, to.height
            ),
            Stage::Autocrop { to } => write!(
                f,
                "videobox autocrop=true ! video/x-raw,width={},height={}",
                to.width, to.height
            ),
            Stage::LeakyQueue { capacity } => {
                write!(f, "queue max-size-buffers={} leaky=downstream", capacity)
            }
            Stage::ComposeOverlay => write!(f, "overlay"),
            Stage::InferenceSink => write!(f, "appsink max-buffers=1 drop=true"),
            Stage::PresentationSink => write!(f, "presentationsink"),
        }
    }
}

/// 两种拓扑, 封闭变体
#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    Headless {
        source: SourceSpec,
        caps: Caps,
        chain: Vec<Stage>,
    },
    Display {
        source: SourceSpec,
        caps: Caps,
        inference: Vec<Stage>,
        presentation: Vec<Stage>,
    },
}

impl Topology {
    pub fn source(&self) -> &SourceSpec {
        match self {
            Topology::Headless { source, .. } | Topology::Display { source, .. } => source,
        }
    }

    pub fn caps(&self) -> Caps {
        match self {
            Topology::Headless { caps, .. } | Topology::Display { caps, .. } => *caps,
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, Topology::Headless { .. })
    }

    /// gst-launch 风格的可读描述, 仅用于日志
    pub fn describe(&self) -> String {
        let join = |stages: &[Stage]| {
            stages
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" ! ")
        };
        let head = |source: &SourceSpec, caps: &Caps| {
            format!(
                "{} ! video/x-raw,width={},height={},framerate={}/1",
                source, caps.size.width, caps.size.height, caps.framerate
            )
        };
        match self {
            Topology::Headless {
                source,
                caps,
                chain,
            } => format!("{} ! {}", head(source, caps), join(chain)),
            Topology::Display {
                source,
                caps,
                inference,
                presentation,
            } => format!(
                "{} ! tee name=t  t. ! {}  t. ! {}",
                head(source, caps),
                join(inference),
                join(presentation)
            ),
        }
    }
}

/// 流水线构建器
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    source: SourceSpec,
    caps: Caps,
    target: Size,
    headless: bool,
}

impl PipelineBuilder {
    pub fn new(source: SourceSpec, source_size: Size, target: Size) -> Self {
        Self {
            source,
            caps: Caps {
                size: source_size,
                framerate: 30,
            },
            target,
            headless: true,
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn framerate(mut self, framerate: u32) -> Self {
        self.caps.framerate = framerate;
        self
    }

    pub fn source_spec(&self) -> &SourceSpec {
        &self.source
    }

    pub fn caps(&self) -> Caps {
        self.caps
    }

    pub fn plan(&self) -> Result<ScalePlan> {
        ScalePlan::new(self.caps.size, self.target)
    }

    /// 生成拓扑; 尺寸或帧率非法时返回构建错误
    pub fn topology(&self) -> Result<(Topology, ScalePlan)> {
        if self.caps.framerate == 0 {
            return Err(PipelineError::construction("framerate must be positive"));
        }
        let plan = self.plan()?;
        let to_inference = vec![
            Stage::Convert,
            Stage::Scale { to: plan.scaled },
            Stage::Autocrop { to: plan.target },
            Stage::InferenceSink,
        ];
        let topology = if self.headless {
            let mut chain = vec![Stage::Decode];
            chain.extend(to_inference);
            Topology::Headless {
                source: self.source.clone(),
                caps: self.caps,
                chain,
            }
        } else {
            let mut inference = vec![Stage::LeakyQueue {
                capacity: LEAKY_QUEUE_CAPACITY,
            }];
            inference.extend(to_inference);
            Topology::Display {
                source: self.source.clone(),
                caps: self.caps,
                inference,
                presentation: vec![
                    Stage::LeakyQueue {
                        capacity: LEAKY_QUEUE_CAPACITY,
                    },
                    Stage::Convert,
                    Stage::ComposeOverlay,
                    Stage::Convert,
                    Stage::PresentationSink,
                ],
            }
        };
        Ok((topology, plan))
    }
}
