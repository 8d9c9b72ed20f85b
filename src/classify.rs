/// 分类客户端回调 (Classification client callback)
///
/// 每帧: 计时推理 → 文本行 → 状态行 → 类别变化时驱动执行器 → 叠加层。
use crate::actuator::Actuator;
use crate::frame::{CropBox, Frame, Size};
use crate::inference::{InferenceEngine, InferenceResult, LabelMap};
use crate::overlay::{OverlayDocument, OverlayRenderer};
use crate::status::StatusLine;
use crate::worker::FrameHandler;
use std::io::{self, Write};
use std::time::Instant;

pub const DEFAULT_THRESHOLD: f32 = 0.7;
const LINE_HEIGHT: f32 = 20.0;
const FONT_SIZE: f32 = 20.0;

/// "[12.34ms]" + 每个类别 "98.76% - plastic"; 没有结果时 "[12.34ms] (no match)"
pub fn text_lines(result: &InferenceResult, labels: &LabelMap) -> Vec<String> {
    let ms = result.elapsed.as_secs_f64() * 1000.0;
    if result.classes.is_empty() {
        return vec![format!("[{:.2}ms] (no match)", ms)];
    }
    let mut lines = Vec::with_capacity(result.classes.len() + 1);
    lines.push(format!("[{:.2}ms]", ms));
    for class in &result.classes {
        lines.push(format!(
            "{:.2}% - {}",
            class.score * 100.0,
            labels.name(class.id)
        ));
    }
    lines
}

/// 每行文字一行, 从 (10, 20) 开始
pub fn text_overlay(source: Size, lines: &[String]) -> OverlayDocument {
    let mut svg = OverlayRenderer::begin(source.width, source.height);
    for (n, line) in lines.iter().enumerate() {
        svg.add_text(10.0, (n + 1) as f32 * LINE_HEIGHT, line, FONT_SIZE);
    }
    svg.finish()
}

pub struct ClassifyHandler<E: InferenceEngine, W: Write + Send = io::Stdout> {
    engine: E,
    labels: LabelMap,
    top_k: usize,
    threshold: f32,
    status: StatusLine<W>,
    actuator: Box<dyn Actuator>,
    previous: Option<String>, // 上一次的首选类别
}

impl<E: InferenceEngine, W: Write + Send> ClassifyHandler<E, W> {
    pub fn new(
        engine: E,
        labels: LabelMap,
        top_k: usize,
        threshold: f32,
        status: StatusLine<W>,
        actuator: Box<dyn Actuator>,
    ) -> Self {
        Self {
            engine,
            labels,
            top_k: top_k.max(1),
            threshold,
            status,
            actuator,
            previous: None,
        }
    }

    pub fn infer(&mut self, frame: &Frame) -> anyhow::Result<InferenceResult> {
        let start = Instant::now();
        self.engine.run(&frame.image)?;
        let classes = self.engine.classes(self.top_k, self.threshold);
        Ok(InferenceResult {
            classes,
            elapsed: start.elapsed(),
        })
    }

    /// 首选类别变化时才通知执行器; 变为 "无结果" 时只记录
    fn notify_actuator(&mut self, result: &InferenceResult) {
        let top = result
            .classes
            .first()
            .map(|c| self.labels.name(c.id).into_owned());
        if top == self.previous {
            return;
        }
        if let Some(category) = top.as_deref() {
            self.actuator.actuate(category);
        }
        self.previous = top;
    }
}

impl<E: InferenceEngine, W: Write + Send> FrameHandler for ClassifyHandler<E, W> {
    fn handle(
        &mut self,
        frame: &Frame,
        source: Size,
        _crop: CropBox,
    ) -> anyhow::Result<Option<OverlayDocument>> {
        let result = self.infer(frame)?;
        let lines = text_lines(&result, &self.labels);
        self.status.update(&lines.join(" "))?;
        self.notify_actuator(&result);
        Ok(Some(text_overlay(source, &lines)))
    }
}

impl<E: InferenceEngine, W: Write + Send> Drop for ClassifyHandler<E, W> {
    fn drop(&mut self) {
        let _ = self.status.finish();
    }
}
