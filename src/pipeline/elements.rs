/// 流水线元件 (Pipeline elements)
///
/// 颜色转换、fast_image_resize 缩放、居中自动裁剪、容量为 1 的漏桶队列。
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, PixelFormat, RawFrame, Size};
use crate::pipeline::topology::ScalePlan;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use fast_image_resize as fr;
use image::{imageops, RgbImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 原始帧 → RGB 图像 (videoconvert)
pub fn convert(raw: &RawFrame) -> Result<RgbImage> {
    let expected = RawFrame::expected_len(raw.size, raw.format);
    if raw.data.len() != expected {
        return Err(PipelineError::Source(format!(
            "frame buffer is {} bytes, expected {} for {} {:?}",
            raw.data.len(),
            expected,
            raw.size,
            raw.format
        )));
    }
    let rgb = match raw.format {
        PixelFormat::Rgb24 => raw.data.clone(),
        PixelFormat::Bgr24 => raw
            .data
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect(),
        PixelFormat::Rgba => raw
            .data
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
    };
    RgbImage::from_raw(raw.size.width, raw.size.height, rgb)
        .ok_or_else(|| PipelineError::Source("failed to wrap frame buffer".into()))
}

/// 双线性缩放, 复用 Resizer 内部缓冲
pub struct Scaler {
    resizer: fr::Resizer,
    options: fr::ResizeOptions,
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
            options: fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        }
    }

    pub fn scale(&mut self, image: &RgbImage, to: Size) -> Result<RgbImage> {
        if image.dimensions() == (to.width, to.height) {
            return Ok(image.clone());
        }
        let src = fr::images::ImageRef::new(
            image.width(),
            image.height(),
            image.as_raw(),
            fr::PixelType::U8x3,
        )
        .map_err(|e| PipelineError::Source(format!("resize source: {}", e)))?;
        let mut dst = fr::images::Image::new(to.width, to.height, fr::PixelType::U8x3);
        self.resizer
            .resize(&src, &mut dst, &self.options)
            .map_err(|e| PipelineError::Source(format!("resize failed: {}", e)))?;
        RgbImage::from_raw(to.width, to.height, dst.into_vec())
            .ok_or_else(|| PipelineError::Source("resize produced a short buffer".into()))
    }
}

/// 居中放入目标框: 小则补黑边, 大则对称裁剪 (videobox autocrop)
pub fn autocrop(image: &RgbImage, target: Size) -> RgbImage {
    if image.dimensions() == (target.width, target.height) {
        return image.clone();
    }
    let mut canvas = RgbImage::new(target.width, target.height);
    let x = (target.width as i64 - image.width() as i64) / 2;
    let y = (target.height as i64 - image.height() as i64) / 2;
    imageops::replace(&mut canvas, image, x, y);
    canvas
}

/// 推理分支: 转换 → 缩放 → 自动裁剪
pub struct InferencePrep {
    plan: ScalePlan,
    scaler: Scaler,
}

impl InferencePrep {
    pub fn new(plan: ScalePlan) -> Self {
        Self {
            plan,
            scaler: Scaler::new(),
        }
    }

    pub fn plan(&self) -> &ScalePlan {
        &self.plan
    }

    pub fn process(&mut self, raw: &RawFrame, sequence: u64) -> Result<Frame> {
        let rgb = convert(raw)?;
        self.process_rgb(&rgb, sequence)
    }

    pub fn process_rgb(&mut self, rgb: &RgbImage, sequence: u64) -> Result<Frame> {
        let scaled = self.scaler.scale(rgb, self.plan.scaled)?;
        Ok(Frame::new(autocrop(&scaled, self.plan.target), sequence))
    }
}

/// 漏桶队列写端: 满时丢弃最旧的元素, 写入从不阻塞
pub struct LeakySender<T> {
    tx: Sender<T>,
    drain: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for LeakySender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            drain: self.drain.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> LeakySender<T> {
    pub fn push(&self, mut item: T) {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.drain.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// 创建漏桶队列 (queue max-size-buffers=N leaky=downstream)
pub fn leaky_queue<T>(capacity: usize) -> (LeakySender<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        LeakySender {
            tx,
            drain: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
