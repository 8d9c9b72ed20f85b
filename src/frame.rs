/// 帧与几何类型 (Frame and geometry types)
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 图像尺寸 (宽, 高)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 源图像在缩放后图像中的位置 (videobox 语义的反向描述)
///
/// `x`/`y` 为负表示缩放图像比目标框大, 被对称裁剪;
/// 为正表示四周补黑边。推理回调用它把张量坐标换算回源图像坐标。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    /// 张量坐标 → 源图像坐标
    pub fn to_source(&self, source: Size, x: f32, y: f32) -> (f32, f32) {
        let sx = (x - self.x as f32) * source.width as f32 / self.width as f32;
        let sy = (y - self.y as f32) * source.height as f32 / self.height as f32;
        (sx, sy)
    }

    /// 张量空间的长度 → 源图像长度
    pub fn scale_to_source(&self, source: Size, w: f32, h: f32) -> (f32, f32) {
        (
            w * source.width as f32 / self.width as f32,
            h * source.height as f32 / self.height as f32,
        )
    }
}

/// 原始像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// 采集端解码出的原始帧
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub size: Size,
    pub format: PixelFormat,
}

impl RawFrame {
    pub fn expected_len(size: Size, format: PixelFormat) -> usize {
        size.area() * format.bytes_per_pixel()
    }
}

/// 送入推理的帧: 创建后不可变, 可廉价克隆
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub sequence: u64, // 帧序号
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_box_to_source() {
        // 640x480 → 224x224: 缩放图像 224x168 居中, 上下各 28 像素黑边
        let crop = CropBox {
            x: 0,
            y: 28,
            width: 224,
            height: 168,
        };
        let source = Size::new(640, 480);
        let (x, y) = crop.to_source(source, 112.0, 112.0);
        assert!((x - 320.0).abs() < 1e-3);
        assert!((y - 240.0).abs() < 1e-3);

        let (x, y) = crop.to_source(source, 0.0, 28.0);
        assert_eq!((x, y), (0.0, 0.0));
    }

    #[test]
    fn test_size_display() {
        assert_eq!(Size::new(640, 480).to_string(), "640x480");
        assert!(Size::new(0, 480).is_empty());
    }
}
