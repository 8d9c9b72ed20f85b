/// 叠加层文档 (Overlay document)
///
/// 推理回调用 OverlayRenderer 生成一份不可变的 SVG 文档;
/// 显示分支通过 LatestOverlay 读取当前文档, 整体替换, 从不原地修改。
use crate::frame::Size;
use arc_swap::ArcSwapOption;
use std::fmt::Write as _;
use std::sync::Arc;

/// 文字阴影偏移 (em)
pub const SHADOW_OFFSET_EM: f32 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayElement {
    /// 基线坐标 (x, y), 先画黑色阴影再画白字
    Text {
        x: f32,
        y: f32,
        text: String,
        font_size: f32,
    },
    /// 空心矩形
    Rect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: String,
        stroke_width: f32,
    },
}

/// 已完成的叠加文档
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayDocument {
    size: Size,
    elements: Vec<OverlayElement>,
    markup: String,
}

impl OverlayDocument {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn elements(&self) -> &[OverlayElement] {
        &self.elements
    }

    /// SVG 文本
    pub fn markup(&self) -> &str {
        &self.markup
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// SVG 构建器, 纯函数式: 相同输入产生逐字节相同的输出
#[derive(Debug)]
pub struct OverlayRenderer {
    size: Size,
    elements: Vec<OverlayElement>,
    markup: String,
}

impl OverlayRenderer {
    pub fn begin(width: u32, height: u32) -> Self {
        let mut markup = String::with_capacity(256);
        let _ = write!(markup, r#"<svg width="{}" height="{}" version="1.1" >"#, width, height);
        Self {
            size: Size::new(width, height),
            elements: Vec::new(),
            markup,
        }
    }

    pub fn add_text(&mut self, x: f32, y: f32, text: &str, font_size: f32) -> &mut Self {
        let t = escape(text);
        let _ = write!(
            self.markup,
            r#"<text x="{x}" y="{y}" font-size="{fs}" dx="{off}em" dy="{off}em" fill="black">{t}</text>"#,
            x = x,
            y = y,
            fs = font_size,
            off = SHADOW_OFFSET_EM,
            t = t
        );
        let _ = write!(
            self.markup,
            r#"<text x="{}" y="{}" font-size="{}" fill="white">{}</text>"#,
            x, y, font_size, t
        );
        self.elements.push(OverlayElement::Text {
            x,
            y,
            text: text.to_string(),
            font_size,
        });
        self
    }

    pub fn add_rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: &str,
        stroke_width: f32,
    ) -> &mut Self {
        let _ = write!(
            self.markup,
            r#"<rect x="{}" y="{}" width="{}" height="{}" stroke="{}" stroke-width="{}" fill="none" />"#,
            x,
            y,
            width,
            height,
            escape(stroke),
            stroke_width
        );
        self.elements.push(OverlayElement::Rect {
            x,
            y,
            width,
            height,
            stroke: stroke.to_string(),
            stroke_width,
        });
        self
    }

    pub fn finish(mut self) -> OverlayDocument {
        self.markup.push_str("</svg>");
        OverlayDocument {
            size: self.size,
            elements: self.elements,
            markup: self.markup,
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// 当前叠加层的原子引用, 推理线程写, 显示分支读
#[derive(Debug, Default)]
pub struct LatestOverlay {
    current: ArcSwapOption<OverlayDocument>,
}

impl LatestOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, document: OverlayDocument) {
        self.current.store(Some(Arc::new(document)));
    }

    pub fn current(&self) -> Option<Arc<OverlayDocument>> {
        self.current.load_full()
    }

    pub fn clear(&self) {
        self.current.store(None);
    }
}
