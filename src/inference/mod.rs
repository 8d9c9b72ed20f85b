/// 推理引擎接口 (Inference engine interface)
///
/// 引擎本身是外部协作者; 这里只定义分类/检测结果与取 top-k、NMS 等后处理。
pub mod labels;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use labels::LabelMap;

use crate::frame::Size;
use image::RgbImage;
use std::time::Duration;

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Class {
    pub id: usize,
    pub score: f32, // [0, 1]
}

/// 一次分类推理的结果 (不超过 top_k 条, 按分数降序)
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub classes: Vec<Class>,
    pub elapsed: Duration,
}

/// 张量坐标系下的检测框
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.xmin.is_finite()
            && self.ymin.is_finite()
            && self.xmax.is_finite()
            && self.ymax.is_finite()
            && self.xmax > self.xmin
            && self.ymax > self.ymin
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let l = self.xmin.max(other.xmin);
        let r = self.xmax.min(other.xmax);
        let t = self.ymin.max(other.ymin);
        let b = self.ymax.min(other.ymax);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn union(&self, other: &BBox) -> f32 {
        self.area() + other.area() - self.intersection_area(other)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let union = self.union(other);
        if union <= 0.0 {
            0.0
        } else {
            self.intersection_area(other) / union
        }
    }
}

/// 检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedObject {
    pub id: usize,
    pub score: f32,
    pub bbox: BBox,
}

/// 分类引擎
pub trait InferenceEngine: Send {
    /// 分配张量, 在第一次 run 之前调用
    fn allocate(&mut self) -> anyhow::Result<()>;

    /// 模型输入尺寸
    fn input_size(&self) -> Size;

    fn run(&mut self, image: &RgbImage) -> anyhow::Result<()>;

    /// 分数不低于阈值的前 top_k 个类别, 降序
    fn classes(&self, top_k: usize, threshold: f32) -> Vec<Class>;
}

/// 检测引擎
pub trait ObjectDetector: InferenceEngine {
    fn objects(&self, threshold: f32) -> Vec<DetectedObject>;
}

/// 取分数不低于阈值的前 top_k 个类别
pub fn top_classes(scores: &[f32], top_k: usize, threshold: f32) -> Vec<Class> {
    let mut classes: Vec<Class> = scores
        .iter()
        .enumerate()
        .filter(|(_, &score)| score >= threshold)
        .map(|(id, &score)| Class { id, score })
        .collect();
    classes.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    classes.truncate(top_k);
    classes
}

/// 数值稳定的 softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}

/// 非极大值抑制, 按分数降序保留
pub fn non_max_suppression(objects: &mut Vec<DetectedObject>, iou_threshold: f32) {
    objects.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut current_index = 0;
    for index in 0..objects.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if objects[prev_index].id != objects[index].id {
                continue;
            }
            let iou = objects[prev_index].bbox.iou(&objects[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            objects.swap(current_index, index);
            current_index += 1;
        }
    }
    objects.truncate(current_index);
}
