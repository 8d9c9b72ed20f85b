/// 标签文件 (Label files)
///
/// 每行 "<id> <label>" 或 "<id>: <label>"; 没有编号的行按行号编号。
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

static LABEL_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[:\s]\s*(.+?)\s*$").ok());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    labels: HashMap<usize, String>,
}

impl LabelMap {
    pub fn parse(text: &str) -> Self {
        let mut labels = HashMap::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match LABEL_LINE.as_ref().and_then(|re| re.captures(line)) {
                Some(caps) => {
                    if let Ok(id) = caps[1].parse::<usize>() {
                        labels.insert(id, caps[2].to_string());
                    }
                }
                None => {
                    labels.insert(index, line.to_string());
                }
            }
        }
        Self { labels }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels {}", path.display()))?;
        let labels = Self::parse(&text);
        tracing::info!(path = %path.display(), count = labels.len(), "labels loaded");
        Ok(labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    /// 找不到标签时退回数字编号
    pub fn name(&self, id: usize) -> Cow<'_, str> {
        match self.get(id) {
            Some(label) => Cow::Borrowed(label),
            None => Cow::Owned(id.to_string()),
        }
    }
}
