//! 数据通道上的文件传输协议
//!
//! 一次传输的帧序列:
//! 1. 文本帧 `{"type":"FILE_METADATA","name":..,"size":..,"mimeType":..,"totalChunks":..}`
//! 2. `totalChunks` 个二进制帧，原始字节，按到达顺序拼接
//! 3. 文本帧 `{"type":"FILE_COMPLETE"}`
//!
//! 没有序号和校验，依赖通道的有序可靠投递。

use serde::{Deserialize, Serialize};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

/// 文本控制帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    FileMetadata {
        name: String,
        size: u64,
        #[serde(default = "default_mime_type")]
        mime_type: String,
        #[serde(default)]
        total_chunks: u64,
    },
    FileComplete,
}

impl ControlFrame {
    pub fn metadata(name: &str, size: u64, mime_type: &str, chunk_size: usize) -> Self {
        ControlFrame::FileMetadata {
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
            total_chunks: total_chunks(size, chunk_size),
        }
    }

    pub fn to_json(&self) -> String {
        // 只含字符串和整数，序列化不会失败
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 解析文本帧；非 JSON 或未知类型返回 `None`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// 块数 = ceil(size / chunk_size)，空文件为 0
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// 第 `index` 块（从 0 开始）的字节数
pub fn chunk_len(size: u64, chunk_size: usize, index: u64) -> usize {
    let offset = index.saturating_mul(chunk_size as u64);
    let remaining = size.saturating_sub(offset);
    // remaining 不超过 chunk_size 时才会截断
    usize::try_from(remaining.min(chunk_size as u64)).unwrap_or(chunk_size)
}
