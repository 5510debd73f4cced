//! 应用配置和持久化
//!
//! 提供服务地址、设备类型、传输参数（块大小、水位线）等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::ChannelOptions;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 设备类型，会话创建/加入时上报给服务端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Mobile,
    #[default]
    Desktop,
    Tablet,
}

impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "MOBILE",
            DeviceType::Desktop => "DESKTOP",
            DeviceType::Tablet => "TABLET",
        }
    }
}

/// 文件传输参数
///
/// 水位线有两套预设: 默认（16 MiB/1 MiB）和 [`TransferConfig::conservative`]
/// （256 KiB/64 KiB）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// 每个二进制帧的最大字节数
    pub chunk_size: usize,
    /// `buffered_amount` 达到该值时暂停发送
    pub high_water_mark: usize,
    /// 暂停后 `buffered_amount` 低于该值才恢复
    pub low_water_mark: usize,
    /// 背压轮询间隔（毫秒）
    pub backpressure_poll_interval_ms: u64,
    /// 进度发布的最小间隔（毫秒）
    pub progress_interval_ms: u64,
    /// 每发送多少块主动让出一次执行权
    pub yield_every_chunks: u64,
    /// 每多少块打一条进度日志
    pub log_every_chunks: u64,
    /// 收到 FILE_COMPLETE 时是否校验字节数
    pub strict_size_check: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: 16 * 1024 * 1024,
            low_water_mark: 1024 * 1024,
            backpressure_poll_interval_ms: 10,
            progress_interval_ms: 100,
            yield_every_chunks: 100,
            log_every_chunks: 50,
            strict_size_check: false,
        }
    }
}

impl TransferConfig {
    /// 较小缓冲区的预设（256 KiB / 64 KiB）
    pub fn conservative() -> Self {
        Self {
            high_water_mark: 256 * 1024,
            low_water_mark: 64 * 1024,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 校验参数组合是否合法
    ///
    /// 低水位必须大于零，否则暂停后的 `buffered < low` 永远不成立。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.low_water_mark == 0 {
            return Err(ConfigError::ZeroLowWaterMark);
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(ConfigError::InvertedWatermarks {
                low: self.low_water_mark,
                high: self.high_water_mark,
            });
        }
        Ok(())
    }
}

/// 连接协商参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// 等待候选收集完成的上限（毫秒）
    pub ice_gather_timeout_ms: u64,
    /// 数据通道标签
    pub channel_label: String,
    pub channel: ChannelOptions,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_gather_timeout_ms: 5000,
            channel_label: "fileTransfer".to_string(),
            channel: ChannelOptions::default(),
        }
    }
}

impl NegotiationConfig {
    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 会话 REST 接口地址
    pub api_base_url: String,
    /// 信令 WebSocket 地址
    pub ws_url: String,
    /// 设备类型
    pub device_type: DeviceType,
    /// 设备名称（作为 userAgent 上报）
    pub device_name: String,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 收到 PEER_JOINED 后是否自动发起协商
    pub auto_initiate: bool,
    pub transfer: TransferConfig,
    pub negotiation: NegotiationConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/v1".to_string(),
            ws_url: "ws://localhost:8080/signal".to_string(),
            device_type: DeviceType::Desktop,
            device_name: get_default_device_name(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_initiate: true,
            transfer: TransferConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("anyshare");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppSettings>(&content) {
                    Ok(settings) => {
                        if let Err(e) = settings.transfer.validate() {
                            log::warn!("Invalid transfer settings: {}, using defaults", e);
                            return Self {
                                transfer: TransferConfig::default(),
                                ..settings
                            };
                        }
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "AnyShare".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_presets() {
        let default = TransferConfig::default();
        assert_eq!(default.chunk_size, 64 * 1024);
        assert_eq!(default.high_water_mark, 16 * 1024 * 1024);
        assert_eq!(default.low_water_mark, 1024 * 1024);
        assert!(default.validate().is_ok());

        let small = TransferConfig::conservative();
        assert_eq!(small.high_water_mark, 256 * 1024);
        assert_eq!(small.low_water_mark, 64 * 1024);
        assert!(small.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let config = TransferConfig {
            high_water_mark: 1024,
            low_water_mark: 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvertedWatermarks {
                low: 1024,
                high: 1024
            })
        );

        let config = TransferConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroChunkSize));

        // 低水位为零时暂停后无法恢复
        let config = TransferConfig {
            high_water_mark: 1,
            low_water_mark: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroLowWaterMark));
    }

    #[test]
    fn test_device_type_serialization() {
        assert_eq!(
            serde_json::to_string(&DeviceType::Mobile).unwrap(),
            "\"MOBILE\""
        );
        assert_eq!(DeviceType::default().name(), "DESKTOP");
    }

    #[test]
    fn test_settings_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let settings = AppSettings {
            api_base_url: "http://example.test/api/v1".to_string(),
            transfer: TransferConfig::conservative(),
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = AppSettings::load_from(&path);
        assert_eq!(loaded.api_base_url, "http://example.test/api/v1");
        assert_eq!(loaded.transfer, TransferConfig::conservative());
        assert_eq!(loaded.negotiation, NegotiationConfig::default());
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        let loaded = AppSettings::load_from(&path);
        assert_eq!(loaded.transfer, TransferConfig::default());
    }

    #[test]
    fn test_invalid_watermarks_in_file_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "[transfer]\nhigh_water_mark = 10\nlow_water_mark = 20\n",
        )
        .unwrap();

        let loaded = AppSettings::load_from(&path);
        assert_eq!(loaded.transfer, TransferConfig::default());
    }

    #[test]
    fn test_zero_low_water_mark_in_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "[transfer]\nhigh_water_mark = 1\nlow_water_mark = 0\n").unwrap();

        let loaded = AppSettings::load_from(&path);
        assert_eq!(loaded.transfer, TransferConfig::default());
    }
}
