// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17788,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 新建任务使用的下载参数（创建任务时整体拷贝进记录）
    #[serde(default)]
    pub settings: DownloadSettings,
}

fn default_download_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("downloads")
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            settings: DownloadSettings::default(),
        }
    }
}

/// 分片档位：文件大小达到 `min_size` 时使用 `parts` 个分片
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartTier {
    pub min_size: u64,
    pub parts: usize,
}

/// 单个下载任务的参数快照
///
/// 任务创建时从全局配置拷贝一份，之后修改全局配置不影响已存在的任务。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadSettings {
    /// 分片数上限
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
    /// 分片档位表（按 min_size 升序）
    #[serde(default = "default_part_tiers")]
    pub part_tiers: Vec<PartTier>,
    /// 单次写盘缓冲区大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 代理地址（http/https/socks5）
    #[serde(default)]
    pub proxy: Option<String>,
    /// 单任务限速（字节/秒，0 表示不限速）
    #[serde(default)]
    pub max_speed: u64,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 完成后是否计算 SHA-256 校验
    #[serde(default)]
    pub verify_checksum: bool,
    /// 单个分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础间隔（毫秒，线性递增）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单次读取超时（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 进度通知间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 断网时检测网络恢复的间隔（毫秒）
    #[serde(default = "default_network_poll_interval_ms")]
    pub network_poll_interval_ms: u64,
    /// 剩余空间检查时额外预留的字节数
    #[serde(default = "default_min_free_space_margin")]
    pub min_free_space_margin: u64,
}

fn default_max_parts() -> usize {
    8
}

fn default_part_tiers() -> Vec<PartTier> {
    const MB: u64 = 1024 * 1024;
    vec![
        PartTier { min_size: 0, parts: 1 },
        PartTier { min_size: MB, parts: 2 },
        PartTier { min_size: 10 * MB, parts: 4 },
        PartTier { min_size: 100 * MB, parts: 6 },
        PartTier { min_size: 500 * MB, parts: 8 },
    ]
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_network_poll_interval_ms() -> u64 {
    2000
}

fn default_min_free_space_margin() -> u64 {
    16 * 1024 * 1024
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_parts: default_max_parts(),
            part_tiers: default_part_tiers(),
            buffer_size: default_buffer_size(),
            proxy: None,
            max_speed: 0,
            user_agent: default_user_agent(),
            verify_checksum: false,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            network_poll_interval_ms: default_network_poll_interval_ms(),
            min_free_space_margin: default_min_free_space_margin(),
        }
    }
}

impl DownloadSettings {
    /// 根据文件大小计算分片数
    ///
    /// 服务器不支持多线程或大小未知时固定为 1；
    /// 结果限制在 `1..=max_parts` 且不超过文件字节数。
    pub fn part_count_for(&self, file_size: Option<u64>, multi_thread_supported: bool) -> usize {
        let size = match file_size {
            Some(size) if multi_thread_supported && size > 0 => size,
            _ => return 1,
        };

        let tier_parts = self
            .part_tiers
            .iter()
            .filter(|tier| tier.min_size <= size)
            .last()
            .map(|tier| tier.parts)
            .unwrap_or(1);

        let by_size = usize::try_from(size).unwrap_or(usize::MAX);
        tier_parts.clamp(1, self.max_parts.max(1)).min(by_size)
    }

    /// 验证参数合法性
    pub fn validate(&self) -> Result<()> {
        if self.max_parts == 0 {
            anyhow::bail!("max_parts 不能为 0");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size 不能为 0");
        }
        if self.part_tiers.iter().any(|tier| tier.parts == 0) {
            anyhow::bail!("分片档位的 parts 不能为 0");
        }
        if self
            .part_tiers
            .windows(2)
            .any(|pair| pair[0].min_size >= pair[1].min_size)
        {
            anyhow::bail!("分片档位必须按 min_size 严格升序排列");
        }
        if let Some(proxy) = &self.proxy {
            reqwest::Proxy::all(proxy.as_str())
                .with_context(|| format!("代理地址无效: {}", proxy))?;
        }
        Ok(())
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 下载记录存储目录
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
    /// 下载中记录的快照间隔（毫秒）
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("records")
}

fn default_snapshot_interval_ms() -> u64 {
    3000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            download: DownloadConfig::default(),
            persistence: PersistenceConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        config
            .download
            .settings
            .validate()
            .context("配置文件中的下载参数无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .settings
            .validate()
            .context("保存配置失败：下载参数无效")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content).await.context("写入配置文件失败")?;
        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !default_config.download.download_dir.exists() {
                    if let Err(e) = std::fs::create_dir_all(&default_config.download.download_dir) {
                        tracing::error!(
                            "无法创建默认下载目录 {:?}: {}",
                            default_config.download.download_dir,
                            e
                        );
                    } else {
                        tracing::info!(
                            "✓ 已创建默认下载目录: {:?}",
                            default_config.download.download_dir
                        );
                    }
                }

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
