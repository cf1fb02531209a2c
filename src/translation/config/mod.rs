//! 翻译配置管理模块
//!
//! 提供简化的配置管理，支持环境变量、配置文件和默认值

pub mod manager;

// 重新导出主要类型
pub use manager::{ConfigManager, TranslationConfig};

/// 配置常量
pub mod constants {
    use std::time::Duration;

    // 批次处理相关
    pub const MAX_BATCH_UNITS: usize = 50;
    pub const MAX_BATCH_CHARS: usize = 4000;
    pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;

    // 默认API设置
    pub const DEFAULT_API_URL: &str = "http://localhost:1188/translate";
    pub const DEFAULT_TARGET_LANG: &str = "zh";
    pub const DEFAULT_SOURCE_LANG: &str = "auto";
    pub const DEFAULT_MAX_REQUESTS_PER_SECOND: f64 = 5.0;
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    // 重试策略
    pub const DEFAULT_MAX_RETRY_ATTEMPTS: usize = 3;
    pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
    pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
    /// 抖动上限，按当前延迟的比例计算
    pub const RETRY_JITTER_RATIO: f64 = 0.25;

    // 写回设置
    pub const DEFAULT_WRITES_PER_TRANSACTION: usize = 100;
    pub const DEFAULT_TRANSACTION_NAME: &str = "Translate text";

    // 缓存设置
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600); // 1小时
    pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 1000;

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "cad-translator.toml",
        ".cad-translator.toml",
        "translation-config.toml",
        "~/.config/cad-translator/translation.toml",
        "/etc/cad-translator/translation.toml",
    ];

    // 环境变量文件，按优先级排列
    pub const ENV_FILES: &[&str] = &[".env.local", ".env.development", ".env.production", ".env"];
}

/// 便利函数
pub fn config_file_exists() -> bool {
    constants::CONFIG_PATHS
        .iter()
        .any(|path| std::path::Path::new(shellexpand::tilde(path).as_ref()).exists())
}

/// 加载配置，失败时回退到默认值
pub fn load_translation_config(target_lang: Option<&str>) -> TranslationConfig {
    let mut config = match ConfigManager::new() {
        Ok(manager) => manager.into_config(),
        Err(e) => {
            tracing::warn!("配置加载失败，使用默认配置: {}", e);
            TranslationConfig::default()
        }
    };

    if let Some(lang) = target_lang {
        config.target_lang = lang.to_string();
    }
    config
}
