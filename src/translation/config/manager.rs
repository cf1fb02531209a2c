//! 配置管理器
//!
//! 提供统一的配置接口，支持文件配置、环境变量和默认值。
//! 优先级：环境变量 > 配置文件 > 默认值。

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::translation::error::{TranslationError, TranslationResult};

/// 翻译配置
///
/// 运行开始后以 `Arc<TranslationConfig>` 的形式只读共享。
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranslationConfig {
    // 基础配置
    pub target_lang: String,
    pub source_lang: String,
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    // 性能配置
    pub max_requests_per_second: f64,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,

    // 批次配置
    pub batch_max_units: usize,
    pub batch_max_chars: usize,

    // 重试配置
    pub max_retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter: bool,
    /// 单次退避等待的上限，包括服务给出的 Retry-After
    pub retry_max_delay_ms: u64,

    // 写回配置
    pub writes_per_transaction: usize,
    pub transaction_name: String,

    // 缓存配置
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub local_cache_size: usize,

    // 功能开关
    pub filter_non_linguistic: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_lang: constants::DEFAULT_TARGET_LANG.to_string(),
            source_lang: constants::DEFAULT_SOURCE_LANG.to_string(),
            api_url: constants::DEFAULT_API_URL.to_string(),
            api_key: None,

            max_requests_per_second: constants::DEFAULT_MAX_REQUESTS_PER_SECOND,
            max_concurrent_requests: constants::DEFAULT_MAX_CONCURRENT_REQUESTS,
            request_timeout_secs: constants::DEFAULT_REQUEST_TIMEOUT.as_secs(),

            batch_max_units: constants::MAX_BATCH_UNITS,
            batch_max_chars: constants::MAX_BATCH_CHARS,

            max_retry_attempts: constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay_ms: constants::DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            retry_multiplier: constants::DEFAULT_RETRY_MULTIPLIER,
            retry_jitter: true,
            retry_max_delay_ms: constants::DEFAULT_RETRY_MAX_DELAY.as_millis() as u64,

            writes_per_transaction: constants::DEFAULT_WRITES_PER_TRANSACTION,
            transaction_name: constants::DEFAULT_TRANSACTION_NAME.to_string(),

            cache_enabled: true,
            cache_ttl_secs: constants::DEFAULT_CACHE_TTL.as_secs(),
            local_cache_size: constants::DEFAULT_LOCAL_CACHE_SIZE,

            filter_non_linguistic: false,
        }
    }
}

// 凭据不进入日志
impl fmt::Debug for TranslationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationConfig")
            .field("target_lang", &self.target_lang)
            .field("source_lang", &self.source_lang)
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("max_requests_per_second", &self.max_requests_per_second)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("batch_max_units", &self.batch_max_units)
            .field("batch_max_chars", &self.batch_max_chars)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("retry_jitter", &self.retry_jitter)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("writes_per_transaction", &self.writes_per_transaction)
            .field("transaction_name", &self.transaction_name)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("local_cache_size", &self.local_cache_size)
            .field("filter_non_linguistic", &self.filter_non_linguistic)
            .finish()
    }
}

impl TranslationConfig {
    /// 创建带指定语言的默认配置
    pub fn default_with_lang(target_lang: &str, api_url: Option<&str>) -> Self {
        let mut config = Self::default();
        config.target_lang = target_lang.to_string();
        if let Some(url) = api_url {
            config.api_url = url.to_string();
        }
        config
    }

    /// 验证配置
    pub fn validate(&self) -> TranslationResult<()> {
        if self.batch_max_units == 0 {
            return Err(TranslationError::ConfigError("批次单元数上限不能为0".to_string()));
        }

        if self.batch_max_chars == 0 {
            return Err(TranslationError::ConfigError("批次字符数上限不能为0".to_string()));
        }

        if self.max_concurrent_requests == 0 {
            return Err(TranslationError::ConfigError("最大并发数不能为0".to_string()));
        }

        if !(self.max_requests_per_second > 0.0) {
            return Err(TranslationError::ConfigError("请求速率必须大于0".to_string()));
        }

        if self.max_retry_attempts == 0 {
            return Err(TranslationError::ConfigError("重试预算至少为1次尝试".to_string()));
        }

        if self.retry_multiplier < 1.0 {
            return Err(TranslationError::ConfigError("退避倍数不能小于1".to_string()));
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(TranslationError::ConfigError(
                "退避等待上限不能小于基础延迟".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(TranslationError::ConfigError("请求超时不能为0".to_string()));
        }

        if self.writes_per_transaction == 0 {
            return Err(TranslationError::ConfigError("每个事务的写入数不能为0".to_string()));
        }

        if self.target_lang.trim().is_empty() {
            return Err(TranslationError::ConfigError("目标语言不能为空".to_string()));
        }

        if self.cache_enabled && self.local_cache_size == 0 {
            return Err(TranslationError::ConfigError("启用缓存时缓存大小不能为0".to_string()));
        }

        let url = url::Url::parse(&self.api_url).map_err(|e| {
            TranslationError::ConfigError(format!("无效的API地址 '{}': {}", self.api_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TranslationError::ConfigError(format!(
                "API地址必须使用 http 或 https: {}",
                self.api_url
            )));
        }

        Ok(())
    }

    /// 应用环境变量覆盖
    ///
    /// 只有实际设置了的变量才会覆盖；无法解析的值会被忽略并记录警告。
    pub fn apply_env_overrides(&mut self) {
        use crate::env::{cache, translation, EnvResult, EnvVar};

        fn take<T>(value: Option<EnvResult<T>>) -> Option<T> {
            match value? {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("忽略无效的环境变量: {}", e);
                    None
                }
            }
        }

        // 翻译相关环境变量
        if let Some(target_lang) = take(translation::TargetLang::lookup()) {
            self.target_lang = target_lang;
        }

        if let Some(source_lang) = take(translation::SourceLang::lookup()) {
            self.source_lang = source_lang;
        }

        if let Some(api_url) = take(translation::ApiUrl::lookup()) {
            self.api_url = api_url;
            tracing::info!("环境变量覆盖 API URL: {}", self.api_url);
        }

        if let Some(api_key) = take(translation::ApiKey::lookup()) {
            self.api_key = Some(api_key);
        }

        if let Some(rate) = take(translation::MaxRequestsPerSecond::lookup()) {
            self.max_requests_per_second = rate;
        }

        if let Some(max_concurrent) = take(translation::MaxConcurrentRequests::lookup()) {
            self.max_concurrent_requests = max_concurrent;
        }

        if let Some(units) = take(translation::BatchMaxUnits::lookup()) {
            self.batch_max_units = units;
        }

        if let Some(chars) = take(translation::BatchMaxChars::lookup()) {
            self.batch_max_chars = chars;
        }

        if let Some(timeout) = take(translation::RequestTimeout::lookup()) {
            self.request_timeout_secs = timeout.as_secs();
        }

        if let Some(attempts) = take(translation::MaxRetryAttempts::lookup()) {
            self.max_retry_attempts = attempts;
        }

        if let Some(writes) = take(translation::WritesPerTransaction::lookup()) {
            self.writes_per_transaction = writes;
        }

        // 缓存相关环境变量
        if let Some(cache_enabled) = take(cache::Enabled::lookup()) {
            self.cache_enabled = cache_enabled;
        }

        if let Some(cache_size) = take(cache::LocalCacheSize::lookup()) {
            self.local_cache_size = cache_size;
        }

        if let Some(cache_ttl) = take(cache::Ttl::lookup()) {
            self.cache_ttl_secs = cache_ttl.as_secs();
        }
    }

    /// 转换为Duration类型
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// 两次请求之间的最小间隔
    pub fn min_request_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.max_requests_per_second).unwrap_or(Duration::ZERO)
    }
}

/// 配置管理器
pub struct ConfigManager {
    config: TranslationConfig,
}

impl ConfigManager {
    /// 从默认搜索路径创建配置管理器
    pub fn new() -> TranslationResult<Self> {
        let mut config = Self::load_config()?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(Self { config })
    }

    /// 从指定文件创建配置管理器，仍然应用环境变量覆盖
    pub fn from_file<P: AsRef<Path>>(path: P) -> TranslationResult<Self> {
        Self::load_dotenv();

        let mut config = Self::load_from_file(path.as_ref())?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(Self { config })
    }

    /// 获取配置
    pub fn get_config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn into_config(self) -> TranslationConfig {
        self.config
    }

    /// 从搜索路径加载配置
    fn load_config() -> TranslationResult<TranslationConfig> {
        // 首先尝试加载 .env 文件
        Self::load_dotenv();

        // 查找配置文件
        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            let candidate = Path::new(expanded_path.as_ref());
            if candidate.exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::load_from_file(candidate);
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Ok(TranslationConfig::default())
    }

    /// 从指定文件加载配置
    fn load_from_file(path: &Path) -> TranslationResult<TranslationConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TranslationError::ConfigError(format!("读取配置文件失败 {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析JSON配置失败: {}", e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析TOML配置失败: {}", e)))
        }
    }

    /// 加载 .env 文件
    fn load_dotenv() {
        for env_file in constants::ENV_FILES {
            if Path::new(env_file).exists() && dotenv::from_filename(env_file).is_ok() {
                tracing::info!("已加载环境变量文件: {}", env_file);
                break;
            }
        }
    }

    /// 生成示例配置文件
    pub fn generate_example_config<P: AsRef<Path>>(path: P) -> TranslationResult<()> {
        let config = TranslationConfig::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| TranslationError::ConfigError(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| TranslationError::ConfigError(format!("写入配置文件失败: {}", e)))?;

        Ok(())
    }
}
