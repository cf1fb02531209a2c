//! 统一的环境变量管理系统
//!
//! 提供类型安全、可验证的环境变量访问。所有变量都以 `CAD_TRANSLATOR_` 为前缀，
//! 配置管理器在加载配置文件之后用它们覆盖对应字段。

use std::env;
use std::fmt;
use std::time::Duration;

/// 环境变量解析错误
#[derive(Debug, Clone)]
pub struct EnvError {
    pub variable: String,
    pub message: String,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment variable '{}': {}", self.variable, self.message)
    }
}

impl std::error::Error for EnvError {}

pub type EnvResult<T> = Result<T, EnvError>;

/// 环境变量访问器特性
pub trait EnvVar<T> {
    const NAME: &'static str;
    const DEFAULT: Option<T>;
    const DESCRIPTION: &'static str;

    fn parse(value: &str) -> EnvResult<T>;

    fn get() -> EnvResult<T> {
        match Self::lookup() {
            Some(result) => result,
            None => Self::DEFAULT.ok_or_else(|| EnvError {
                variable: Self::NAME.to_string(),
                message: "Required environment variable not set".to_string(),
            }),
        }
    }

    /// 变量未设置时返回 `None`，不回退到默认值
    fn lookup() -> Option<EnvResult<T>> {
        env::var(Self::NAME).ok().map(|value| Self::parse(&value))
    }

    fn get_or_default(default: T) -> T {
        Self::get().unwrap_or(default)
    }
}

/// 核心环境变量定义
pub mod core {
    use super::*;

    /// 日志级别
    pub struct LogLevel;
    impl EnvVar<String> for LogLevel {
        const NAME: &'static str = "CAD_TRANSLATOR_LOG_LEVEL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Log level: trace, debug, info, warn, error";

        fn get() -> EnvResult<String> {
            Self::lookup().unwrap_or_else(|| Ok("info".to_string()))
        }

        fn parse(value: &str) -> EnvResult<String> {
            match value.to_lowercase().as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => Ok(value.to_lowercase()),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!(
                        "Invalid log level '{}'. Use: trace, debug, info, warn, error",
                        value
                    ),
                }),
            }
        }
    }

    /// 禁用颜色输出
    pub struct NoColor;
    impl EnvVar<bool> for NoColor {
        const NAME: &'static str = "NO_COLOR";
        const DEFAULT: Option<bool> = Some(false);
        const DESCRIPTION: &'static str = "Disable colored output when set to any value";

        fn parse(value: &str) -> EnvResult<bool> {
            // NO_COLOR 遵循标准：任何值都表示禁用颜色
            Ok(!value.is_empty())
        }
    }
}

/// 翻译相关环境变量
pub mod translation {
    use super::*;

    /// 目标语言
    pub struct TargetLang;
    impl EnvVar<String> for TargetLang {
        const NAME: &'static str = "CAD_TRANSLATOR_TARGET_LANG";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Target language code (ISO 639-1, optional region)";

        fn parse(value: &str) -> EnvResult<String> {
            parse_lang_code(value, Self::NAME, false)
        }
    }

    /// 源语言
    pub struct SourceLang;
    impl EnvVar<String> for SourceLang {
        const NAME: &'static str = "CAD_TRANSLATOR_SOURCE_LANG";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Source language code ('auto' for detection)";

        fn parse(value: &str) -> EnvResult<String> {
            parse_lang_code(value, Self::NAME, true)
        }
    }

    /// API URL
    pub struct ApiUrl;
    impl EnvVar<String> for ApiUrl {
        const NAME: &'static str = "CAD_TRANSLATOR_API_URL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Translation provider endpoint URL";

        fn parse(value: &str) -> EnvResult<String> {
            let url = value.trim();
            if url.starts_with("http://") || url.starts_with("https://") {
                Ok(url.to_string())
            } else {
                Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "API URL must start with http:// or https://".to_string(),
                })
            }
        }
    }

    /// 服务凭据
    pub struct ApiKey;
    impl EnvVar<String> for ApiKey {
        const NAME: &'static str = "CAD_TRANSLATOR_API_KEY";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Translation provider API key";

        fn parse(value: &str) -> EnvResult<String> {
            let key = value.trim();
            if key.is_empty() {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "API key must not be empty".to_string(),
                });
            }
            Ok(key.to_string())
        }
    }

    /// 每秒最大请求数
    pub struct MaxRequestsPerSecond;
    impl EnvVar<f64> for MaxRequestsPerSecond {
        const NAME: &'static str = "CAD_TRANSLATOR_MAX_REQUESTS_PER_SECOND";
        const DEFAULT: Option<f64> = Some(5.0);
        const DESCRIPTION: &'static str = "Maximum requests per second to the provider";

        fn parse(value: &str) -> EnvResult<f64> {
            let rate: f64 = value.parse().map_err(|_| EnvError {
                variable: Self::NAME.to_string(),
                message: "Must be a valid number".to_string(),
            })?;

            if rate <= 0.0 {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "Rate must be greater than 0".to_string(),
                });
            }

            if rate > 1000.0 {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "Rate too high (max 1000 requests/second)".to_string(),
                });
            }

            Ok(rate)
        }
    }

    /// 最大并发批次数
    pub struct MaxConcurrentRequests;
    impl EnvVar<usize> for MaxConcurrentRequests {
        const NAME: &'static str = "CAD_TRANSLATOR_MAX_CONCURRENT_REQUESTS";
        const DEFAULT: Option<usize> = Some(4);
        const DESCRIPTION: &'static str = "Maximum batches in flight at the provider";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 1, 64)
        }
    }

    /// 每批最大单元数
    pub struct BatchMaxUnits;
    impl EnvVar<usize> for BatchMaxUnits {
        const NAME: &'static str = "CAD_TRANSLATOR_BATCH_MAX_UNITS";
        const DEFAULT: Option<usize> = Some(50);
        const DESCRIPTION: &'static str = "Maximum translation units per batch";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 1, 1000)
        }
    }

    /// 每批最大字符数
    pub struct BatchMaxChars;
    impl EnvVar<usize> for BatchMaxChars {
        const NAME: &'static str = "CAD_TRANSLATOR_BATCH_MAX_CHARS";
        const DEFAULT: Option<usize> = Some(4000);
        const DESCRIPTION: &'static str = "Maximum characters per batch";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 100, 100_000)
        }
    }

    /// 单次请求超时
    pub struct RequestTimeout;
    impl EnvVar<Duration> for RequestTimeout {
        const NAME: &'static str = "CAD_TRANSLATOR_REQUEST_TIMEOUT";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(30));
        const DESCRIPTION: &'static str = "Per-attempt request timeout in seconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            let seconds = parse_positive_usize(value, Self::NAME, 1, 300)?;
            Ok(Duration::from_secs(seconds as u64))
        }
    }

    /// 重试预算（总尝试次数）
    pub struct MaxRetryAttempts;
    impl EnvVar<usize> for MaxRetryAttempts {
        const NAME: &'static str = "CAD_TRANSLATOR_MAX_RETRY_ATTEMPTS";
        const DEFAULT: Option<usize> = Some(3);
        const DESCRIPTION: &'static str = "Total attempts per batch on transient errors";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 1, 10)
        }
    }

    /// 每个事务的最大写入数
    pub struct WritesPerTransaction;
    impl EnvVar<usize> for WritesPerTransaction {
        const NAME: &'static str = "CAD_TRANSLATOR_WRITES_PER_TRANSACTION";
        const DEFAULT: Option<usize> = Some(100);
        const DESCRIPTION: &'static str = "Maximum field writes per host transaction";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 1, 10_000)
        }
    }
}

/// 缓存相关环境变量
pub mod cache {
    use super::*;

    /// 缓存启用状态
    pub struct Enabled;
    impl EnvVar<bool> for Enabled {
        const NAME: &'static str = "CAD_TRANSLATOR_CACHE_ENABLED";
        const DEFAULT: Option<bool> = Some(true);
        const DESCRIPTION: &'static str = "Enable the translation memory";

        fn parse(value: &str) -> EnvResult<bool> {
            parse_bool(value, Self::NAME)
        }
    }

    /// 本地缓存大小
    pub struct LocalCacheSize;
    impl EnvVar<usize> for LocalCacheSize {
        const NAME: &'static str = "CAD_TRANSLATOR_CACHE_SIZE";
        const DEFAULT: Option<usize> = Some(1000);
        const DESCRIPTION: &'static str = "Translation memory size (number of entries)";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 10, 100_000)
        }
    }

    /// 缓存TTL
    pub struct Ttl;
    impl EnvVar<Duration> for Ttl {
        const NAME: &'static str = "CAD_TRANSLATOR_CACHE_TTL";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(3600));
        const DESCRIPTION: &'static str = "Translation memory TTL in seconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            let seconds: u64 = value.parse().map_err(|_| EnvError {
                variable: Self::NAME.to_string(),
                message: "Must be a valid number of seconds".to_string(),
            })?;

            if seconds < 60 {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "TTL too short (minimum 60 seconds)".to_string(),
                });
            }

            if seconds > 86400 * 7 {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "TTL too long (maximum 7 days)".to_string(),
                });
            }

            Ok(Duration::from_secs(seconds))
        }
    }
}

/// 辅助函数
fn parse_bool(value: &str, var_name: &str) -> EnvResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "enabled" => Ok(true),
        "false" | "0" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(EnvError {
            variable: var_name.to_string(),
            message: format!(
                "Invalid boolean value '{}'. Use: true/false, 1/0, yes/no, on/off, enabled/disabled",
                value
            ),
        }),
    }
}

fn parse_positive_usize(value: &str, var_name: &str, min: usize, max: usize) -> EnvResult<usize> {
    let num: usize = value.trim().parse().map_err(|_| EnvError {
        variable: var_name.to_string(),
        message: "Must be a valid positive number".to_string(),
    })?;

    if num < min {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} is below minimum {}", num, min),
        });
    }

    if num > max {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} exceeds maximum {}", num, max),
        });
    }

    Ok(num)
}

/// 语言代码：两位字母，可带地区后缀（如 `pt-BR`）
fn parse_lang_code(value: &str, var_name: &str, allow_auto: bool) -> EnvResult<String> {
    let lang = value.trim();
    if allow_auto && lang.eq_ignore_ascii_case("auto") {
        return Ok("auto".to_string());
    }

    let mut parts = lang.splitn(2, '-');
    let primary = parts.next().unwrap_or_default();
    let valid_primary = primary.len() == 2 && primary.chars().all(|c| c.is_ascii_alphabetic());
    let valid_region = parts
        .next()
        .map_or(true, |region| !region.is_empty() && region.chars().all(|c| c.is_ascii_alphanumeric()));

    if valid_primary && valid_region {
        Ok(lang.to_string())
    } else {
        Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Invalid language code '{}'", value),
        })
    }
}

/// 环境变量文档生成器
pub fn generate_env_docs() -> String {
    let mut docs = String::new();
    docs.push_str("# Environment Variables\n\n");

    let mut line = |name: &str, description: &str| {
        docs.push_str(&format!("- `{}`: {}\n", name, description));
    };

    line(core::LogLevel::NAME, core::LogLevel::DESCRIPTION);
    line(core::NoColor::NAME, core::NoColor::DESCRIPTION);
    line(translation::TargetLang::NAME, translation::TargetLang::DESCRIPTION);
    line(translation::SourceLang::NAME, translation::SourceLang::DESCRIPTION);
    line(translation::ApiUrl::NAME, translation::ApiUrl::DESCRIPTION);
    line(translation::ApiKey::NAME, translation::ApiKey::DESCRIPTION);
    line(
        translation::MaxRequestsPerSecond::NAME,
        translation::MaxRequestsPerSecond::DESCRIPTION,
    );
    line(
        translation::MaxConcurrentRequests::NAME,
        translation::MaxConcurrentRequests::DESCRIPTION,
    );
    line(translation::BatchMaxUnits::NAME, translation::BatchMaxUnits::DESCRIPTION);
    line(translation::BatchMaxChars::NAME, translation::BatchMaxChars::DESCRIPTION);
    line(translation::RequestTimeout::NAME, translation::RequestTimeout::DESCRIPTION);
    line(translation::MaxRetryAttempts::NAME, translation::MaxRetryAttempts::DESCRIPTION);
    line(
        translation::WritesPerTransaction::NAME,
        translation::WritesPerTransaction::DESCRIPTION,
    );
    line(cache::Enabled::NAME, cache::Enabled::DESCRIPTION);
    line(cache::LocalCacheSize::NAME, cache::LocalCacheSize::DESCRIPTION);
    line(cache::Ttl::NAME, cache::Ttl::DESCRIPTION);

    docs
}
