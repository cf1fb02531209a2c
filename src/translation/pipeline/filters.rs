//! 文本过滤器模块
//!
//! 判断字段文本是否需要翻译。空白文本总是跳过；非语言内容（纯数字、URL、
//! 邮箱）的过滤是可选的，默认关闭。

use std::sync::OnceLock;

use regex::Regex;

/// 文本过滤器
#[derive(Debug, Default)]
pub struct TextFilter {
    /// 是否过滤非语言内容
    skip_non_linguistic: bool,
    regex_cache: RegexCache,
}

/// 正则表达式缓存
#[derive(Debug, Default)]
struct RegexCache {
    url_regex: OnceLock<Option<Regex>>,
    email_regex: OnceLock<Option<Regex>>,
}

/// 过滤原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Blank,
    Numeric,
    Url,
    Email,
}

impl TextFilter {
    /// 创建只过滤空白文本的过滤器
    pub fn new() -> Self {
        Self::default()
    }

    /// 同时过滤非语言内容
    pub fn with_non_linguistic_filter(mut self, enabled: bool) -> Self {
        self.skip_non_linguistic = enabled;
        self
    }

    /// 判断文本是否需要翻译
    pub fn should_translate(&self, text: &str) -> bool {
        self.rejection_reason(text).is_none()
    }

    /// 返回文本被过滤的原因，需要翻译时返回 `None`
    pub fn rejection_reason(&self, text: &str) -> Option<FilterReason> {
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Some(FilterReason::Blank);
        }

        if !self.skip_non_linguistic {
            return None;
        }

        if self.is_pure_symbols_or_numbers(trimmed) {
            Some(FilterReason::Numeric)
        } else if self.is_url(trimmed) {
            Some(FilterReason::Url)
        } else if self.is_email(trimmed) {
            Some(FilterReason::Email)
        } else {
            None
        }
    }

    /// 检查是否为URL
    fn is_url(&self, text: &str) -> bool {
        if text.starts_with("http://") || text.starts_with("https://") || text.starts_with("ftp://")
        {
            return !text.contains(char::is_whitespace);
        }

        let url_regex = self
            .regex_cache
            .url_regex
            .get_or_init(|| Regex::new(r"^www\.[^\s]+\.[a-zA-Z]{2,}[^\s]*$").ok());
        url_regex.as_ref().map_or(false, |re| re.is_match(text))
    }

    /// 检查是否为邮箱
    fn is_email(&self, text: &str) -> bool {
        if text.len() > 100 || !text.contains('@') || !text.contains('.') {
            return false;
        }

        let email_regex = self.regex_cache.email_regex.get_or_init(|| {
            Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok()
        });
        email_regex.as_ref().map_or(false, |re| re.is_match(text))
    }

    /// 检查是否为纯符号或数字，例如 `1200`、`3.5 %`、`±0.00`
    fn is_pure_symbols_or_numbers(&self, text: &str) -> bool {
        !text.chars().any(char::is_alphabetic)
    }
}
