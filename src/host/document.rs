//! 宿主文档边界
//!
//! 定义核心与宿主CAD文档之间的最小接口：不透明的元素句柄、类别/视图/字段标识，
//! 以及只能在宿主API线程上调用的 [`HostDocument`] 特性。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 宿主文档中元素的不透明句柄
///
/// 句柄只是一个查找键，仅在文档会话打开期间有效。核心从不持有宿主对象的
/// 实时引用，每次使用时都要通过 [`HostDocument`] 重新解析。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementHandle(u64);

impl ElementHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// 模型类别标识（如 "Rooms"、"Doors"）
    CategoryId
);
string_id!(
    /// 视图标识
    ViewId
);
string_id!(
    /// 元素上的文本字段标识（参数名）
    FieldId
);

/// 宿主文档操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// 文档会话已关闭或失效
    #[error("文档会话已失效")]
    SessionClosed,

    /// 类别在选择之后被删除
    #[error("类别不存在: {0}")]
    UnknownCategory(CategoryId),

    /// 视图在选择之后被删除
    #[error("视图不存在: {0}")]
    UnknownView(ViewId),

    /// 元素已不存在（运行期间被用户删除）
    #[error("元素已不存在: {0}")]
    StaleHandle(ElementHandle),

    #[error("元素 {element} 上不存在字段 {field}")]
    UnknownField {
        element: ElementHandle,
        field: FieldId,
    },

    #[error("元素 {element} 的字段 {field} 为只读")]
    ReadOnlyField {
        element: ElementHandle,
        field: FieldId,
    },

    #[error("当前没有打开的事务")]
    NoTransaction,

    #[error("已有打开的事务")]
    TransactionOpen,

    /// 宿主API线程已停止，无法再投递任务
    #[error("宿主API线程不可用")]
    ApiThreadUnavailable,
}

/// 宿主文档接口
///
/// 所有方法都只能在宿主API线程上调用。核心通过 [`crate::host::ApiContext`]
/// 把闭包投递到该线程，闭包内拿到 `&mut D` 后再调用这些方法，
/// 因此线程亲和性体现在函数签名上，而不是隐藏在运行时环境里。
///
/// 写操作必须处于 `begin_transaction` / `commit_transaction` 之间，
/// 提交之前的写入对文档不可见，回滚后全部丢弃。
pub trait HostDocument {
    /// 文档会话是否仍然有效
    fn is_session_valid(&self) -> bool;

    fn has_category(&self, category: &CategoryId) -> bool;

    fn has_view(&self, view: &ViewId) -> bool;

    /// 整个模型中属于某类别的元素，按宿主顺序
    fn elements_of_category(&self, category: &CategoryId) -> Result<Vec<ElementHandle>, HostError>;

    /// 某视图中可见且属于某类别的元素；类别不适用于该视图时返回空列表
    fn elements_in_view(
        &self,
        category: &CategoryId,
        view: &ViewId,
    ) -> Result<Vec<ElementHandle>, HostError>;

    /// 元素上所有可写的文本字段及其当前值，按宿主顺序
    fn text_fields(&self, element: ElementHandle) -> Result<Vec<(FieldId, String)>, HostError>;

    /// 读取字段的已提交值
    fn read_field(&self, element: ElementHandle, field: &FieldId) -> Result<String, HostError>;

    /// 在当前事务中写入字段
    fn write_field(
        &mut self,
        element: ElementHandle,
        field: &FieldId,
        text: &str,
    ) -> Result<(), HostError>;

    fn begin_transaction(&mut self, name: &str) -> Result<(), HostError>;

    fn commit_transaction(&mut self) -> Result<(), HostError>;

    /// 丢弃当前事务中的全部写入；没有打开的事务时什么也不做
    fn rollback_transaction(&mut self);
}
