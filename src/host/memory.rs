//! 内存中的宿主文档
//!
//! 以快照形式描述的简化CAD文档，实现完整的 [`HostDocument`] 语义（会话、事务、
//! 只读字段、元素删除）。命令行工具用它加载JSON快照，测试用它模拟宿主。

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::document::{CategoryId, ElementHandle, FieldId, HostDocument, HostError, ViewId};

/// 文档快照（JSON格式）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    #[serde(default)]
    pub categories: Vec<CategoryId>,
    #[serde(default)]
    pub views: Vec<ViewSnapshot>,
    #[serde(default)]
    pub elements: Vec<ElementSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub id: ViewId,
    #[serde(default)]
    pub elements: Vec<ElementHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub id: ElementHandle,
    pub category: CategoryId,
    #[serde(default)]
    pub fields: Vec<FieldSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub name: FieldId,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone)]
struct ElementRecord {
    category: CategoryId,
    fields: Vec<FieldSnapshot>,
}

#[derive(Debug)]
struct PendingTransaction {
    name: String,
    writes: Vec<(ElementHandle, FieldId, String)>,
}

/// 内存文档
#[derive(Debug)]
pub struct InMemoryDocument {
    categories: Vec<CategoryId>,
    views: BTreeMap<ViewId, Vec<ElementHandle>>,
    elements: BTreeMap<ElementHandle, ElementRecord>,
    next_handle: u64,
    session_open: bool,
    pending: Option<PendingTransaction>,
    committed_transactions: Vec<String>,
    committed_writes: usize,
}

impl Default for InMemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocument {
    pub fn new() -> Self {
        Self {
            categories: Vec::new(),
            views: BTreeMap::new(),
            elements: BTreeMap::new(),
            next_handle: 1,
            session_open: true,
            pending: None,
            committed_transactions: Vec::new(),
            committed_writes: 0,
        }
    }

    /// 从快照构建文档
    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Self {
        let mut document = Self::new();
        document.categories = snapshot.categories;

        for element in snapshot.elements {
            if !document.categories.contains(&element.category) {
                document.categories.push(element.category.clone());
            }
            document.next_handle = document.next_handle.max(element.id.raw() + 1);
            document.elements.insert(
                element.id,
                ElementRecord {
                    category: element.category,
                    fields: element.fields,
                },
            );
        }

        for view in snapshot.views {
            document.views.insert(view.id, view.elements);
        }

        document
    }

    /// 导出当前已提交状态的快照
    pub fn to_snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            categories: self.categories.clone(),
            views: self
                .views
                .iter()
                .map(|(id, elements)| ViewSnapshot {
                    id: id.clone(),
                    elements: elements.clone(),
                })
                .collect(),
            elements: self
                .elements
                .iter()
                .map(|(id, record)| ElementSnapshot {
                    id: *id,
                    category: record.category.clone(),
                    fields: record.fields.clone(),
                })
                .collect(),
        }
    }

    /// 从JSON文件加载
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: DocumentSnapshot = serde_json::from_str(&content)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn add_category(&mut self, category: impl Into<CategoryId>) -> CategoryId {
        let category = category.into();
        if !self.categories.contains(&category) {
            self.categories.push(category.clone());
        }
        category
    }

    /// 添加元素并返回其句柄，类别不存在时自动创建
    pub fn add_element<I, K, V>(&mut self, category: impl Into<CategoryId>, fields: I) -> ElementHandle
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FieldId>,
        V: Into<String>,
    {
        let category = self.add_category(category);
        let handle = ElementHandle::new(self.next_handle);
        self.next_handle += 1;

        let fields = fields
            .into_iter()
            .map(|(name, value)| FieldSnapshot {
                name: name.into(),
                value: value.into(),
                read_only: false,
            })
            .collect();

        self.elements.insert(handle, ElementRecord { category, fields });
        handle
    }

    /// 添加只读字段
    pub fn add_read_only_field(
        &mut self,
        element: ElementHandle,
        name: impl Into<FieldId>,
        value: impl Into<String>,
    ) -> bool {
        match self.elements.get_mut(&element) {
            Some(record) => {
                record.fields.push(FieldSnapshot {
                    name: name.into(),
                    value: value.into(),
                    read_only: true,
                });
                true
            }
            None => false,
        }
    }

    pub fn add_view(
        &mut self,
        view: impl Into<ViewId>,
        elements: impl IntoIterator<Item = ElementHandle>,
    ) -> ViewId {
        let view = view.into();
        self.views
            .entry(view.clone())
            .or_default()
            .extend(elements);
        view
    }

    /// 模拟用户删除元素
    pub fn delete_element(&mut self, element: ElementHandle) -> bool {
        self.elements.remove(&element).is_some()
    }

    pub fn delete_view(&mut self, view: &ViewId) -> bool {
        self.views.remove(view).is_some()
    }

    /// 模拟用户直接编辑字段（绕过事务）
    pub fn edit_field(&mut self, element: ElementHandle, field: &FieldId, text: &str) -> bool {
        match self.field_mut(element, field) {
            Some(slot) => {
                slot.value = text.to_string();
                true
            }
            None => false,
        }
    }

    /// 模拟文档被关闭
    pub fn close_session(&mut self) {
        self.session_open = false;
        self.pending = None;
    }

    pub fn field_text(&self, element: ElementHandle, field: &str) -> Option<&str> {
        self.elements
            .get(&element)?
            .fields
            .iter()
            .find(|slot| slot.name.as_str() == field)
            .map(|slot| slot.value.as_str())
    }

    /// 已提交事务的名称，按提交顺序
    pub fn committed_transactions(&self) -> &[String] {
        &self.committed_transactions
    }

    /// 已提交的字段写入总数
    pub fn committed_writes(&self) -> usize {
        self.committed_writes
    }

    pub fn has_open_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn field_mut(&mut self, element: ElementHandle, field: &FieldId) -> Option<&mut FieldSnapshot> {
        self.elements
            .get_mut(&element)?
            .fields
            .iter_mut()
            .find(|slot| &slot.name == field)
    }

    fn ensure_open(&self) -> Result<(), HostError> {
        if self.session_open {
            Ok(())
        } else {
            Err(HostError::SessionClosed)
        }
    }

    fn record(&self, element: ElementHandle) -> Result<&ElementRecord, HostError> {
        self.ensure_open()?;
        self.elements
            .get(&element)
            .ok_or(HostError::StaleHandle(element))
    }
}

impl HostDocument for InMemoryDocument {
    fn is_session_valid(&self) -> bool {
        self.session_open
    }

    fn has_category(&self, category: &CategoryId) -> bool {
        self.session_open && self.categories.contains(category)
    }

    fn has_view(&self, view: &ViewId) -> bool {
        self.session_open && self.views.contains_key(view)
    }

    fn elements_of_category(&self, category: &CategoryId) -> Result<Vec<ElementHandle>, HostError> {
        self.ensure_open()?;
        if !self.categories.contains(category) {
            return Err(HostError::UnknownCategory(category.clone()));
        }

        Ok(self
            .elements
            .iter()
            .filter(|(_, record)| &record.category == category)
            .map(|(handle, _)| *handle)
            .collect())
    }

    fn elements_in_view(
        &self,
        category: &CategoryId,
        view: &ViewId,
    ) -> Result<Vec<ElementHandle>, HostError> {
        self.ensure_open()?;
        if !self.categories.contains(category) {
            return Err(HostError::UnknownCategory(category.clone()));
        }
        let visible = self
            .views
            .get(view)
            .ok_or_else(|| HostError::UnknownView(view.clone()))?;

        Ok(visible
            .iter()
            .filter(|handle| {
                self.elements
                    .get(handle)
                    .is_some_and(|record| &record.category == category)
            })
            .copied()
            .collect())
    }

    fn text_fields(&self, element: ElementHandle) -> Result<Vec<(FieldId, String)>, HostError> {
        Ok(self
            .record(element)?
            .fields
            .iter()
            .filter(|slot| !slot.read_only)
            .map(|slot| (slot.name.clone(), slot.value.clone()))
            .collect())
    }

    fn read_field(&self, element: ElementHandle, field: &FieldId) -> Result<String, HostError> {
        self.record(element)?
            .fields
            .iter()
            .find(|slot| &slot.name == field)
            .map(|slot| slot.value.clone())
            .ok_or_else(|| HostError::UnknownField {
                element,
                field: field.clone(),
            })
    }

    fn write_field(
        &mut self,
        element: ElementHandle,
        field: &FieldId,
        text: &str,
    ) -> Result<(), HostError> {
        let record = self.record(element)?;
        let slot = record
            .fields
            .iter()
            .find(|slot| &slot.name == field)
            .ok_or_else(|| HostError::UnknownField {
                element,
                field: field.clone(),
            })?;
        if slot.read_only {
            return Err(HostError::ReadOnlyField {
                element,
                field: field.clone(),
            });
        }

        let pending = self.pending.as_mut().ok_or(HostError::NoTransaction)?;
        pending
            .writes
            .push((element, field.clone(), text.to_string()));
        Ok(())
    }

    fn begin_transaction(&mut self, name: &str) -> Result<(), HostError> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(HostError::TransactionOpen);
        }
        self.pending = Some(PendingTransaction {
            name: name.to_string(),
            writes: Vec::new(),
        });
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), HostError> {
        self.ensure_open()?;
        let pending = self.pending.take().ok_or(HostError::NoTransaction)?;

        let count = pending.writes.len();
        for (element, field, text) in pending.writes {
            if let Some(slot) = self.field_mut(element, &field) {
                slot.value = text;
            }
        }

        self.committed_writes += count;
        self.committed_transactions.push(pending.name);
        Ok(())
    }

    fn rollback_transaction(&mut self) {
        self.pending = None;
    }
}
