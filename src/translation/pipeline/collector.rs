//! 文本提取模块
//!
//! 按用户确认的选择范围遍历宿主文档，产出翻译单元。
//!
//! 提取器是一个惰性的、有限的、不可重启的迭代器：
//! - 开始前校验会话与选择范围，失败时只产出一个 `ExtractionFailure`
//! - 同一元素经多个视图到达时只产出一次
//! - 空白字段永远不会成为翻译单元

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::iter::FusedIterator;

use serde::Serialize;

use crate::host::{CategoryId, ElementHandle, FieldId, HostDocument, HostError, ViewId};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::pipeline::filters::TextFilter;

/// 翻译单元：一个元素上的一个源文本字段
///
/// 创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TranslationUnit {
    element: ElementHandle,
    field: FieldId,
    source_text: String,
    source_language: String,
}

impl TranslationUnit {
    pub fn new(
        element: ElementHandle,
        field: impl Into<FieldId>,
        source_text: impl Into<String>,
        source_language: impl Into<String>,
    ) -> Self {
        Self {
            element,
            field: field.into(),
            source_text: source_text.into(),
            source_language: source_language.into(),
        }
    }

    pub fn element(&self) -> ElementHandle {
        self.element
    }

    pub fn field(&self) -> &FieldId {
        &self.field
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn source_language(&self) -> &str {
        &self.source_language
    }

    /// 字符数（Unicode标量值）
    pub fn char_count(&self) -> usize {
        self.source_text.chars().count()
    }
}

/// 一次运行的选择范围
///
/// 已经是解析到叶子层级的类别和视图集合。视图集合为空时遍历整个模型。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionScope {
    categories: BTreeSet<CategoryId>,
    views: BTreeSet<ViewId>,
}

impl SelectionScope {
    pub fn new<C, V>(categories: C, views: V) -> Self
    where
        C: IntoIterator,
        C::Item: Into<CategoryId>,
        V: IntoIterator,
        V::Item: Into<ViewId>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            views: views.into_iter().map(Into::into).collect(),
        }
    }

    /// 不限定视图，按类别遍历整个模型
    pub fn whole_model<C>(categories: C) -> Self
    where
        C: IntoIterator,
        C::Item: Into<CategoryId>,
    {
        Self::new(categories, std::iter::empty::<ViewId>())
    }

    pub fn categories(&self) -> &BTreeSet<CategoryId> {
        &self.categories
    }

    pub fn views(&self) -> &BTreeSet<ViewId> {
        &self.views
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// 收集统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub elements_visited: usize,
    pub duplicate_elements: usize,
    pub stale_elements: usize,
    pub fields_visited: usize,
    pub filtered_fields: usize,
    pub units_emitted: usize,
}

impl CollectionStats {
    /// 获取去重率
    pub fn deduplication_rate(&self) -> f32 {
        let reached = self.elements_visited + self.duplicate_elements;
        if reached == 0 {
            0.0
        } else {
            self.duplicate_elements as f32 / reached as f32
        }
    }
}

/// 文本提取器
pub struct TextExtractor<'a, D: HostDocument + ?Sized> {
    document: &'a D,
    scope: &'a SelectionScope,
    filter: TextFilter,
    source_language: String,
    /// 待遍历的 (类别, 视图) 组合；视图为 `None` 表示整个模型
    walks: VecDeque<(&'a CategoryId, Option<&'a ViewId>)>,
    elements: VecDeque<ElementHandle>,
    ready: VecDeque<TranslationUnit>,
    seen: HashSet<ElementHandle>,
    validated: bool,
    finished: bool,
    stats: CollectionStats,
}

impl<'a, D: HostDocument + ?Sized> TextExtractor<'a, D> {
    pub fn new(
        document: &'a D,
        scope: &'a SelectionScope,
        filter: TextFilter,
        source_language: impl Into<String>,
    ) -> Self {
        let walks = scope
            .categories
            .iter()
            .flat_map(|category| {
                let views: Vec<Option<&'a ViewId>> = if scope.views.is_empty() {
                    vec![None]
                } else {
                    scope.views.iter().map(Some).collect()
                };
                views.into_iter().map(move |view| (category, view))
            })
            .collect();

        Self {
            document,
            scope,
            filter,
            source_language: source_language.into(),
            walks,
            elements: VecDeque::new(),
            ready: VecDeque::new(),
            seen: HashSet::new(),
            validated: false,
            finished: false,
            stats: CollectionStats::default(),
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    /// 一次性取出全部单元
    ///
    /// # 返回值
    ///
    /// 按遍历顺序排列的翻译单元和收集统计；任何提取失败都会原样返回。
    pub fn collect_all(mut self) -> TranslationResult<(Vec<TranslationUnit>, CollectionStats)> {
        let mut units = Vec::new();
        for unit in self.by_ref() {
            units.push(unit?);
        }
        Ok((units, self.stats))
    }

    fn validate(&self) -> TranslationResult<()> {
        if !self.document.is_session_valid() {
            return Err(TranslationError::ExtractionFailure(
                "文档会话已失效".to_string(),
            ));
        }

        if let Some(category) = self
            .scope
            .categories
            .iter()
            .find(|category| !self.document.has_category(category))
        {
            return Err(HostError::UnknownCategory(category.clone()).into());
        }

        if let Some(view) = self
            .scope
            .views
            .iter()
            .find(|view| !self.document.has_view(view))
        {
            return Err(HostError::UnknownView(view.clone()).into());
        }

        Ok(())
    }

    fn load_walk(&mut self, category: &CategoryId, view: Option<&ViewId>) -> TranslationResult<()> {
        let elements = match view {
            Some(view) => self.document.elements_in_view(category, view),
            None => self.document.elements_of_category(category),
        }
        .map_err(extraction_failure)?;

        tracing::trace!(
            "遍历类别 {} 视图 {}: {} 个元素",
            category,
            view.map_or("<模型>", ViewId::as_str),
            elements.len()
        );
        self.elements.extend(elements);
        Ok(())
    }

    fn expand_element(&mut self, element: ElementHandle) -> TranslationResult<()> {
        if !self.seen.insert(element) {
            self.stats.duplicate_elements += 1;
            return Ok(());
        }
        self.stats.elements_visited += 1;

        let fields = match self.document.text_fields(element) {
            Ok(fields) => fields,
            Err(HostError::StaleHandle(_)) => {
                self.stats.stale_elements += 1;
                return Ok(());
            }
            Err(e) => return Err(extraction_failure(e)),
        };

        for (field, text) in fields {
            self.stats.fields_visited += 1;
            if !self.filter.should_translate(&text) {
                self.stats.filtered_fields += 1;
                continue;
            }
            self.ready.push_back(TranslationUnit::new(
                element,
                field,
                text,
                self.source_language.clone(),
            ));
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        tracing::debug!(
            "文本提取完成: 访问 {} 个元素, 重复 {} 个, 过滤 {} 个字段, 产出 {} 个单元",
            self.stats.elements_visited,
            self.stats.duplicate_elements,
            self.stats.filtered_fields,
            self.stats.units_emitted
        );
    }

    fn fail(&mut self, error: TranslationError) -> Option<TranslationResult<TranslationUnit>> {
        self.finished = true;
        self.ready.clear();
        tracing::error!("文本提取失败: {}", error);
        Some(Err(error))
    }
}

impl<'a, D: HostDocument + ?Sized> Iterator for TextExtractor<'a, D> {
    type Item = TranslationResult<TranslationUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.validated {
            self.validated = true;
            if let Err(e) = self.validate() {
                return self.fail(e);
            }
        }

        loop {
            if let Some(unit) = self.ready.pop_front() {
                self.stats.units_emitted += 1;
                return Some(Ok(unit));
            }

            if let Some(element) = self.elements.pop_front() {
                if let Err(e) = self.expand_element(element) {
                    return self.fail(e);
                }
                continue;
            }

            match self.walks.pop_front() {
                Some((category, view)) => {
                    if let Err(e) = self.load_walk(category, view) {
                        return self.fail(e);
                    }
                }
                None => {
                    self.finish();
                    return None;
                }
            }
        }
    }
}

impl<'a, D: HostDocument + ?Sized> FusedIterator for TextExtractor<'a, D> {}

fn extraction_failure(error: HostError) -> TranslationError {
    TranslationError::ExtractionFailure(error.to_string())
}
