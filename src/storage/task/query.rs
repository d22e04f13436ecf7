use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::schedule::types::{Task, TaskStatus, TaskType};

/// Sortable task columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    CreateTime,
    UpdateTime,
    StartTime,
    EndTime,
    Priority,
    Progress,
    Name,
}

impl OrderBy {
    fn compare(&self, a: &Task, b: &Task) -> Ordering {
        match self {
            OrderBy::CreateTime => a.create_time.cmp(&b.create_time),
            OrderBy::UpdateTime => a.update_time.cmp(&b.update_time),
            OrderBy::StartTime => a.start_time.cmp(&b.start_time),
            OrderBy::EndTime => a.end_time.cmp(&b.end_time),
            OrderBy::Priority => a.priority.cmp(&b.priority),
            OrderBy::Progress => a.progress.total_cmp(&b.progress),
            OrderBy::Name => a.name.cmp(&b.name),
        }
    }
}

/// Filters, ordering and paging for task listings. Newest first by default.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub category: Option<String>,
    /// Substring of name, file name, description or url.
    pub keyword: Option<String>,
    pub order_by: OrderBy,
    pub ascending: bool,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn order_by(mut self, order_by: OrderBy, ascending: bool) -> Self {
        self.order_by = order_by;
        self.ascending = ascending;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// The keyword with surrounding blanks removed, if any is left.
    pub fn search_term(&self) -> Option<&str> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if self.task_type.is_some_and(|t| t != task.task_type) {
            return false;
        }
        if let Some(category) = &self.category {
            if &task.category != category {
                return false;
            }
        }
        match self.search_term() {
            Some(term) => [&task.name, &task.file_name, &task.description, &task.url]
                .iter()
                .any(|field| field.contains(term)),
            None => true,
        }
    }

    /// Sort order for in-memory listings; ties fall back to the id.
    pub fn compare(&self, a: &Task, b: &Task) -> Ordering {
        let ordering = self.order_by.compare(a, b);
        let ordering = if self.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    }

    /// Applies filter, order and paging to an in-memory collection.
    pub fn apply<'a>(&self, tasks: impl Iterator<Item = &'a Task>) -> Vec<Task> {
        let mut matched: Vec<&Task> = tasks.filter(|t| self.matches(t)).collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
