//! Task id arena
//!
//! Tasks are identified by generation-checked keys. The default (null) key is
//! never handed out, so it can stand for "no task".

use slotmap::{new_key_type, SlotMap};

use super::TaskType;
use crate::render::frame::DescriptorLayoutInfo;

new_key_type! {
    /// Identifier of a registered render task
    pub struct TaskId;
}

/// What the registry knows about a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    /// Task kind, fixed at construction
    pub task_type: TaskType,
    /// Descriptor layout used to size frame descriptor pools
    pub layout: Option<DescriptorLayoutInfo>,
    /// Name for logs
    pub label: String,
}

/// Arena of registered tasks
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: SlotMap<TaskId, TaskEntry>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its id
    pub fn register(
        &mut self,
        label: impl Into<String>,
        task_type: TaskType,
        layout: Option<DescriptorLayoutInfo>,
    ) -> TaskId {
        let label = label.into();
        log::debug!("Registered {task_type:?} task '{label}'");
        self.tasks.insert(TaskEntry { task_type, layout, label })
    }

    /// Remove a task; its id is never reused
    pub fn unregister(&mut self, id: TaskId) -> Option<TaskEntry> {
        self.tasks.remove(id)
    }

    /// Look up a task
    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.tasks.get(id)
    }

    /// Layouts of every registered task, one per task that has one
    pub fn layouts(&self) -> Vec<DescriptorLayoutInfo> {
        self.tasks.values().filter_map(|entry| entry.layout.clone()).collect()
    }

    /// Registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{self, Handle};
    use slotmap::Key;

    #[test]
    fn test_ids_are_unique_and_never_null() {
        let mut registry = TaskRegistry::new();
        let a = registry.register("a", TaskType::Graphics, None);
        let b = registry.register("b", TaskType::Compute, None);
        assert_ne!(a, b);
        assert!(!a.is_null() && !b.is_null());
        assert!(TaskId::default().is_null());
        assert!(registry.get(TaskId::default()).is_none());
    }

    #[test]
    fn test_removed_ids_are_stale() {
        let mut registry = TaskRegistry::new();
        let a = registry.register("a", TaskType::Transfer, None);
        assert_eq!(registry.unregister(a).unwrap().label, "a");
        let b = registry.register("b", TaskType::Transfer, None);
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.get(b).unwrap().task_type, TaskType::Transfer);
    }

    #[test]
    fn test_layouts_collects_one_per_task() {
        let mut registry = TaskRegistry::new();
        let shared = DescriptorLayoutInfo::uniform_buffer(vk::DescriptorSetLayout::from_raw(7));
        registry.register("first", TaskType::Graphics, Some(shared.clone()));
        registry.register("second", TaskType::Graphics, Some(shared));
        registry.register("copy", TaskType::Transfer, None);
        assert_eq!(registry.layouts().len(), 2);
        assert_eq!(registry.len(), 3);
    }
}
