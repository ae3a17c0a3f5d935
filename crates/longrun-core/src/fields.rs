//! Declared data fields
//!
//! Workflows declare their named data fields up front. The resulting metadata
//! drives `execute_action` parameter application (parameters land in matching
//! fields) and gives tests a way to inject state by name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::values::ValueKind;

/// Declaration of one named data field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFieldDescriptor {
    /// Persisted name of the field
    pub name: String,

    /// Kind of value the field holds
    pub kind: ValueKind,

    /// Transient fields are lost on restart and never persisted
    pub transient: bool,
}

impl DataFieldDescriptor {
    /// A persistent field
    pub fn persistent(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            transient: false,
        }
    }

    /// A transient field
    pub fn transient(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            transient: true,
        }
    }
}

/// The collected field declarations of one workflow
#[derive(Debug, Default)]
pub struct WorkflowMetadata {
    fields: Vec<DataFieldDescriptor>,
    by_name: HashMap<String, usize>,
}

impl WorkflowMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declaration; two fields with the same persisted name fail
    pub fn declare(&mut self, descriptor: DataFieldDescriptor) -> Result<()> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(WorkflowError::invalid_usage(format!(
                "data field '{}' is declared twice",
                descriptor.name
            )));
        }
        self.by_name
            .insert(descriptor.name.clone(), self.fields.len());
        self.fields.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DataFieldDescriptor> {
        self.by_name.get(name).map(|idx| &self.fields[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Declarations in declaration order
    pub fn fields(&self) -> impl Iterator<Item = &DataFieldDescriptor> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_declaration_fails() {
        let mut metadata = WorkflowMetadata::new();
        metadata
            .declare(DataFieldDescriptor::persistent("Counter", ValueKind::Int))
            .unwrap();

        let err = metadata
            .declare(DataFieldDescriptor::transient("Counter", ValueKind::Int))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidUsage(_)));
    }

    #[test]
    fn test_lookup_and_order() {
        let mut metadata = WorkflowMetadata::new();
        metadata
            .declare(DataFieldDescriptor::persistent("B", ValueKind::String))
            .unwrap();
        metadata
            .declare(DataFieldDescriptor::transient("A", ValueKind::Bool))
            .unwrap();

        assert!(metadata.get("B").is_some());
        assert!(metadata.get("B").map(|d| !d.transient).unwrap());
        assert!(metadata.get("A").map(|d| d.transient).unwrap());

        let names: Vec<&str> = metadata.fields().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
