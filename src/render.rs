//! Multi-document YAML rendering
//!
//! Each object becomes one YAML document; documents are joined by `---`.
//! The k8s-openapi types serialize their own `apiVersion` and `kind`.

use serde::Serialize;

use crate::compiler::{GlobalResources, NamespacedResources};
use crate::{Error, Result};

/// Document separator between rendered objects
pub const DOCUMENT_SEPARATOR: &str = "---\n";

/// Collects YAML documents in the order they are pushed
#[derive(Debug, Default)]
pub struct YamlStream {
    documents: Vec<String>,
}

impl YamlStream {
    /// Create an empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize one object as a document
    pub fn push<T: Serialize>(&mut self, object: &T) -> Result<()> {
        let doc = serde_yaml::to_string(object).map_err(|e| Error::serialization(e.to_string()))?;
        self.documents.push(doc);
        Ok(())
    }

    /// Roles, then RoleBindings, of one namespace
    pub fn push_namespaced(&mut self, resources: &NamespacedResources) -> Result<()> {
        for role in &resources.roles {
            self.push(role)?;
        }
        for binding in &resources.role_bindings {
            self.push(binding)?;
        }
        Ok(())
    }

    /// ClusterRoles, then ClusterRoleBindings
    pub fn push_global(&mut self, resources: &GlobalResources) -> Result<()> {
        for role in &resources.cluster_roles {
            self.push(role)?;
        }
        for binding in &resources.cluster_role_bindings {
            self.push(binding)?;
        }
        Ok(())
    }

    /// Number of documents collected
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether no documents were collected
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Join the documents with separators
    pub fn finish(self) -> String {
        self.documents.join(DOCUMENT_SEPARATOR)
    }
}
