// src/runtime/persona.rs
//! Persona provisioning for warm agents
//!
//! The warm pool spawns in two phases: a provisioner first materialises an
//! unassigned [`AgentDescriptor`] for the role, then the owning pool spawns
//! the agent from it.

use crate::runtime::agent::AgentDescriptor;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Materialises unassigned agent descriptors
#[async_trait]
pub trait PersonaProvisioner: Send + Sync {
    /// Build a descriptor for `role`. The descriptor must not carry a project.
    async fn provision(&self, role: &str) -> Result<AgentDescriptor>;
}

/// Provisioner backed by per-role JSON templates
///
/// Roles without a template get a minimal persona unless `strict` is set.
pub struct TemplatePersonaProvisioner {
    templates: HashMap<String, serde_json::Value>,
    strict: bool,
    sequence: AtomicU64,
}

impl TemplatePersonaProvisioner {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            strict: false,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_template(mut self, role: impl Into<String>, template: serde_json::Value) -> Self {
        self.templates.insert(role.into(), template);
        self
    }

    /// Refuse roles that have no template
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

impl Default for TemplatePersonaProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersonaProvisioner for TemplatePersonaProvisioner {
    async fn provision(&self, role: &str) -> Result<AgentDescriptor> {
        let persona = match self.templates.get(role) {
            Some(template) => template.clone(),
            None if self.strict => {
                return Err(FleetError::ProvisioningFailed(format!(
                    "no persona template for role {}",
                    role
                )));
            }
            None => json!({ "role": role }),
        };

        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = persona
            .get("name")
            .and_then(|v| v.as_str())
            .map(|base| format!("{} #{}", base, n))
            .unwrap_or_else(|| format!("{} #{}", role, n));

        debug!("Provisioned warm persona {} for role {}", name, role);

        Ok(AgentDescriptor {
            name,
            role: role.to_string(),
            persona,
            project_id: None,
        })
    }
}
