//! Role-to-adapter resolution.

use crate::adapter::Adapter;
use crate::error::AgentError;
use std::collections::HashMap;
use std::sync::Arc;

/// Binds a role to a provider and optional model override.
#[derive(Debug, Clone)]
struct RoleBinding {
    provider: String,
    model: Option<String>,
}

/// In-memory registry mapping `role → provider → adapter`.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    roles: HashMap<String, RoleBinding>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Maps a role to a provider, with an optional model override.
    pub fn map_role(&mut self, role: impl Into<String>, provider: impl Into<String>, model: Option<String>) {
        self.roles.insert(
            role.into(),
            RoleBinding {
                provider: provider.into(),
                model,
            },
        );
    }

    /// Resolves a role to its adapter and model override.
    ///
    /// # Errors
    ///
    /// Returns an error naming the known roles when the role (or its
    /// provider) is unmapped.
    pub fn adapter_for_role(
        &self,
        role: &str,
    ) -> Result<(Arc<dyn Adapter>, Option<String>), AgentError> {
        let binding = self.roles.get(role).ok_or_else(|| self.unknown_role(role))?;
        let adapter = self
            .adapters
            .get(&binding.provider)
            .ok_or_else(|| self.unknown_role(role))?;
        Ok((Arc::clone(adapter), binding.model.clone()))
    }

    /// Registered provider names.
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Mapped role names.
    #[must_use]
    pub fn roles(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn unknown_role(&self, role: &str) -> AgentError {
        AgentError::NoAdapterForRole {
            role: role.to_string(),
            known: self.roles().join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ExecuteOptions;
    use crate::types::{AgentRequest, AgentResponse};
    use async_trait::async_trait;

    struct NamedAdapter(&'static str);

    #[async_trait]
    impl Adapter for NamedAdapter {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _req: &AgentRequest,
            _opts: &ExecuteOptions,
        ) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::default())
        }
    }

    #[test]
    fn resolves_role_to_adapter_and_model() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NamedAdapter("claude-code")));
        registry.map_role("code-reviewer", "claude-code", Some("opus".to_string()));

        let (adapter, model) = registry.adapter_for_role("code-reviewer").expect("resolve");
        assert_eq!(adapter.name(), "claude-code");
        assert_eq!(model.as_deref(), Some("opus"));
    }

    #[test]
    fn unknown_role_lists_known_roles() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NamedAdapter("mock")));
        registry.map_role("general-developer", "mock", None);

        let err = registry.adapter_for_role("ghost").unwrap_err();
        match err {
            AgentError::NoAdapterForRole { role, known } => {
                assert_eq!(role, "ghost");
                assert!(known.contains("general-developer"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn role_mapped_to_missing_provider_fails() {
        let mut registry = AdapterRegistry::new();
        registry.map_role("general-developer", "not-registered", None);

        assert!(registry.adapter_for_role("general-developer").is_err());
    }
}
