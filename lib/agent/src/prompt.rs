//! Prompt composition for agent requests.

use crate::types::AgentRequest;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Built-in system prompts for the stock roles. Database-configured
/// roles override these.
fn default_role_prompts() -> HashMap<String, String> {
    let mut prompts = HashMap::new();
    prompts.insert(
        "requirement-analyst".to_string(),
        "You are a senior requirements analyst. Your responsibilities:\n\
         1. Understand the user's requirement in depth\n\
         2. Analyze the project's code structure and context\n\
         3. Split the requirement into independently executable subtasks\n\
         4. Assess each subtask's complexity and dependencies\n\
         Produce a structured analysis."
            .to_string(),
    );
    prompts.insert(
        "general-developer".to_string(),
        "You are an experienced full-stack engineer. Your responsibilities:\n\
         1. Write high-quality code from the requirement and technical plan\n\
         2. Follow the project's existing conventions and architecture\n\
         3. Write the necessary tests\n\
         4. Keep the code maintainable and extensible\n\
         Modify the code files directly; do not output fragments."
            .to_string(),
    );
    prompts.insert(
        "code-reviewer".to_string(),
        "You are a strict code reviewer. Focus on:\n\
         1. Code quality and maintainability\n\
         2. Potential bugs and security issues\n\
         3. Performance problems\n\
         4. Conformance to project conventions\n\
         5. Test coverage\n\
         Produce a structured review report."
            .to_string(),
    );
    prompts.insert(
        "qa-engineer".to_string(),
        "You are a QA engineer. Your responsibilities:\n\
         1. Write test cases from the requirement\n\
         2. Verify the feature against its acceptance criteria\n\
         3. Check boundary conditions and error paths\n\
         4. Produce a test report"
            .to_string(),
    );
    prompts
}

/// Constructs the full prompt for an agent request: role prompt, task
/// instructions, upstream context, reviewer feedback, and mode-specific
/// output requirements.
pub struct PromptBuilder {
    role_prompts: HashMap<String, String>,
}

impl PromptBuilder {
    /// Creates a builder with the built-in role prompts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            role_prompts: default_role_prompts(),
        }
    }

    /// Sets or overrides a role's system prompt.
    pub fn set_role_prompt(&mut self, role: impl Into<String>, prompt: impl Into<String>) {
        self.role_prompts.insert(role.into(), prompt.into());
    }

    /// Builds the full prompt for a request.
    #[must_use]
    pub fn build(&self, req: &AgentRequest) -> String {
        let mut parts = Vec::new();

        // Role system prompt: explicit prompt wins, then the built-in
        // for the role recorded in the context.
        if !req.role_prompt.is_empty() {
            parts.push(req.role_prompt.clone());
        } else if let Some(prompt) = self.role_prompts.get(extract_role(req)) {
            parts.push(prompt.clone());
        }

        if !req.prompt.is_empty() {
            parts.push(format!("---\n## Task\n{}", req.prompt));
        }

        let context = format_context(&req.context);
        if !context.is_empty() {
            parts.push(format!("---\n## Upstream node outputs\n{context}"));
        }

        if !req.feedback.is_empty() {
            parts.push(format!(
                "---\n## Reviewer feedback (address all of it)\n{}",
                req.feedback
            ));
        }

        if let Some(instruction) = mode_instruction(&req.mode) {
            parts.push(format!("---\n## Output requirements\n{instruction}"));
        }

        parts.join("\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_role(req: &AgentRequest) -> &str {
    req.context
        .get("_role")
        .and_then(JsonValue::as_str)
        .unwrap_or("")
}

/// Formats upstream node outputs as readable text, hiding the
/// underscore-prefixed internal fields.
fn format_context(context: &serde_json::Map<String, JsonValue>) -> String {
    let filtered: serde_json::Map<String, JsonValue> = context
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if filtered.is_empty() {
        return String::new();
    }

    serde_json::to_string_pretty(&filtered).unwrap_or_else(|_| format!("{filtered:?}"))
}

fn mode_instruction(mode: &str) -> Option<&'static str> {
    match mode {
        "spec" => Some(
            "Current mode: planning (spec).\n\
             Produce a detailed implementation plan covering:\n\
             - approach and steps\n\
             - the files involved\n\
             - an effort estimate\n\
             - risks\n\
             Do not modify code.",
        ),
        "execute" => Some(
            "Current mode: execution (execute).\n\
             Modify the code files to complete the task.\n\
             The result must compile and run.",
        ),
        "review" => Some(
            "Current mode: review (review).\n\
             Review the code changes and produce a structured report:\n\
             - whether it passes (passed: true/false)\n\
             - the issues found\n\
             - suggested improvements",
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_role(role: &str) -> AgentRequest {
        let mut context = serde_json::Map::new();
        context.insert("_role".to_string(), json!(role));
        AgentRequest {
            context,
            ..Default::default()
        }
    }

    #[test]
    fn explicit_role_prompt_wins() {
        let builder = PromptBuilder::new();
        let mut req = request_with_role("general-developer");
        req.role_prompt = "You are a database specialist.".to_string();

        let prompt = builder.build(&req);
        assert!(prompt.starts_with("You are a database specialist."));
        assert!(!prompt.contains("full-stack engineer"));
    }

    #[test]
    fn built_in_role_prompt_used_as_fallback() {
        let builder = PromptBuilder::new();
        let prompt = builder.build(&request_with_role("code-reviewer"));
        assert!(prompt.contains("strict code reviewer"));
    }

    #[test]
    fn internal_context_fields_are_hidden() {
        let builder = PromptBuilder::new();
        let mut req = request_with_role("general-developer");
        req.context
            .insert("plan".to_string(), json!("ship the login form"));
        req.context.insert("_feedback".to_string(), json!("hidden"));

        let prompt = builder.build(&req);
        assert!(prompt.contains("ship the login form"));
        assert!(!prompt.contains("hidden"));
    }

    #[test]
    fn feedback_section_present_on_rollback() {
        let builder = PromptBuilder::new();
        let mut req = request_with_role("general-developer");
        req.feedback = "tighten the error handling".to_string();

        let prompt = builder.build(&req);
        assert!(prompt.contains("Reviewer feedback"));
        assert!(prompt.contains("tighten the error handling"));
    }

    #[test]
    fn mode_sections_by_mode() {
        let builder = PromptBuilder::new();

        let mut req = request_with_role("general-developer");
        req.mode = "spec".to_string();
        assert!(builder.build(&req).contains("Do not modify code"));

        req.mode = "review".to_string();
        assert!(builder.build(&req).contains("passed: true/false"));

        req.mode = "unheard-of".to_string();
        assert!(!builder.build(&req).contains("Output requirements"));
    }

    #[test]
    fn custom_role_prompt_override() {
        let mut builder = PromptBuilder::new();
        builder.set_role_prompt("sre", "You are an SRE.");
        let prompt = builder.build(&request_with_role("sre"));
        assert!(prompt.contains("You are an SRE."));
    }
}
