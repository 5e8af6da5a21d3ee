//! Tool usage hints for the system prompt, collected from enabled tools
//! that carry guidance beyond their schema.

use std::sync::Arc;

use mira_domain::Result;
use mira_tools::ToolRegistry;

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

pub struct ToolGuidanceTrinket {
    registry: Arc<ToolRegistry>,
}

impl ToolGuidanceTrinket {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

impl Trinket for ToolGuidanceTrinket {
    fn name(&self) -> &'static str {
        "ToolGuidanceTrinket"
    }

    fn variable_name(&self) -> &'static str {
        "tool_guidance"
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        // Context-supplied hints win (tests, previews); default to the
        // registry's enabled tools.
        let hints = match &context.tool_hints {
            Some(h) => h.clone(),
            None => self.registry.hints(),
        };

        let mut valid: Vec<(String, String)> = hints
            .into_iter()
            .filter(|(_, hint)| !hint.trim().is_empty())
            .collect();
        if valid.is_empty() {
            return Ok(String::new());
        }
        valid.sort_by(|a, b| a.0.cmp(&b.0));

        let mut parts = vec!["<tool_guidance>".to_string()];
        for (tool_name, hint) in valid {
            let attr_name = tool_name.trim_end_matches("_tool");
            parts.push(format!("<tool name=\"{attr_name}\">"));
            parts.push(hint.trim().to_string());
            parts.push("</tool>".into());
        }
        parts.push("</tool_guidance>".into());
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_hints(hints: &[(&str, &str)]) -> TrinketContext {
        TrinketContext {
            tool_hints: Some(
                hints.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn formats_sorted_hints_without_tool_suffix() {
        let trinket = ToolGuidanceTrinket::new(Arc::new(ToolRegistry::new()));
        let content = trinket
            .generate_content(&with_hints(&[
                ("web_tool", "Prefer search before fetch."),
                ("email_tool", "Never send without confirmation."),
            ]))
            .unwrap();
        assert!(content.starts_with("<tool_guidance>"));
        let email_pos = content.find("name=\"email\"").unwrap();
        let web_pos = content.find("name=\"web\"").unwrap();
        assert!(email_pos < web_pos);
    }

    #[test]
    fn empty_hints_yield_no_section() {
        let trinket = ToolGuidanceTrinket::new(Arc::new(ToolRegistry::new()));
        let content = trinket
            .generate_content(&with_hints(&[("web_tool", "   ")]))
            .unwrap();
        assert!(content.is_empty());
        let content = trinket
            .generate_content(&TrinketContext { tool_hints: Some(HashMap::new()), ..Default::default() })
            .unwrap();
        assert!(content.is_empty());
    }
}
