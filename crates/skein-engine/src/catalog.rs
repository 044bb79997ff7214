//! Tool catalogue rendering for prompt-injected dialects.

use skein_protocol::ToolDefinition;

/// Render the tool catalogue as instruction text: name, description, and
/// the parameter schema of each tool.
pub fn format_tool_catalog(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return "No tools are available.".to_string();
    }

    let mut output = String::from("## Available Tools\n\n");

    for tool in tools {
        output.push_str(&format!("### {}\n", tool.name));
        output.push_str(&format!("{}\n", tool.description));

        if let Some(props) = tool
            .parameters
            .get("properties")
            .and_then(|p| p.as_object())
        {
            if !props.is_empty() {
                output.push_str("\nParameters:\n");
                for (name, schema) in props {
                    let type_str = schema.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                    let desc = schema
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("");
                    output.push_str(&format!("- `{}` ({}): {}\n", name, type_str, desc));
                }
            }
        }
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_catalog() {
        assert_eq!(format_tool_catalog(&[]), "No tools are available.");
    }

    #[test]
    fn test_catalog_lists_parameters() {
        let tools = vec![ToolDefinition::new(
            "read_file",
            "Read a file from disk",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path to the file"}
                }
            }),
        )];

        let formatted = format_tool_catalog(&tools);
        assert!(formatted.contains("### read_file"));
        assert!(formatted.contains("Read a file from disk"));
        assert!(formatted.contains("`path` (string)"));
    }
}
