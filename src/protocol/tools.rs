use crate::errors::{DeskPilotError, DeskPilotResult};

/// The single function the remote agent may call.
pub const COMPUTER_ACTION: &str = "execute_computer_action";

/// Loads the function declarations sent in the setup frame.
/// The JSON is embedded at compile time via include_str!.
pub fn function_declarations() -> DeskPilotResult<Vec<serde_json::Value>> {
    let json = include_str!("../../prompts/tools/computer_action.json");
    serde_json::from_str(json)
        .map_err(|e| DeskPilotError::Config(format!("Failed to parse function declarations: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_exactly_the_computer_action() {
        let decls = function_declarations().unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0]["name"], COMPUTER_ACTION);
        let actions = decls[0]["parameters"]["properties"]["action"]["enum"].as_array().unwrap();
        assert!(actions.iter().any(|a| a == "complex_task"));
        assert!(actions.iter().any(|a| a == "press"));
    }
}
