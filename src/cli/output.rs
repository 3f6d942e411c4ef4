//! Human or JSON rendering of command results.

use serde::Serialize;
use serde_json::{json, Value};

/// A command result printable either for people or for scripts.
pub trait CommandOutput: Serialize {
    /// Rendering for people.
    fn to_human(&self) -> String;

    /// Rendering for scripts; the serialized value by default.
    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| json!({"error": err.to_string()}))
    }
}

fn render<T: CommandOutput>(result: &T, json_mode: bool) -> String {
    if json_mode {
        serde_json::to_string_pretty(&result.to_json()).unwrap_or_default()
    } else {
        result.to_human()
    }
}

/// Print `result` in the requested mode.
pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    println!("{}", render(result, json_mode));
}

/// Failure rendering shared by every subcommand.
pub fn render_error(err: &anyhow::Error, json_mode: bool) -> String {
    if json_mode {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = json!({
            "success": false,
            "error": err.to_string(),
            "causes": causes,
        });
        serde_json::to_string_pretty(&body).unwrap_or_default()
    } else {
        format!("Error: {err:#}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[derive(Serialize)]
    struct Greeting {
        name: String,
    }

    impl CommandOutput for Greeting {
        fn to_human(&self) -> String {
            format!("hello {}", self.name)
        }
    }

    #[test]
    fn test_render_modes() {
        let greeting = Greeting { name: "node1".into() };
        assert_eq!(render(&greeting, false), "hello node1");
        let parsed: Value = serde_json::from_str(&render(&greeting, true)).unwrap();
        assert_eq!(parsed["name"], "node1");
    }

    #[test]
    fn test_render_error_lists_causes() {
        let err = Err::<(), _>(anyhow::anyhow!("file not found"))
            .context("failed to load config")
            .unwrap_err();
        assert_eq!(render_error(&err, false), "Error: failed to load config: file not found");

        let parsed: Value = serde_json::from_str(&render_error(&err, true)).unwrap();
        assert_eq!(parsed["error"], "failed to load config");
        assert_eq!(parsed["causes"][0], "file not found");
    }
}
