use serde::Deserialize;
use serde_json::Value;

/// Events from the agent CLI's stream-json output format
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<Value>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result(ResultEvent),
}

impl StreamEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamEvent::System { session_id, .. }
            | StreamEvent::Assistant { session_id, .. }
            | StreamEvent::User { session_id, .. } => session_id.as_deref(),
            StreamEvent::Result(result) => result.session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(other)]
    Other,
}

/// Final event of a turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub usage: Usage,
}

impl ResultEvent {
    pub fn succeeded(&self) -> bool {
        !self.is_error && (self.subtype.is_empty() || self.subtype == "success")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Decoded payload of a tool invocation. Known tools get a typed shape,
/// everything else stays opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    AskUserQuestion(Vec<Question>),
    ExitPlanMode { plan: String },
    Other(Value),
}

impl ToolInput {
    /// Malformed payloads for known tools fall back to `Other`.
    pub fn decode(name: &str, input: &Value) -> Self {
        match name {
            "AskUserQuestion" => {
                #[derive(Deserialize)]
                struct Payload {
                    questions: Vec<Question>,
                }
                match serde_json::from_value::<Payload>(input.clone()) {
                    Ok(payload) if !payload.questions.is_empty() => {
                        ToolInput::AskUserQuestion(payload.questions)
                    }
                    _ => ToolInput::Other(input.clone()),
                }
            }
            "ExitPlanMode" => match input.get("plan").and_then(|v| v.as_str()) {
                Some(plan) => ToolInput::ExitPlanMode {
                    plan: plan.to_string(),
                },
                None => ToolInput::Other(input.clone()),
            },
            _ => ToolInput::Other(input.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Decode one line of agent output.
pub fn decode_line(line: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        "AskUserQuestion" => {
            let first = input
                .get("questions")
                .and_then(|v| v.get(0))
                .and_then(|q| q.get("question"))
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 50))
                .unwrap_or_else(|| "question".to_string());
            format!("Asking: {}", first)
        }
        "ExitPlanMode" => "Presenting plan".to_string(),
        "TodoWrite" => "Updating todo list".to_string(),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis, counting characters rather than bytes
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// First line of a longer text, truncated for log display
pub fn first_line_snippet(text: &str, max_len: usize) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    truncate_str(first_line.trim(), max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        let event = decode_line(json).unwrap();

        if let StreamEvent::Assistant {
            message,
            session_id,
        } = event
        {
            assert_eq!(session_id.as_deref(), Some("abc"));
            assert_eq!(message.content.len(), 1);
            if let ContentBlock::ToolUse { name, input, id } = &message.content[0] {
                assert_eq!(name, "Read");
                assert_eq!(id, "123");
                assert_eq!(input["file_path"], "/foo/bar.rs");
            } else {
                panic!("Expected ToolUse");
            }
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"s-1","model":"opus","tools":["Read"]}"#;
        let event = decode_line(json).unwrap();
        assert_eq!(event.session_id(), Some("s-1"));
        assert!(matches!(event, StreamEvent::System { ref subtype, .. } if subtype == "init"));
    }

    #[test]
    fn test_parse_result_with_usage() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"s-2","total_cost_usd":0.25,"duration_ms":1200,"num_turns":4,"usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":900}}"#;
        let event = decode_line(json).unwrap();
        let StreamEvent::Result(result) = event else {
            panic!("Expected Result event");
        };
        assert!(result.succeeded());
        assert_eq!(result.result.as_deref(), Some("done"));
        assert_eq!(result.session_id.as_deref(), Some("s-2"));
        assert_eq!(result.duration_ms, 1200);
        assert_eq!(result.usage.output_tokens, 50);
        assert_eq!(result.usage.input_tokens, 100);
        assert_eq!(result.usage.cache_read_input_tokens, 900);
        assert!((result.total_cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_result_is_not_success() {
        let json = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        let StreamEvent::Result(result) = decode_line(json).unwrap() else {
            panic!("Expected Result event");
        };
        assert!(!result.succeeded());
    }

    #[test]
    fn test_unknown_type_fails_only_that_line() {
        assert!(decode_line(r#"{"type":"telemetry","x":1}"#).is_err());
        assert!(decode_line("not json at all").is_err());
        assert!(decode_line(r#"{"type":"user","message":{"role":"user"}}"#).is_ok());
    }

    #[test]
    fn test_unknown_content_block_is_tolerated() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"server_tool_use","x":1},{"type":"text","text":"hi"}]}}"#;
        let StreamEvent::Assistant { message, .. } = decode_line(json).unwrap() else {
            panic!("Expected Assistant event");
        };
        assert!(matches!(message.content[0], ContentBlock::Other));
        assert!(matches!(&message.content[1], ContentBlock::Text { text } if text == "hi"));
    }

    #[test]
    fn test_decode_ask_user_question() {
        let input = serde_json::json!({
            "questions": [{
                "question": "Which database?",
                "header": "Storage",
                "options": [
                    {"label": "Postgres", "description": "Relational"},
                    {"label": "SQLite"}
                ],
                "multiSelect": false
            }]
        });
        let ToolInput::AskUserQuestion(questions) = ToolInput::decode("AskUserQuestion", &input)
        else {
            panic!("Expected structured question");
        };
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].header, "Storage");
        assert_eq!(questions[0].options[1].label, "SQLite");
        assert_eq!(questions[0].options[1].description, "");
        assert!(!questions[0].multi_select);
    }

    #[test]
    fn test_malformed_question_yields_no_structured_question() {
        let missing = serde_json::json!({"prompt": "what?"});
        assert!(matches!(
            ToolInput::decode("AskUserQuestion", &missing),
            ToolInput::Other(_)
        ));

        let empty = serde_json::json!({"questions": []});
        assert!(matches!(
            ToolInput::decode("AskUserQuestion", &empty),
            ToolInput::Other(_)
        ));

        let wrong_shape = serde_json::json!({"questions": [{"options": "nope"}]});
        assert!(matches!(
            ToolInput::decode("AskUserQuestion", &wrong_shape),
            ToolInput::Other(_)
        ));
    }

    #[test]
    fn test_decode_exit_plan_mode() {
        let input = serde_json::json!({"plan": "## Task 1: Do it"});
        assert_eq!(
            ToolInput::decode("ExitPlanMode", &input),
            ToolInput::ExitPlanMode {
                plan: "## Task 1: Do it".to_string()
            }
        );
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
    }

    #[test]
    fn test_truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_first_line_snippet_skips_blank_lines() {
        assert_eq!(first_line_snippet("\n\n  Hello there\nmore", 40), "Hello there");
    }
}
