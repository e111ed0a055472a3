use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, ProcessError};
use crate::phase::PermissionLevel;
use crate::process::{EventStream, ProcessControl, ProcessSpec};
use crate::retry::{RetryConfig, RetryError, run_with_retry_until};
use crate::stream::{
    ContentBlock, Question, StreamEvent, ToolInput, Usage, describe_tool_use, first_line_snippet,
};

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub permission: PermissionLevel,
    pub resume_session: Option<String>,
    pub timeout: Duration,
    pub images: Vec<PathBuf>,
    pub working_dir: PathBuf,
    /// Short name used for transcripts, e.g. "executingTask-task-2".
    pub label: String,
}

/// An `AskUserQuestion` raised during a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedQuestion {
    pub tool_use_id: String,
    pub questions: Vec<Question>,
}

/// What came back from one agent turn.
#[derive(Debug, Clone, Default)]
pub struct AgentTurn {
    /// Concatenated assistant text blocks.
    pub text: String,
    /// Final `result` text, if the turn reached one.
    pub result_text: Option<String>,
    /// Plan presented through `ExitPlanMode`.
    pub plan_text: Option<String>,
    pub session_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub is_error: bool,
    pub question: Option<RaisedQuestion>,
    pub tools_used: Vec<String>,
    /// A `result` event was received.
    pub completed: bool,
}

impl AgentTurn {
    pub fn succeeded(&self) -> bool {
        self.completed && !self.is_error
    }

    /// Best text to act on: the result if present, otherwise the streamed text.
    pub fn output(&self) -> &str {
        match self.result_text.as_deref() {
            Some(result) if !result.trim().is_empty() => result,
            _ => &self.text,
        }
    }
}

/// Runs agent turns. The engine only talks to the agent through this trait.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one turn to completion, retrying transient failures.
    ///
    /// When `control` fires the turn ends with [`AgentError::Halted`] and the
    /// process has been reaped.
    async fn run_turn(
        &self,
        request: &AgentRequest,
        control: &ProcessControl,
    ) -> Result<AgentTurn, AgentError>;
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    /// Edit phases use `--dangerously-skip-permissions` instead of
    /// `--permission-mode acceptEdits`.
    pub skip_permissions: bool,
    pub retry: RetryConfig,
    /// Where to write prompt and output transcripts, if anywhere.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
            skip_permissions: false,
            retry: RetryConfig::default(),
            transcript_dir: None,
        }
    }
}

/// [`AgentRunner`] backed by the `claude` CLI in stream-json mode.
pub struct ClaudeRunner {
    settings: AgentSettings,
    invocations: AtomicU32,
}

impl ClaudeRunner {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            invocations: AtomicU32::new(0),
        }
    }

    pub fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
            .into_iter()
            .map(String::from)
            .collect();

        match request.permission {
            PermissionLevel::Edit if self.settings.skip_permissions => {
                args.push("--dangerously-skip-permissions".to_string());
            }
            level => {
                if let Some(mode) = level.cli_mode() {
                    args.push("--permission-mode".to_string());
                    args.push(mode.to_string());
                }
            }
        }
        if !request.images.is_empty() {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
        if let Some(session) = &request.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        if let Some(model) = &self.settings.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    /// Plain prompt, or a stream-json user message when images are attached.
    pub fn stdin_payload(request: &AgentRequest) -> Result<Vec<u8>, AgentError> {
        if request.images.is_empty() {
            return Ok(request.prompt.clone().into_bytes());
        }

        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        for path in &request.images {
            let media_type = image_media_type(path).ok_or_else(|| {
                AgentError::Payload(format!("Unsupported image type: {}", path.display()))
            })?;
            let bytes = std::fs::read(path).map_err(|e| {
                AgentError::Payload(format!("Failed to read image {}: {}", path.display(), e))
            })?;
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }

        let message = json!({
            "type": "user",
            "message": { "role": "user", "content": content },
        });
        let mut line = message.to_string().into_bytes();
        line.push(b'\n');
        Ok(line)
    }

    async fn run_once(
        &self,
        request: &AgentRequest,
        attempt: u32,
        control: &ProcessControl,
    ) -> Result<AgentTurn, AgentError> {
        let payload = Self::stdin_payload(request)?;
        let args = self.build_args(request);
        let invocation = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        self.write_transcript(request, invocation, "prompt.md", &request.prompt);

        info!(
            label = %request.label,
            attempt,
            permission = ?request.permission,
            resume = request.resume_session.is_some(),
            "Starting agent turn"
        );

        // A per-attempt control lets the runner stop its own process when a
        // question arrives without marking the caller's control as fired.
        let attempt_control = control.child();
        let spec = ProcessSpec::new(&self.settings.command)
            .args(args)
            .working_dir(&request.working_dir)
            .timeout(Some(request.timeout))
            .stdin(payload);
        let mut stream = EventStream::new(spec, attempt_control.clone());

        let mut turn = AgentTurn::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => absorb(&mut turn, event, &attempt_control),
                Err(err) => {
                    if control.is_cancelled() {
                        return Err(AgentError::Halted(err));
                    }
                    if turn.question.is_some() && stopped_for_question(&err) {
                        break;
                    }
                    return Err(err.into());
                }
            }
        }

        self.write_transcript(request, invocation, "output.log", turn.output());
        info!(
            label = %request.label,
            completed = turn.completed,
            is_error = turn.is_error,
            question = turn.question.is_some(),
            cost_usd = turn.cost_usd,
            "Agent turn finished"
        );
        Ok(turn)
    }

    fn write_transcript(&self, request: &AgentRequest, invocation: u32, suffix: &str, text: &str) {
        let Some(dir) = &self.settings.transcript_dir else {
            return;
        };
        let file = dir.join(format!("{:03}-{}-{}", invocation, request.label, suffix));
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&file, text)) {
            warn!(file = %file.display(), error = %e, "Failed to write transcript");
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run_turn(
        &self,
        request: &AgentRequest,
        control: &ProcessControl,
    ) -> Result<AgentTurn, AgentError> {
        let cancel = control.token();
        let result = run_with_retry_until(&self.settings.retry, &cancel, |attempt| {
            self.run_once(request, attempt, control)
        })
        .await;

        match result {
            Ok(turn) => Ok(turn),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { attempts, last }) => Err(AgentError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            }),
            Err(RetryError::Cancelled { last, .. }) => Err(match last {
                AgentError::Process(err) => AgentError::Halted(err),
                other => other,
            }),
        }
    }
}

fn stopped_for_question(err: &ProcessError) -> bool {
    matches!(
        err,
        ProcessError::Interrupted | ProcessError::Terminated | ProcessError::NonZeroExit { .. }
    )
}

fn absorb(turn: &mut AgentTurn, event: StreamEvent, control: &ProcessControl) {
    if let Some(id) = event.session_id()
        && turn.session_id.as_deref() != Some(id)
    {
        turn.session_id = Some(id.to_string());
    }

    match event {
        StreamEvent::System { subtype, model, .. } => {
            debug!(subtype = %subtype, model = ?model, "Agent system event");
        }
        StreamEvent::Assistant { message, .. } => {
            if let Some(usage) = message.usage {
                turn.usage = usage;
            }
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => {
                        if !turn.text.is_empty() {
                            turn.text.push('\n');
                        }
                        turn.text.push_str(text);
                    }
                    ContentBlock::Thinking { thinking } => {
                        debug!(snippet = %first_line_snippet(thinking, 80), "Agent thinking");
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let description = describe_tool_use(name, input);
                        info!(tool = %name, "{}", description);
                        turn.tools_used.push(description);
                        match ToolInput::decode(name, input) {
                            ToolInput::AskUserQuestion(questions) if turn.question.is_none() => {
                                turn.question = Some(RaisedQuestion {
                                    tool_use_id: id.clone(),
                                    questions,
                                });
                                control.interrupt();
                            }
                            ToolInput::ExitPlanMode { plan } => turn.plan_text = Some(plan),
                            _ => {}
                        }
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        StreamEvent::User { .. } => {}
        StreamEvent::Result(result) => {
            turn.completed = true;
            turn.is_error = !result.succeeded();
            turn.cost_usd = result.total_cost_usd;
            turn.duration_ms = result.duration_ms;
            turn.usage = result.usage;
            turn.result_text = result.result;
        }
    }
}

fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request(dir: &Path, permission: PermissionLevel) -> AgentRequest {
        AgentRequest {
            prompt: "Do the thing".to_string(),
            permission,
            resume_session: None,
            timeout: Duration::from_secs(10),
            images: Vec::new(),
            working_dir: dir.to_path_buf(),
            label: "test".to_string(),
        }
    }

    #[test]
    fn test_args_for_plan_and_edit() {
        let dir = TempDir::new().unwrap();
        let runner = ClaudeRunner::new(AgentSettings {
            model: Some("opus".into()),
            extra_args: vec!["--add-dir".into(), "../lib".into()],
            ..AgentSettings::default()
        });

        let mut req = request(dir.path(), PermissionLevel::Plan);
        req.resume_session = Some("sess-9".into());
        let args = runner.build_args(&req);
        assert_eq!(
            args,
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--permission-mode",
                "plan",
                "--resume",
                "sess-9",
                "--model",
                "opus",
                "--add-dir",
                "../lib",
            ]
        );

        let args = runner.build_args(&request(dir.path(), PermissionLevel::Edit));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "acceptEdits"]));
    }

    #[test]
    fn test_skip_permissions_for_edit_only() {
        let dir = TempDir::new().unwrap();
        let runner = ClaudeRunner::new(AgentSettings {
            skip_permissions: true,
            ..AgentSettings::default()
        });
        let edit = runner.build_args(&request(dir.path(), PermissionLevel::Edit));
        assert!(edit.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!edit.contains(&"--permission-mode".to_string()));

        let plan = runner.build_args(&request(dir.path(), PermissionLevel::Plan));
        assert!(!plan.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_image_payload_is_stream_json() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("mock.PNG");
        fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
        let mut req = request(dir.path(), PermissionLevel::Plan);
        req.images = vec![image];

        let runner = ClaudeRunner::new(AgentSettings::default());
        assert!(
            runner
                .build_args(&req)
                .windows(2)
                .any(|w| w == ["--input-format", "stream-json"])
        );

        let payload = ClaudeRunner::stdin_payload(&req).unwrap();
        assert_eq!(payload.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "user");
        let content = value["message"]["content"].as_array().unwrap();
        assert_eq!(content[0]["text"], "Do the thing");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["source"]["data"], "iVBORw==");
    }

    #[test]
    fn test_unsupported_image_is_payload_error() {
        let dir = TempDir::new().unwrap();
        let mut req = request(dir.path(), PermissionLevel::Plan);
        req.images = vec![dir.path().join("notes.txt")];
        assert!(matches!(
            ClaudeRunner::stdin_payload(&req),
            Err(AgentError::Payload(_))
        ));
    }

    #[test]
    fn test_plain_prompt_payload() {
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), PermissionLevel::Edit);
        assert_eq!(ClaudeRunner::stdin_payload(&req).unwrap(), b"Do the thing");
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable fake agent script and return its path.
        fn fake_agent(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-claude");
            fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn runner(command: PathBuf, max_attempts: u32) -> ClaudeRunner {
            ClaudeRunner::new(AgentSettings {
                command: command.to_string_lossy().into_owned(),
                retry: RetryConfig {
                    max_attempts,
                    initial_delay: Duration::from_millis(10),
                    backoff_multiplier: 1.0,
                    max_delay: Duration::from_millis(10),
                },
                ..AgentSettings::default()
            })
        }

        #[tokio::test]
        async fn test_collects_turn() {
            let dir = TempDir::new().unwrap();
            let script = r#"
cat > "$(dirname "$0")/stdin.txt"
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Looking around"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/a/b/c.rs"}}],"usage":{"input_tokens":10,"output_tokens":5}}}'
echo 'garbage'
echo '{"type":"result","subtype":"success","is_error":false,"result":"All done","session_id":"sess-1","total_cost_usd":0.25,"duration_ms":1200,"usage":{"input_tokens":100,"output_tokens":40}}'
"#;
            let agent = fake_agent(dir.path(), script);
            let turn = runner(agent, 1)
                .run_turn(&request(dir.path(), PermissionLevel::Edit), &ProcessControl::new())
                .await
                .unwrap();

            assert!(turn.succeeded());
            assert_eq!(turn.session_id.as_deref(), Some("sess-1"));
            assert_eq!(turn.text, "Looking around");
            assert_eq!(turn.output(), "All done");
            assert_eq!(turn.tools_used, vec!["Reading: b/c.rs"]);
            assert_eq!(turn.usage.input_tokens, 100);
            assert_eq!(turn.cost_usd, 0.25);
            assert_eq!(
                fs::read_to_string(dir.path().join("stdin.txt")).unwrap(),
                "Do the thing"
            );
        }

        #[tokio::test]
        async fn test_question_interrupts_turn() {
            let dir = TempDir::new().unwrap();
            let script = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-q"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"ask-1","name":"AskUserQuestion","input":{"questions":[{"question":"Which database?","header":"DB","options":[{"label":"Postgres","description":"relational"},{"label":"SQLite","description":"embedded"}],"multiSelect":false}]}}]}}'
sleep 30
"#;
            let agent = fake_agent(dir.path(), script);
            let started = std::time::Instant::now();
            let turn = runner(agent, 3)
                .run_turn(&request(dir.path(), PermissionLevel::Plan), &ProcessControl::new())
                .await
                .unwrap();

            assert!(started.elapsed() < Duration::from_secs(20));
            let question = turn.question.unwrap();
            assert_eq!(question.tool_use_id, "ask-1");
            assert_eq!(question.questions[0].options.len(), 2);
            assert_eq!(turn.session_id.as_deref(), Some("sess-q"));
            assert!(!turn.completed);
        }

        #[tokio::test]
        async fn test_retries_exit_code_one() {
            let dir = TempDir::new().unwrap();
            let script = r#"
count_file="$(dirname "$0")/count"
n=$(cat "$count_file" 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > "$count_file"
if [ $n -lt 2 ]; then echo 'overloaded' >&2; exit 1; fi
echo '{"type":"result","subtype":"success","result":"ok","session_id":"s"}'
"#;
            let agent = fake_agent(dir.path(), script);
            let turn = runner(agent, 3)
                .run_turn(&request(dir.path(), PermissionLevel::Edit), &ProcessControl::new())
                .await
                .unwrap();
            assert!(turn.succeeded());
            assert_eq!(
                fs::read_to_string(dir.path().join("count")).unwrap().trim(),
                "2"
            );
        }

        #[tokio::test]
        async fn test_exhausts_retries() {
            let dir = TempDir::new().unwrap();
            let agent = fake_agent(dir.path(), "echo 'flaky' >&2\nexit 1\n");
            let err = runner(agent, 2)
                .run_turn(&request(dir.path(), PermissionLevel::Edit), &ProcessControl::new())
                .await
                .unwrap_err();
            match err {
                AgentError::RetriesExhausted { attempts, last } => {
                    assert_eq!(attempts, 2);
                    assert!(last.to_string().contains("flaky"));
                }
                other => panic!("Expected RetriesExhausted, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_other_exit_codes_are_not_retried() {
            let dir = TempDir::new().unwrap();
            let script = r#"
echo x >> "$(dirname "$0")/calls"
exit 2
"#;
            let agent = fake_agent(dir.path(), script);
            let err = runner(agent, 3)
                .run_turn(&request(dir.path(), PermissionLevel::Edit), &ProcessControl::new())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AgentError::Process(ProcessError::NonZeroExit { code: 2, .. })
            ));
            assert_eq!(
                fs::read_to_string(dir.path().join("calls")).unwrap().lines().count(),
                1
            );
        }

        #[tokio::test]
        async fn test_missing_agent_is_configuration_error() {
            let dir = TempDir::new().unwrap();
            let err = runner(dir.path().join("no-such-agent"), 3)
                .run_turn(&request(dir.path(), PermissionLevel::Edit), &ProcessControl::new())
                .await
                .unwrap_err();
            assert!(err.is_configuration());
        }

        #[tokio::test]
        async fn test_terminate_halts_turn() {
            let dir = TempDir::new().unwrap();
            let agent = fake_agent(dir.path(), "sleep 30\n");
            let runner = runner(agent, 3);
            let control = ProcessControl::new();
            let req = request(dir.path(), PermissionLevel::Edit);

            let stopper = control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                stopper.terminate();
            });
            let err = runner.run_turn(&req, &control).await.unwrap_err();
            assert!(matches!(err, AgentError::Halted(_)));
        }

        #[tokio::test]
        async fn test_writes_transcripts() {
            let dir = TempDir::new().unwrap();
            let agent = fake_agent(
                dir.path(),
                "cat > /dev/null\necho '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"fine\"}'\n",
            );
            let transcripts = dir.path().join("logs");
            let runner = ClaudeRunner::new(AgentSettings {
                command: agent.to_string_lossy().into_owned(),
                transcript_dir: Some(transcripts.clone()),
                ..AgentSettings::default()
            });
            runner
                .run_turn(&request(dir.path(), PermissionLevel::Plan), &ProcessControl::new())
                .await
                .unwrap();
            assert_eq!(
                fs::read_to_string(transcripts.join("001-test-prompt.md")).unwrap(),
                "Do the thing"
            );
            assert_eq!(
                fs::read_to_string(transcripts.join("001-test-output.log")).unwrap(),
                "fine"
            );
        }
    }
}
