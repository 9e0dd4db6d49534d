use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Store directory; relative paths resolve against the data directory.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Spawn the inference server as a child process on start.
    #[serde(default)]
    pub launch_server: bool,
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub sample: bool,
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            model: default_model(),
            launch_server: false,
            launch_command: default_launch_command(),
            server_port: default_server_port(),
            request_timeout_secs: default_request_timeout(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            sample: true,
            stop_sequences: default_stop_sequences(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dedup_retain")]
    pub dedup_retain: usize,
    /// Upper bound on concurrently running workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            dedup_capacity: default_dedup_capacity(),
            dedup_retain: default_dedup_retain(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Pause after each persisted fragment; 0 disables it.
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,
    #[serde(default = "default_fragment_buffer")]
    pub fragment_buffer: usize,
    #[serde(default = "default_true")]
    pub serialize_per_user: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            typing_delay_ms: default_typing_delay_ms(),
            fragment_buffer: default_fragment_buffer(),
            serialize_per_user: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    #[serde(default)]
    pub max_prompt_chars: Option<usize>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            context_window: default_context_window(),
            recent_window: default_recent_window(),
            max_prompt_chars: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Never,
    Hourly,
    #[default]
    Daily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_file")]
    pub file_name: String,
    #[serde(default)]
    pub rotation: LogRotation,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file_name: default_log_file(),
            rotation: LogRotation::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_store_path() -> PathBuf {
    PathBuf::from("store")
}
fn default_server_url() -> String {
    "http://127.0.0.1:18787".into()
}
fn default_model() -> String {
    "phi-3.5-mini-instruct".into()
}
fn default_launch_command() -> String {
    "litert-lm".into()
}
fn default_server_port() -> u16 {
    18787
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_new_tokens() -> u32 {
    300
}
fn default_temperature() -> f32 {
    0.7
}
fn default_stop_sequences() -> Vec<String> {
    vec!["<|end|>".into(), "<|user|>".into()]
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_dedup_capacity() -> usize {
    1000
}
fn default_dedup_retain() -> usize {
    500
}
fn default_max_workers() -> usize {
    8
}
fn default_typing_delay_ms() -> u64 {
    10
}
fn default_fragment_buffer() -> usize {
    32
}
fn default_context_window() -> usize {
    100
}
fn default_recent_window() -> usize {
    5
}
fn default_log_filter() -> String {
    "info,reqwest=warn,hyper=warn".into()
}
fn default_log_file() -> String {
    "tutorloop.log".into()
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

/// Default tutor persona. The surrounding newlines are part of the prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are Emma, a friendly AI English conversation partner. Provide explicit corrections to help users improve their spoken English.

===EXPLICIT CORRECTION GUIDELINES===
1. **Error Identification**
   - Clearly highlight mistakes using this format:
   "Nice try! We say [CORRECT PHRASE] instead of [ORIGINAL PHRASE] because [BRIEF REASON]. [CONTINUE CONVERSATION]"

2. **Correction Focus**
   - Address 1-2 errors per response
   - Priority order:
     1. Errors causing confusion
     2. Verb tense/articles/prepositions
     3. Naturalization (contractions/reductions)

3. **Explanation Style**
   - Use simple, non-technical terms
   - Give concrete examples
   - Always include a reason

===CONVERSATION RULES===
1. **Error Response Template**:
   a. Acknowledge content
   b. Correct error explicitly
   c. Continue conversation naturally

   Example:
   User: "I eat breakfast already"
   Emma: "I understand! Just a note: We say 'I ate breakfast already' instead of 'I eat breakfast already' because it happened in the past. What did you have?"

2. **Error Types to Explicitly Correct**:
   - Verb tense errors
   - Missing articles (a/an/the)
   - Subject-verb agreement
   - Pronoun misuse
   - Preposition errors

3. **Do NOT Correct**:
   - Accent or pronunciation
   - Minor slips that don't affect meaning
   - Creative word choices

===TONE GUIDELINES===
- Always start with positive reinforcement
- Keep explanations under 10 words
- Maintain natural flow after correction

===EXAMPLE DIALOGUES===
1. **Verb Tense Error**
User: "Yesterday I go to park"
Emma: "Good effort! We say 'I went to the park' instead of 'I go to park' because it's past tense. What did you do there?"

2. **Article Error**
User: "She is doctor"
Emma: "Almost there! We say 'She is a doctor' with an 'a' before jobs. Where does she work?"

3. **Double Correction**
User: "Me want to going store"
Emma: "You're getting there! We say:
- 'I want' instead of 'Me want'
- 'to go to the store' instead of 'to going store' What do you need to buy?"
"#;

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poller.dedup_retain > self.poller.dedup_capacity {
            anyhow::bail!(
                "poller.dedup_retain ({}) must not exceed poller.dedup_capacity ({})",
                self.poller.dedup_retain,
                self.poller.dedup_capacity
            );
        }
        if self.poller.max_workers == 0 {
            anyhow::bail!("poller.max_workers must be at least 1");
        }
        if self.worker.fragment_buffer == 0 {
            anyhow::bail!("worker.fragment_buffer must be at least 1");
        }
        if self.logging.file_name.trim().is_empty() {
            anyhow::bail!("logging.file_name must not be empty");
        }
        if self.engine.stop_sequences.iter().any(|s| s.is_empty()) {
            anyhow::bail!("engine.stop_sequences must not contain empty strings");
        }
        Ok(())
    }

    /// Resolve the store directory against the data directory.
    pub fn store_dir(&self, data_dir: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            data_dir.join(&self.store.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.engine.max_new_tokens, 300);
        assert!((settings.engine.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(settings.engine.stop_sequences, vec!["<|end|>", "<|user|>"]);
        assert_eq!(settings.poller.interval_ms, 1000);
        assert_eq!(settings.poller.dedup_capacity, 1000);
        assert_eq!(settings.poller.dedup_retain, 500);
        assert_eq!(settings.worker.typing_delay_ms, 10);
        assert_eq!(settings.prompt.context_window, 100);
        assert_eq!(settings.prompt.recent_window, 5);
        assert!(settings.prompt.system_prompt.starts_with("\nYou are Emma"));
        assert!(settings.prompt.system_prompt.ends_with("What do you need to buy?\"\n"));
        assert_eq!(settings.logging.rotation, LogRotation::Daily);
        settings.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.engine.model = "phi-4-mini".into();
        settings.poller.max_workers = 2;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.engine.model, "phi-4-mini");
        assert_eq!(loaded.poller.max_workers, 2);
    }

    #[test]
    fn test_logging_rotation_wire_format() {
        let settings: Settings =
            serde_json::from_str(r#"{"logging":{"rotation":"never"}}"#).unwrap();
        assert_eq!(settings.logging.rotation, LogRotation::Never);
        assert_eq!(settings.logging.file_name, "tutorloop.log");
    }

    #[test]
    fn test_validate_rejects_bad_dedup_bounds() {
        let mut settings = Settings::default();
        settings.poller.dedup_retain = 2000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_store_dir_resolution() {
        let settings = Settings::default();
        assert_eq!(
            settings.store_dir(Path::new("/data")),
            PathBuf::from("/data/store")
        );
    }
}
