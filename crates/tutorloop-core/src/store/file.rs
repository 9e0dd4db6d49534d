use super::{sort_oldest_first, Datastore};
use crate::error::{StoreError, StoreResult};
use crate::record::{ChatHistoryRecord, HistoryMessage, PromptRecord, ResponseRecord};
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

/// Directory-backed datastore: one JSON document per record.
///
/// ```text
/// <base>/prompts/<id>.json
/// <base>/responses/<id>.json
/// <base>/histories/<user_id>.json
/// ```
///
/// Producers may drop prompt documents straight into `prompts/` under any
/// `*.json` name; the `id` inside the document is authoritative. Documents
/// that cannot be parsed are moved to `<base>/rejected/`. Writes use
/// tmp+rename so readers never observe a half-written document.
pub struct FileStore {
    prompts: PathBuf,
    responses: PathBuf,
    histories: PathBuf,
    rejected: PathBuf,
    /// Prompt id -> document path, learned while scanning `prompts/`.
    prompt_paths: DashMap<String, PathBuf>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileStore {
    pub async fn open(base: impl AsRef<Path>) -> StoreResult<Self> {
        let base = base.as_ref().to_path_buf();
        let prompts = base.join("prompts");
        let responses = base.join("responses");
        let histories = base.join("histories");
        let rejected = base.join("rejected");

        fs::create_dir_all(&prompts).await?;
        fs::create_dir_all(&responses).await?;
        fs::create_dir_all(&histories).await?;
        fs::create_dir_all(&rejected).await?;

        tracing::debug!(path = %base.display(), "File store opened");

        Ok(Self {
            prompts,
            responses,
            histories,
            rejected,
            prompt_paths: DashMap::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn prompt_path(&self, id: &str) -> PathBuf {
        self.prompts.join(file_name(id))
    }

    /// Find the document holding prompt `id`: a path seen while scanning,
    /// then the conventional `<id>.json`, then a full scan of `prompts/`.
    async fn locate_prompt(&self, id: &str) -> StoreResult<Option<PathBuf>> {
        let known = self.prompt_paths.get(id).map(|p| p.value().clone());
        if let Some(path) = known {
            if fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
            self.prompt_paths.remove(id);
        }

        let conventional = self.prompt_path(id);
        if fs::try_exists(&conventional).await? {
            return Ok(Some(conventional));
        }

        let mut dir = fs::read_dir(&self.prompts).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !is_document(&path) {
                continue;
            }
            if let Ok(Some(prompt)) = read_doc::<PromptRecord>(&path).await {
                if prompt.id == id {
                    self.prompt_paths.insert(prompt.id, path.clone());
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    /// Move an unparseable prompt document out of the scan path.
    async fn reject_document(&self, path: &Path, filename: &str) {
        let target = self.rejected.join(filename);
        match fs::rename(path, &target).await {
            Ok(()) => tracing::warn!(
                file = %filename,
                moved_to = %target.display(),
                "Moved unreadable prompt document aside"
            ),
            Err(e) => tracing::warn!(file = %filename, error = %e, "Could not move unreadable prompt"),
        }
    }

    fn response_path(&self, id: &str) -> PathBuf {
        self.responses.join(file_name(id))
    }

    fn history_path(&self, user_id: &str) -> PathBuf {
        self.histories.join(file_name(user_id))
    }

    async fn update_prompt<F, R>(&self, id: &str, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut PromptRecord) -> R + Send,
        R: Send,
    {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        let path = self
            .locate_prompt(id)
            .await?
            .ok_or_else(|| StoreError::PromptNotFound(id.to_string()))?;
        let mut prompt: PromptRecord = read_doc(&path)
            .await?
            .ok_or_else(|| StoreError::PromptNotFound(id.to_string()))?;
        let result = f(&mut prompt);
        write_doc(&path, &prompt).await?;
        Ok(result)
    }

    async fn update_response<F>(&self, id: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ResponseRecord) -> StoreResult<()> + Send,
    {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        let path = self.response_path(id);
        let mut response: ResponseRecord = read_doc(&path)
            .await?
            .ok_or_else(|| StoreError::ResponseNotFound(id.to_string()))?;
        f(&mut response)?;
        write_doc(&path, &response).await
    }
}

#[async_trait::async_trait]
impl Datastore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn insert_prompt(&self, prompt: &PromptRecord) -> StoreResult<()> {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        if self.locate_prompt(&prompt.id).await?.is_some() {
            return Err(StoreError::Duplicate(prompt.id.clone()));
        }
        let path = self.prompt_path(&prompt.id);
        write_doc(&path, prompt).await?;
        self.prompt_paths.insert(prompt.id.clone(), path);
        Ok(())
    }

    async fn get_prompt(&self, id: &str) -> StoreResult<Option<PromptRecord>> {
        self.check_open()?;
        match self.locate_prompt(id).await? {
            Some(path) => read_doc(&path).await,
            None => Ok(None),
        }
    }

    async fn pending_prompts(&self) -> StoreResult<Vec<PromptRecord>> {
        self.check_open()?;
        let mut pending = Vec::new();
        let mut dir = fs::read_dir(&self.prompts).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !is_document(&path) {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();

            match read_doc::<PromptRecord>(&path).await {
                Ok(Some(prompt)) => {
                    self.prompt_paths.insert(prompt.id.clone(), path);
                    if prompt.is_pending() {
                        pending.push(prompt);
                    }
                }
                Ok(None) => {}
                Err(StoreError::Serde(e)) => {
                    tracing::warn!(file = %filename, error = %e, "Malformed prompt document");
                    self.reject_document(&path, &filename).await;
                }
                Err(e) => {
                    tracing::warn!(file = %filename, error = %e, "Skipping unreadable prompt");
                }
            }
        }

        sort_oldest_first(&mut pending);
        Ok(pending)
    }

    async fn claim_prompt(&self, id: &str, response_id: &str) -> StoreResult<bool> {
        self.update_prompt(id, |p| p.claim(response_id, Utc::now()))
            .await
    }

    async fn complete_prompt(&self, id: &str, response_id: &str) -> StoreResult<()> {
        self.update_prompt(id, |p| p.complete(response_id, Utc::now()))
            .await
    }

    async fn fail_prompt(&self, id: &str, error: &str) -> StoreResult<()> {
        self.update_prompt(id, |p| p.fail(error)).await
    }

    async fn create_response(&self, id: &str, user_id: &str) -> StoreResult<()> {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        let path = self.response_path(id);
        if fs::try_exists(&path).await? {
            return Err(StoreError::Duplicate(id.to_string()));
        }
        write_doc(&path, &ResponseRecord::new(id, user_id)).await
    }

    async fn get_response(&self, id: &str) -> StoreResult<Option<ResponseRecord>> {
        self.check_open()?;
        read_doc(&self.response_path(id)).await
    }

    async fn append_token(&self, id: &str, fragment: &str) -> StoreResult<()> {
        self.update_response(id, |r| r.push_token(fragment, Utc::now()))
            .await
    }

    async fn finish_response(&self, id: &str, full_response: &str) -> StoreResult<()> {
        self.update_response(id, |r| r.finish(full_response, Utc::now()))
            .await
    }

    async fn fail_response(&self, id: &str, error: &str) -> StoreResult<()> {
        self.update_response(id, |r| r.fail(error, Utc::now()))
            .await
    }

    async fn get_history(&self, user_id: &str) -> StoreResult<Option<ChatHistoryRecord>> {
        self.check_open()?;
        read_doc(&self.history_path(user_id)).await
    }

    async fn load_history(&self, user_id: &str) -> StoreResult<ChatHistoryRecord> {
        self.check_open()?;
        let path = self.history_path(user_id);
        if let Some(record) = read_doc(&path).await? {
            return Ok(record);
        }

        let _guard = self.write_lock.lock().await;
        // Another task may have created it while we waited.
        if let Some(record) = read_doc(&path).await? {
            return Ok(record);
        }
        let record = ChatHistoryRecord::new(user_id);
        write_doc(&path, &record).await?;
        Ok(record)
    }

    async fn append_message(&self, user_id: &str, message: HistoryMessage) -> StoreResult<()> {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        let path = self.history_path(user_id);
        let mut record = read_doc(&path)
            .await?
            .unwrap_or_else(|| ChatHistoryRecord::new(user_id));
        record.push(message, Utc::now());
        write_doc(&path, &record).await
    }

    async fn clear_history(&self, user_id: &str) -> StoreResult<bool> {
        self.check_open()?;
        let _guard = self.write_lock.lock().await;
        let path = self.history_path(user_id);
        match read_doc::<ChatHistoryRecord>(&path).await? {
            Some(mut record) => {
                record.messages.clear();
                record.updated_at = Utc::now();
                write_doc(&path, &record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> StoreResult<()> {
        // Wait for any in-progress write to land before refusing new ones.
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::Release);
        tracing::debug!("File store closed");
        Ok(())
    }
}

/// A prompt document: `*.json`, not a dotfile (tmp files start with `.`).
fn is_document(path: &Path) -> bool {
    match path.file_name().and_then(|f| f.to_str()) {
        Some(name) => !name.starts_with('.') && name.ends_with(".json"),
        None => false,
    }
}

/// Map an arbitrary key onto a safe file name.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            name.push(b as char);
        } else {
            name.push_str(&format!("%{:02X}", b));
        }
    }
    name.push_str(".json");
    name
}

async fn read_doc<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_doc<T: Serialize + Sync>(path: &Path, value: &T) -> StoreResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", filename));
    fs::write(&tmp, &content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
