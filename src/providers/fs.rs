use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::{fs, io};

use super::{Admission, HistoryStore, InstanceMetadata, InstanceRecord, ProviderError, StoredEvent};
use crate::Event;

const META_FILE: &str = "meta.json";
const HISTORY_FILE: &str = "history.jsonl";

/// Filesystem-backed history store: one directory per instance holding
/// `meta.json` and an append-only `history.jsonl` of [`StoredEvent`] lines.
///
/// A single store value must own the directory; appends are serialized
/// through an in-process lock.
pub struct FsHistoryStore {
    root: PathBuf,
    // Admission state per instance, rebuilt from disk on first append
    admissions: Mutex<HashMap<String, Admission>>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`. If `reset_on_create` is true, delete
    /// any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; failures surface on first use
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            admissions: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn inst_root(&self, operation: &str, instance: &str) -> Result<PathBuf, ProviderError> {
        let safe = !instance.is_empty()
            && instance != "."
            && instance != ".."
            && !instance.contains(['/', '\\']);
        if !safe {
            return Err(ProviderError::corrupt(
                operation,
                format!("instance id is not usable as a directory name: {instance:?}"),
            ));
        }
        Ok(self.root.join(instance))
    }

    async fn read_metadata(&self, operation: &str, dir: &Path, instance: &str) -> Result<InstanceMetadata, ProviderError> {
        let data = match fs::read_to_string(dir.join(META_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProviderError::not_found(operation, instance));
            }
            Err(e) => return Err(ProviderError::io(operation, e)),
        };
        serde_json::from_str(&data).map_err(|e| ProviderError::corrupt(operation, format!("{instance}/{META_FILE}: {e}")))
    }

    async fn read_events(&self, operation: &str, dir: &Path, instance: &str) -> Result<Vec<StoredEvent>, ProviderError> {
        let data = match fs::read_to_string(dir.join(HISTORY_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ProviderError::io(operation, e)),
        };
        let mut out = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredEvent>(line) {
                Ok(stored) => out.push(stored),
                // A torn final line from a crash mid-append is skipped
                Err(e) => tracing::warn!(
                    target: "duraflow::providers",
                    instance,
                    line = line_no + 1,
                    error = %e,
                    "skipping undecodable history line"
                ),
            }
        }
        Ok(out)
    }

    /// Cut a torn final line left by a crash mid-append, so the next append
    /// starts on a fresh line.
    async fn truncate_torn_tail(&self, operation: &str, dir: &Path, instance: &str) -> Result<(), ProviderError> {
        let path = dir.join(HISTORY_FILE);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ProviderError::io(operation, e)),
        };
        if data.last().is_none_or(|b| *b == b'\n') {
            return Ok(());
        }
        let keep = data.iter().rposition(|b| *b == b'\n').map_or(0, |pos| pos + 1);
        tracing::warn!(
            target: "duraflow::providers",
            instance,
            dropped_bytes = data.len() - keep,
            "truncating torn history tail"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| ProviderError::io(operation, e))?;
        file.set_len(keep as u64).await.map_err(|e| ProviderError::io(operation, e))?;
        file.sync_data().await.map_err(|e| ProviderError::io(operation, e))
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, metadata: InstanceMetadata) -> Result<(), ProviderError> {
        const OP: &str = "create_instance";
        let dir = self.inst_root(OP, &metadata.instance_id)?;
        let _guard = self.admissions.lock().await;
        if fs::try_exists(dir.join(META_FILE)).await.map_err(|e| ProviderError::io(OP, e))? {
            return Err(ProviderError::already_exists(OP, &metadata.instance_id));
        }
        fs::create_dir_all(&dir).await.map_err(|e| ProviderError::io(OP, e))?;
        let json = serde_json::to_string_pretty(&metadata).map_err(|e| ProviderError::corrupt(OP, e.to_string()))?;
        fs::write(dir.join(META_FILE), json)
            .await
            .map_err(|e| ProviderError::io(OP, e))?;
        Ok(())
    }

    async fn load(&self, instance: &str) -> Result<InstanceRecord, ProviderError> {
        const OP: &str = "load";
        let dir = self.inst_root(OP, instance)?;
        let metadata = self.read_metadata(OP, &dir, instance).await?;
        let events = self.read_events(OP, &dir, instance).await?;
        Ok(InstanceRecord { metadata, events })
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<usize, ProviderError> {
        const OP: &str = "append";
        let dir = self.inst_root(OP, instance)?;
        let mut admissions = self.admissions.lock().await;
        if !admissions.contains_key(instance) {
            // Existence check doubles as the NotFound signal
            self.read_metadata(OP, &dir, instance).await?;
            self.truncate_torn_tail(OP, &dir, instance).await?;
            let existing = self.read_events(OP, &dir, instance).await?;
            let admission = Admission::from_history(existing.iter().map(|stored| &stored.event));
            admissions.insert(instance.to_string(), admission);
        }
        let Some(admission) = admissions.get_mut(instance) else {
            return Err(ProviderError::not_found(OP, instance));
        };

        let recorded_at_ms = crate::wall_clock_ms();
        let mut buf = String::new();
        let mut written = 0;
        for event in new_events {
            if !admission.admit(&event) {
                tracing::debug!(target: "duraflow::providers", instance, kind = event.kind(), "dropping duplicate or late event");
                continue;
            }
            let line = serde_json::to_string(&StoredEvent { recorded_at_ms, event })
                .map_err(|e| ProviderError::corrupt(OP, e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
            written += 1;
        }
        if written == 0 {
            return Ok(0);
        }

        let write = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(HISTORY_FILE))
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.sync_data().await
        };
        if let Err(e) = write.await {
            // The admission state already counted these events; rebuild it from disk next time
            admissions.remove(instance);
            return Err(ProviderError::io(OP, e));
        }
        Ok(written)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        const OP: &str = "list_instances";
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::io(OP, e)),
        };
        while let Some(entry) = rd.next_entry().await.map_err(|e| ProviderError::io(OP, e))? {
            let has_meta = fs::try_exists(entry.path().join(META_FILE)).await.unwrap_or(false);
            if has_meta && let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        const OP: &str = "remove_instance";
        let dir = self.inst_root(OP, instance)?;
        let mut admissions = self.admissions.lock().await;
        admissions.remove(instance);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ProviderError::not_found(OP, instance)),
            Err(e) => Err(ProviderError::io(OP, e)),
        }
    }
}
