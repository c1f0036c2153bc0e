//! 会话持久化
//!
//! 以键（`session:current`、`memory:<id>`）存取不透明的 JSON 文本。
//! 提供内存实现（测试、无状态目录时）与文件实现（每个键一个 JSON 文件，先写临时文件再 rename）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 当前会话的键
pub const SESSION_KEY: &str = "session:current";

/// 会话记忆的键
pub fn memory_key(session_id: Uuid) -> String {
    format!("memory:{}", session_id)
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// 键值持久化：load / save / remove
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn save(&self, key: &str, blob: &str) -> Result<(), PersistenceError>;

    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// 进程内持久化
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, blob: &str) -> Result<(), PersistenceError> {
        self.entries.lock().await.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// 文件持久化：`<dir>/<key>.json`，键中的 `:` 换成 `_`
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'));
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key.replace(':', "_"))))
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, blob: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, blob).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 序列化后保存
pub async fn save_json<T: serde::Serialize + ?Sized>(
    store: &dyn Persistence,
    key: &str,
    value: &T,
) -> Result<(), PersistenceError> {
    let blob = serde_json::to_string(value)?;
    store.save(key, &blob).await
}

/// 读取并反序列化；键不存在返回 None
pub async fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn Persistence,
    key: &str,
) -> Result<Option<T>, PersistenceError> {
    match store.load(key).await? {
        Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
        None => Ok(None),
    }
}
