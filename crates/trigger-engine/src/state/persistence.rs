//! 状态持久化后端
//!
//! 内存状态始终是权威数据，后端只负责保存与恢复。

use crate::error::{Result, TriggerError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// 持久化后端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_all(&self) -> Result<Map<String, Value>>;
    async fn save_one(&self, key: &str, value: &Value) -> Result<()>;
    async fn delete_one(&self, key: &str) -> Result<()>;
    async fn clear_all(&self) -> Result<()>;
}

/// 内存持久化（默认后端）
#[derive(Default)]
pub struct MemoryPersistence {
    entries: RwLock<Map<String, Value>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有数据初始化
    pub fn with_entries(entries: Map<String, Value>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_all(&self) -> Result<Map<String, Value>> {
        Ok(self.entries.read().clone())
    }

    async fn save_one(&self, key: &str, value: &Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete_one(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// 文件持久化：整个状态保存为一个 JSON 文档
///
/// 写入先落到临时文件再重命名，避免留下半写的文档。
pub struct FilePersistence {
    path: PathBuf,
    /// 文档缓存，首次访问时从磁盘读取
    document: Mutex<Option<Map<String, Value>>>,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => Ok(map),
                other => Err(TriggerError::Persistence(format!(
                    "状态文件 {} 不是 JSON 对象: {}",
                    self.path.display(),
                    crate::expression::type_name(&other)
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(TriggerError::Persistence(format!(
                "读取状态文件 {} 失败: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TriggerError::Persistence(format!("创建目录失败: {}", e)))?;
        }
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| TriggerError::Persistence(format!("写入状态文件失败: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| TriggerError::Persistence(format!("替换状态文件失败: {}", e)))?;

        debug!(path = %self.path.display(), entries = document.len(), "状态文件已写入");
        Ok(())
    }

    /// 在文档上执行修改并写回磁盘
    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_document().await?);
        }
        let document = guard.get_or_insert_with(Map::new);
        mutate(document);
        self.write_document(document).await
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load_all(&self) -> Result<Map<String, Value>> {
        let mut guard = self.document.lock().await;
        let document = self.read_document().await?;
        *guard = Some(document.clone());
        Ok(document)
    }

    async fn save_one(&self, key: &str, value: &Value) -> Result<()> {
        self.update(|doc| {
            doc.insert(key.to_string(), value.clone());
        })
        .await
    }

    async fn delete_one(&self, key: &str) -> Result<()> {
        self.update(|doc| {
            doc.remove(key);
        })
        .await
    }

    async fn clear_all(&self) -> Result<()> {
        self.update(|doc| doc.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_persistence() {
        let backend = MemoryPersistence::new();
        backend.save_one("a", &json!(1)).await.unwrap();
        backend.save_one("b", &json!({"x": true})).await.unwrap();
        assert_eq!(backend.len(), 2);

        backend.delete_one("a").await.unwrap();
        let all = backend.load_all().await.unwrap();
        assert_eq!(all.get("b"), Some(&json!({"x": true})));
        assert!(all.get("a").is_none());

        backend.clear_all().await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_file_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("trigger-state.json");

        let backend = FilePersistence::new(&path);
        assert!(backend.load_all().await.unwrap().is_empty());

        backend.save_one("counter", &json!(3)).await.unwrap();
        backend.save_one("user", &json!({"name": "alice"})).await.unwrap();
        backend.delete_one("counter").await.unwrap();

        // 新实例从磁盘读取
        let reopened = FilePersistence::new(&path);
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["user"]["name"], "alice");
    }

    #[tokio::test]
    async fn test_file_persistence_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        let err = FilePersistence::new(&path).load_all().await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
    }
}
