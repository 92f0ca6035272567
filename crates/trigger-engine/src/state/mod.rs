//! 状态存储
//!
//! 带过期策略与原子自增的键值存储。内存数据与待执行的过期计时由同一把同步锁保护，
//! 该锁从不跨越 await。写操作另外经过一把异步写锁串行化，
//! 保证持久化后端收到的写入顺序与内存中的修改顺序一致。

mod persistence;

pub use persistence::{FilePersistence, MemoryPersistence, Persistence};

#[cfg(test)]
pub use persistence::MockPersistence;

use crate::error::{Result, TriggerError};
use crate::expression::{number_value, safe_number};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use trigger_shared::config::StateConfig;
use trigger_shared::observability::metrics::record_state_operation;

/// 状态存储句柄（克隆开销很小，共享同一份数据）
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StateInner>,
}

struct StateInner {
    entries: Mutex<Entries>,
    /// 写操作（含持久化）串行执行
    write_order: tokio::sync::Mutex<()>,
    persistence: Arc<dyn Persistence>,
    config: StateConfig,
}

#[derive(Default)]
struct Entries {
    values: Map<String, Value>,
    /// 仅记录存在待执行过期计时的键 -> 计时编号
    expiries: HashMap<String, u64>,
    next_timer: u64,
}

impl Entries {
    /// 写入值并处理过期计时：有 ttl 时重新计时，否则取消旧计时
    fn write(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Option<(u64, Duration)> {
        self.values.insert(key.to_string(), value);
        match ttl {
            Some(ttl) => {
                self.next_timer += 1;
                self.expiries.insert(key.to_string(), self.next_timer);
                Some((self.next_timer, ttl))
            }
            None => {
                self.expiries.remove(key);
                None
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        self.values.remove(key).is_some()
    }
}

impl StateStore {
    /// 使用内存持久化创建
    pub fn new() -> Self {
        Self::with_persistence(Arc::new(MemoryPersistence::new()), StateConfig::default())
    }

    pub fn with_persistence(persistence: Arc<dyn Persistence>, config: StateConfig) -> Self {
        Self {
            inner: Arc::new(StateInner {
                entries: Mutex::new(Entries::default()),
                write_order: tokio::sync::Mutex::new(()),
                persistence,
                config,
            }),
        }
    }

    /// 按配置选择持久化后端：配置了 `file_path` 时使用文件，否则使用内存
    pub fn from_config(config: StateConfig) -> Self {
        let persistence: Arc<dyn Persistence> = match &config.file_path {
            Some(path) => Arc::new(FilePersistence::new(path)),
            None => Arc::new(MemoryPersistence::new()),
        };
        Self::with_persistence(persistence, config)
    }

    /// 从持久化后端恢复状态，返回恢复的条目数
    pub async fn load(&self) -> Result<usize> {
        let _order = self.inner.write_order.lock().await;
        let entries = self.inner.persistence.load_all().await.inspect_err(|e| {
            warn!(error = %e, "状态恢复失败");
        })?;
        let count = entries.len();
        self.inner.entries.lock().values.extend(entries);

        info!(entries = count, "状态已从持久化后端恢复");
        Ok(count)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        record_state_operation("get");
        self.inner.entries.lock().values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().values.contains_key(key)
    }

    /// 全量快照（副本）
    pub fn get_all(&self) -> Map<String, Value> {
        self.inner.entries.lock().values.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().values.is_empty()
    }

    /// 当前存在待执行过期计时的键数量
    pub fn pending_expiries(&self) -> usize {
        self.inner.entries.lock().expiries.len()
    }

    /// 写入并持久化；匹配过期策略时重新计时
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let ttl = self.lifecycle_ttl(key);
        self.write(key, value, ttl).await
    }

    /// 写入并在指定时长后自动删除
    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.write(key, value, Some(ttl)).await
    }

    async fn write(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        record_state_operation("set");
        let _order = self.inner.write_order.lock().await;
        let timer = self.inner.entries.lock().write(key, value.clone(), ttl);
        self.schedule(key, timer);
        self.persist(key, &value).await
    }

    /// 原子自增，返回新值；不存在或非数值时从 0 开始
    pub async fn increment(&self, key: &str, amount: f64) -> Result<Value> {
        record_state_operation("increment");
        let ttl = self.lifecycle_ttl(key);
        let _order = self.inner.write_order.lock().await;
        let (updated, timer) = {
            let mut entries = self.inner.entries.lock();
            let current = safe_number(&entries.values.get(key).cloned()).unwrap_or(0.0);
            let updated = number_value(current + amount);
            let timer = entries.write(key, updated.clone(), ttl);
            (updated, timer)
        };
        self.schedule(key, timer);
        self.persist(key, &updated).await?;
        Ok(updated)
    }

    pub async fn decrement(&self, key: &str, amount: f64) -> Result<Value> {
        self.increment(key, -amount).await
    }

    /// 删除键，返回是否存在
    pub async fn delete(&self, key: &str) -> Result<bool> {
        record_state_operation("delete");
        let _order = self.inner.write_order.lock().await;
        let existed = self.inner.entries.lock().remove(key);
        self.inner.persistence.delete_one(key).await.inspect_err(|e| {
            warn!(key = %key, error = %e, "状态删除持久化失败");
        })?;
        Ok(existed)
    }

    pub async fn clear(&self) -> Result<()> {
        record_state_operation("clear");
        let _order = self.inner.write_order.lock().await;
        {
            let mut entries = self.inner.entries.lock();
            entries.values.clear();
            entries.expiries.clear();
        }
        self.inner.persistence.clear_all().await.inspect_err(|e| {
            warn!(error = %e, "状态清空持久化失败");
        })
    }

    /// 嵌套路径读写句柄
    pub fn handle(&self) -> StateHandle<'_> {
        StateHandle { store: self }
    }

    async fn persist(&self, key: &str, value: &Value) -> Result<()> {
        self.inner
            .persistence
            .save_one(key, value)
            .await
            .inspect_err(|e| warn!(key = %key, error = %e, "状态持久化失败"))
    }

    fn lifecycle_ttl(&self, key: &str) -> Option<Duration> {
        self.inner.config.ttl_for(key).map(Duration::from_millis)
    }

    fn schedule(&self, key: &str, timer: Option<(u64, Duration)>) {
        let Some((id, ttl)) = timer else {
            return;
        };
        let weak: Weak<StateInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let _order = inner.write_order.lock().await;
            {
                // 计时编号不一致说明期间有新的写入或删除
                let mut entries = inner.entries.lock();
                if entries.expiries.get(&key) != Some(&id) {
                    return;
                }
                entries.remove(&key);
            }
            debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "状态已过期");
            record_state_operation("expire");

            if let Err(e) = inner.persistence.delete_one(&key).await {
                warn!(key = %key, error = %e, "过期状态删除持久化失败");
            }
        });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("entries", &self.len())
            .finish()
    }
}

/// 嵌套路径读写，路径以 `.` 分隔，首段为状态键
pub struct StateHandle<'a> {
    store: &'a StateStore,
}

impl StateHandle<'_> {
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut current = self.store.get(root)?;
        for part in parts {
            current = match current {
                Value::Object(mut map) => map.remove(part)?,
                Value::Array(mut items) => {
                    let index: usize = part.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// 写入嵌套路径，中间缺失或非对象的节点会被替换为对象，并持久化根键
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((root, rest)) = segments.split_first().filter(|(root, _)| !root.is_empty())
        else {
            return Err(TriggerError::Configuration(format!("无效的状态路径: '{}'", path)));
        };

        if rest.is_empty() {
            return self.store.set(root, value).await;
        }

        record_state_operation("set");
        let ttl = self.store.lifecycle_ttl(root);
        let _order = self.store.inner.write_order.lock().await;
        let (updated, timer) = {
            let mut entries = self.store.inner.entries.lock();
            let mut root_value = entries
                .values
                .get(*root)
                .cloned()
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::Object(Map::new()));
            set_nested(&mut root_value, rest, value);
            let timer = entries.write(root, root_value.clone(), ttl);
            (root_value, timer)
        };
        self.store.schedule(root, timer);
        self.store.persist(root, &updated).await
    }
}

/// 沿路径写入，非对象的中间节点替换为对象
fn set_nested(node: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *node = value;
        return;
    };
    let mut node = node;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trigger_shared::config::LifecycleEntry;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = StateStore::new();
        store.set("user", json!({"name": "alice"})).await.unwrap();

        assert_eq!(store.get("user"), Some(json!({"name": "alice"})));
        assert!(store.delete("user").await.unwrap());
        assert!(!store.delete("user").await.unwrap());
        assert_eq!(store.get("user"), None);
    }

    #[tokio::test]
    async fn test_increment_from_missing_and_non_numeric() {
        let store = StateStore::new();
        assert_eq!(store.increment("hits", 1.0).await.unwrap(), json!(1));
        assert_eq!(store.increment("hits", 2.5).await.unwrap(), json!(3.5));
        assert_eq!(store.decrement("hits", 0.5).await.unwrap(), json!(3));

        store.set("label", json!("abc")).await.unwrap();
        assert_eq!(store.increment("label", 1.0).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = StateStore::new();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("counter", 1.0).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("counter"), Some(json!(50)));
    }

    #[tokio::test]
    async fn test_get_all_is_a_snapshot() {
        let store = StateStore::new();
        store.set("a", json!(1)).await.unwrap();

        let snapshot = store.get_all();
        store.set("a", json!(2)).await.unwrap();

        assert_eq!(snapshot["a"], json!(1));
        assert_eq!(store.get("a"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_clear_and_load() {
        let backend = Arc::new(MemoryPersistence::with_entries(
            json!({"x": 1, "y": [1, 2]}).as_object().cloned().unwrap(),
        ));
        let store = StateStore::with_persistence(backend.clone(), StateConfig::default());

        assert_eq!(store.load().await.unwrap(), 2);
        assert_eq!(store.get("y"), Some(json!([1, 2])));

        store.clear().await.unwrap();
        assert!(store.is_empty());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_nested_handle() {
        let store = StateStore::new();
        store
            .handle()
            .set("profile.address.city", json!("Paris"))
            .await
            .unwrap();
        store.handle().set("profile.age", json!(30)).await.unwrap();

        assert_eq!(store.handle().get("profile.address.city"), Some(json!("Paris")));
        assert_eq!(
            store.get("profile"),
            Some(json!({"address": {"city": "Paris"}, "age": 30}))
        );
        assert_eq!(store.handle().get("profile.missing.deeper"), None);

        // 非对象的中间节点被替换
        store.handle().set("profile.age.years", json!(31)).await.unwrap();
        assert_eq!(store.handle().get("profile.age.years"), Some(json!(31)));

        assert!(store.handle().set("", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_nested_handle_persists_root_key() {
        let backend = Arc::new(MemoryPersistence::new());
        let store = StateStore::with_persistence(backend.clone(), StateConfig::default());

        store.handle().set("session.user.id", json!(7)).await.unwrap();

        let persisted = backend.load_all().await.unwrap();
        assert_eq!(persisted["session"], json!({"user": {"id": 7}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = StateStore::new();
        store
            .set_with_ttl("otp", json!("1234"), Duration::from_millis(500))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get("otp"), Some(json!("1234")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get("otp"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_rearmed_by_newer_write() {
        let config = StateConfig {
            lifecycle: vec![LifecycleEntry::new("session:*", 1_000)],
            file_path: None,
        };
        let store = StateStore::with_persistence(Arc::new(MemoryPersistence::new()), config);

        store.set("session:42", json!(1)).await.unwrap();
        store.set("profile", json!(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        store.set("session:42", json!(2)).await.unwrap();

        // 第一次计时已失效
        tokio::time::sleep(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get("session:42"), Some(json!(2)));

        tokio::time::sleep(Duration::from_millis(700)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get("session:42"), None);
        assert_eq!(store.get("profile"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_write_cancels_pending_expiry() {
        let store = StateStore::new();
        store
            .set_with_ttl("otp", json!("1234"), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(store.pending_expiries(), 1);

        store.set("otp", json!("5678")).await.unwrap();
        assert_eq!(store.pending_expiries(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get("otp"), Some(json!("5678")));
    }

    #[tokio::test]
    async fn test_expiry_bookkeeping_stays_bounded() {
        let config = StateConfig {
            lifecycle: vec![LifecycleEntry::new("session:*", 60_000)],
            file_path: None,
        };
        let store = StateStore::with_persistence(Arc::new(MemoryPersistence::new()), config);

        for i in 0..1_000 {
            store.set(&format!("k{i}"), json!(i)).await.unwrap();
            store.delete(&format!("k{i}")).await.unwrap();
            store.delete(&format!("never{i}")).await.unwrap();
            store.set(&format!("session:{i}"), json!(i)).await.unwrap();
        }
        assert_eq!(store.len(), 1_000);
        assert_eq!(store.pending_expiries(), 1_000);

        for i in 0..500 {
            store.delete(&format!("session:{i}")).await.unwrap();
        }
        assert_eq!(store.pending_expiries(), 500);

        store.clear().await.unwrap();
        assert_eq!(store.pending_expiries(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backend_matches_memory_after_concurrent_writes() {
        let backend = Arc::new(MemoryPersistence::new());
        let store = StateStore::with_persistence(backend.clone(), StateConfig::default());

        let mut handles = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.increment("counter", 1.0).await.unwrap();
                } else {
                    store.handle().set("profile.last", json!(i)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let persisted = backend.load_all().await.unwrap();
        assert_eq!(store.get("counter"), Some(json!(100)));
        assert_eq!(persisted.get("counter"), store.get("counter").as_ref());
        assert_eq!(persisted.get("profile"), store.get("profile").as_ref());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported() {
        let mut mock = MockPersistence::new();
        mock.expect_save_one()
            .returning(|_, _| Err(TriggerError::Persistence("disk full".to_string())));

        let store = StateStore::with_persistence(Arc::new(mock), StateConfig::default());
        let err = store.set("k", json!(1)).await.unwrap_err();

        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        // 内存状态仍然生效
        assert_eq!(store.get("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_load_uses_backend() {
        let mut mock = MockPersistence::new();
        mock.expect_load_all().times(1).returning(|| {
            let mut map = Map::new();
            map.insert("restored".to_string(), json!(true));
            Ok(map)
        });

        let store = StateStore::with_persistence(Arc::new(mock), StateConfig::default());
        assert_eq!(store.load().await.unwrap(), 1);
        assert_eq!(store.get("restored"), Some(json!(true)));
    }
}
