//! 用户配置与计数的持久化。
//!
//! 每个用户一条记录（cipher/password/port/traffic/time），整体序列化为一份
//! JSON 文档，写入时先写临时文件再原子重命名。配置在添加与修改时写入，
//! 计数在停止时写入，进程重启时整体载入。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// 单个用户的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub cipher: String,
    pub password: String,
    pub port: u16,
    #[serde(default)]
    pub traffic: u64,
    #[serde(default)]
    pub time: i64,
}

pub struct UserStore {
    path: PathBuf,
    records: RwLock<HashMap<String, UserRecord>>,
}

impl UserStore {
    /// 打开存储。文件不存在视为空库；内容损坏则返回错误（启动失败）。
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| Error::Store(format!("corrupt store '{}': {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::Store(format!("open '{}': {e}", path.display())));
            }
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// 写入（或更新）配置字段，保留已有计数。
    pub fn put_config(&self, name: &str, cipher: &str, password: &str, port: u16) -> Result<()> {
        let mut records = self.write();
        let entry = records
            .entry(name.to_string())
            .or_insert_with(|| UserRecord {
                cipher: String::new(),
                password: String::new(),
                port,
                traffic: 0,
                time: 0,
            });
        entry.cipher = cipher.to_string();
        entry.password = password.to_string();
        entry.port = port;
        self.save(&records)
    }

    /// 写入计数字段；记录必须已存在。
    pub fn put_counters(&self, name: &str, traffic: u64, time: i64) -> Result<()> {
        let mut records = self.write();
        let Some(entry) = records.get_mut(name) else {
            return Err(Error::Store(format!("no record for '{name}'")));
        };
        entry.traffic = traffic;
        entry.time = time;
        self.save(&records)
    }

    /// 删除整条记录；不存在时为空操作。
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut records = self.write();
        if records.remove(name).is_some() {
            return self.save(&records);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<UserRecord> {
        self.read().get(name).cloned()
    }

    pub fn load_all(&self) -> HashMap<String, UserRecord> {
        self.read().clone()
    }

    /// 原子落盘：temp + rename。
    fn save(&self, records: &HashMap<String, UserRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| Error::Store(format!("serialize failed: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| Error::Store(format!("write '{}': {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("rename to '{}': {e}", self.path.display())))?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UserRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UserRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("users.json")
    }

    #[test]
    fn open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(store_path(&dir)).unwrap();
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn config_and_counters_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        {
            let store = UserStore::open(&path).unwrap();
            store
                .put_config("alice", "AES-256-GCM", "secret", 18388)
                .unwrap();
            store.put_counters("alice", 42, 17).unwrap();
        }

        let store = UserStore::open(&path).unwrap();
        let record = store.get("alice").unwrap();
        assert_eq!(
            record,
            UserRecord {
                cipher: "AES-256-GCM".into(),
                password: "secret".into(),
                port: 18388,
                traffic: 42,
                time: 17,
            }
        );
    }

    #[test]
    fn put_config_preserves_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(store_path(&dir)).unwrap();
        store.put_config("alice", "AES-128-GCM", "a", 1000).unwrap();
        store.put_counters("alice", 7, 3).unwrap();
        store.put_config("alice", "AES-256-GCM", "b", 1000).unwrap();

        let record = store.get("alice").unwrap();
        assert_eq!(record.cipher, "AES-256-GCM");
        assert_eq!((record.traffic, record.time), (7, 3));
    }

    #[test]
    fn counters_require_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(store_path(&dir)).unwrap();
        assert!(matches!(
            store.put_counters("ghost", 1, 1),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn delete_removes_the_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let store = UserStore::open(&path).unwrap();
        store.put_config("alice", "AES-128-GCM", "a", 1000).unwrap();
        store.delete("alice").unwrap();
        store.delete("alice").unwrap(); // idempotent

        let reopened = UserStore::open(&path).unwrap();
        assert!(reopened.get("alice").is_none());
    }

    #[test]
    fn corrupt_store_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(UserStore::open(&path), Err(Error::Store(_))));
    }

    #[test]
    fn missing_counter_fields_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(
            &path,
            r#"{"alice":{"cipher":"AES-128-GCM","password":"p","port":18388}}"#,
        )
        .unwrap();
        let store = UserStore::open(&path).unwrap();
        let record = store.get("alice").unwrap();
        assert_eq!((record.traffic, record.time), (0, 0));
    }
}
