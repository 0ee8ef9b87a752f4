use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::services::model::{ProviderGroup, ProviderInfo, ProviderMapping, ServiceKey};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup file io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid backup file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize backup: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn io_error(path: &Path, source: std::io::Error) -> BackupError {
    BackupError::Io {
        path: path.display().to_string(),
        source,
    }
}

// 备份文件格式：[providers] 表，服务 key -> 端点 url 列表
#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupFile {
    #[serde(default)]
    providers: BTreeMap<ServiceKey, Vec<ProviderInfo>>,
}

/// 读取备份文件，文件不存在时返回空映射
pub fn load(path: &Path) -> Result<ProviderMapping, BackupError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ProviderMapping::new()),
        Err(e) => return Err(io_error(path, e)),
    };
    let backup: BackupFile = toml::from_str(&content).map_err(|source| BackupError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    Ok(backup
        .providers
        .into_iter()
        .map(|(key, providers)| (key, ProviderGroup::from_providers(providers)))
        .collect())
}

/// 启动时加载，任何失败都当作空注册中心
pub fn load_or_empty(path: &Path) -> ProviderMapping {
    match load(path) {
        Ok(mapping) => mapping,
        Err(e) => {
            tracing::warn!(
                file = %path.display(),
                error = %e,
                "Failed to load registry backup file, starting with empty registry"
            );
            ProviderMapping::new()
        }
    }
}

/// 先写临时文件再 rename，避免读到写了一半的内容；返回写入内容的摘要
pub fn write(path: &Path, mapping: &ProviderMapping) -> Result<String, BackupError> {
    let backup = BackupFile {
        providers: mapping
            .iter()
            .map(|(key, group)| (key.clone(), group.providers().cloned().collect()))
            .collect(),
    };
    let content = toml::to_string(&backup)?;
    let digest = digest(content.as_bytes());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    fs::write(tmp, content).map_err(|e| io_error(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| io_error(path, e))?;

    tracing::debug!(file = %path.display(), services = mapping.len(), "Registry backup written");
    Ok(digest)
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// 文件内容的 SHA-256，文件不存在时返回 None
pub fn checksum(path: &Path) -> Result<Option<String>, BackupError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(digest(&bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.toml");

        let mut mapping = ProviderMapping::new();
        mapping.insert(
            ServiceKey::from("Echo:1.0@bolt"),
            ProviderGroup::from_providers(vec![
                ProviderInfo::new("bolt", "10.0.0.1", 22000).with_attribute("weight", "100"),
            ]),
        );
        mapping.insert(ServiceKey::from("Idle:1.0@bolt"), ProviderGroup::new());

        let digest = write(&path, &mapping).unwrap();
        assert_eq!(load(&path).unwrap(), mapping);
        assert_eq!(checksum(&path).unwrap(), Some(digest));
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        assert!(load(&path).unwrap().is_empty());
        assert_eq!(checksum(&path).unwrap(), None);

        fs::write(&path, "providers = [not toml").unwrap();
        assert!(matches!(load(&path), Err(BackupError::Parse { .. })));
        assert!(load_or_empty(&path).is_empty());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        fs::write(&path, "[providers]\n").unwrap();
        let first = checksum(&path).unwrap();
        fs::write(&path, "[providers]\n").unwrap();
        assert_eq!(checksum(&path).unwrap(), first);
        fs::write(&path, "[providers]\n\"Echo:1.0@bolt\" = []\n").unwrap();
        assert_ne!(checksum(&path).unwrap(), first);
    }
}
