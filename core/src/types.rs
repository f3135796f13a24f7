use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

pub type BackupFileId = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Registry of tracked backups, keyed by id.
pub type BackupList = BTreeMap<BackupFileId, BackupFile>;

/// One tracked backup.
///
/// The serialized field names (`path`, `backup_path`, ...) are part of the config document
/// format and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub id: BackupFileId,
    pub filename: String,
    #[serde(rename = "path")]
    pub source_path: PathBuf,
    #[serde(rename = "backup_path")]
    pub artifact_path: PathBuf,
    pub timestamp: Timestamp,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub is_in_cloud: bool,
}

impl BackupFile {
    /// Plain backups are a verbatim copy of the source rather than an archive.
    pub fn is_plain(&self) -> bool {
        !self.is_compressed && !self.is_encrypted
    }

    pub fn flags(&self) -> String {
        let mut flags = String::with_capacity(3);
        flags.push(if self.is_compressed { 'z' } else { '-' });
        flags.push(if self.is_encrypted { 'e' } else { '-' });
        flags.push(if self.is_in_cloud { 'c' } else { '-' });
        flags
    }

    pub fn time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.timestamp as i64).unwrap_or_default()
    }
}

impl fmt::Display for BackupFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] {}",
            self.id,
            self.filename,
            self.flags(),
            self.source_path.display()
        )
    }
}

pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Lexically normalizes a path: removes `.` components and folds `..` into the preceding
/// component where one exists. The filesystem is not consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Makes `path` absolute against the current directory and normalizes it.
pub fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    Ok(normalize_path(&std::path::absolute(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/./b/../c/")), PathBuf::from("/a/c"));
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize_path(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn test_backup_file_field_names() {
        let file = BackupFile {
            id: 7,
            filename: "docs".to_string(),
            source_path: PathBuf::from("/home/u/docs"),
            artifact_path: PathBuf::from("/backups/7docs"),
            timestamp: 1_700_000_000_000,
            is_compressed: true,
            is_encrypted: false,
            is_in_cloud: false,
        };

        let value = serde_json::to_value(&file).unwrap();
        for key in [
            "id",
            "filename",
            "path",
            "backup_path",
            "timestamp",
            "is_compressed",
            "is_encrypted",
            "is_in_cloud",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }

        let back: BackupFile = serde_json::from_value(value).unwrap();
        assert_eq!(back, file);
        assert_eq!(back.flags(), "z--");
    }
}
