//! Small filesystem helpers shared by the JSON stores.

use std::path::Path;

/// Atomic text save: write a sibling temp file, then rename over the
/// target. Readers never observe a half-written store.
pub fn write_atomically(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Pretty-printed JSON save (2-space indent), atomic.
pub fn save_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomically(path, &json)
}

/// Load JSON from `path`, or produce `default` when the file is absent.
pub fn load_json_or<T: serde::de::DeserializeOwned>(
    path: &Path,
    default: impl FnOnce() -> T,
) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn json_round_trip_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut value = BTreeMap::new();
        value.insert("b".to_string(), 2u32);
        value.insert("a".to_string(), 1u32);
        save_json_pretty(&path, &value).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded: BTreeMap<String, u32> =
            load_json_or(&path, BTreeMap::new).unwrap();
        save_json_pretty(&path, &loaded).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let loaded: Vec<u32> = load_json_or(&path, Vec::new).unwrap();
        assert!(loaded.is_empty());
    }
}
