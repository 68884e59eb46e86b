use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

/// Read-only bundled fallback data, looked up by request type name.
///
/// Entries registered in memory take precedence over files in the bundle
/// directory (`<dir>/<type name>.json`).
#[derive(Debug, Clone, Default)]
pub struct ResourceBundle {
    dir: Option<PathBuf>,
    entries: HashMap<String, Vec<u8>>,
}

impl ResourceBundle {
    /// A bundle with no data.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_dir(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            entries: HashMap::new(),
        }
    }

    /// Adds an in-memory entry for `type_name`.
    pub fn with_entry(mut self, type_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(type_name.into(), bytes.into());
        self
    }

    pub fn bytes_for(&self, type_name: &str) -> Option<Vec<u8>> {
        if let Some(bytes) = self.entries.get(type_name) {
            return Some(bytes.clone());
        }

        let path = self.dir.as_ref()?.join(format!("{}.json", type_name));
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(?path, error = %e, "Failed to read bundled fallback");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bundle() {
        assert_eq!(ResourceBundle::empty().bytes_for("Weather"), None);
    }

    #[test]
    fn test_bundle_reads_type_named_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Weather.json"), b"{\"temp\":60}").unwrap();

        let bundle = ResourceBundle::from_dir(dir.path().to_path_buf());
        assert_eq!(bundle.bytes_for("Weather"), Some(b"{\"temp\":60}".to_vec()));
        assert_eq!(bundle.bytes_for("Forecast"), None);
    }

    #[test]
    fn test_memory_entry_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Weather.json"), b"1").unwrap();

        let bundle = ResourceBundle::from_dir(dir.path().to_path_buf()).with_entry("Weather", "2");
        assert_eq!(bundle.bytes_for("Weather"), Some(b"2".to_vec()));
    }
}
