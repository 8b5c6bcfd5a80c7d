use super::format::PolicyDocument;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Error type for loading and storing the policy table.
#[derive(Debug)]
pub enum RegistryError {
    Io(io::Error),
    Json(serde_json::Error),
    /// Persistence requested but no file was configured.
    NoStoragePath,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "policy file I/O error: {}", e),
            RegistryError::Json(e) => write!(f, "policy file is not valid: {}", e),
            RegistryError::NoStoragePath => write!(f, "no policy file configured"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Io(e) => Some(e),
            RegistryError::Json(e) => Some(e),
            RegistryError::NoStoragePath => None,
        }
    }
}

impl From<io::Error> for RegistryError {
    fn from(e: io::Error) -> Self {
        RegistryError::Io(e)
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Json(e)
    }
}

/// Reads a policy file; a missing file is an empty document.
pub(super) fn read_document(path: &Path) -> Result<PolicyDocument, RegistryError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PolicyDocument::default()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the document via a `.tmp` sibling and a rename, so readers never
/// see a half-written file.
pub(super) fn write_document(path: &Path, document: &PolicyDocument) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    serde_json::to_writer_pretty(&mut file, document)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyStatus, SocketRecord};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let doc = read_document(&dir.path().join("absent.json")).unwrap();
        assert_eq!(doc, PolicyDocument::default());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("policy.json");
        let doc = PolicyDocument {
            persistent: true,
            sockets: vec![SocketRecord {
                host: Some("db".into()),
                port: Some(5432),
                status: PolicyStatus::Closed,
                discovered: false,
            }],
            data_sources: vec![],
        };

        write_document(&path, &doc).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(read_document(&path).unwrap(), doc);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_document(&path), Err(RegistryError::Json(_))));
    }
}
