use std::path::Path;

use serde::Deserialize;

use crate::error::WorkerError;

/// Basic-auth credentials for the coordinator's `/token` endpoint.
///
/// Either supplied directly (from environment/CLI) or loaded once from a JSON file at
/// construction time. The file is never re-read during execution: it is a capability
/// delivered once, not a live configuration source.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_file(path: &Path) -> Result<Self, WorkerError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            WorkerError::Configuration(format!(
                "failed to read credentials file {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            WorkerError::Configuration(format!(
                "failed to parse credentials file {}: {err}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_username_and_password() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"username": "worker1", "password": "sqrrl"}}"#).unwrap();

        let creds = Credentials::from_file(file.path()).unwrap();
        assert_eq!(creds.username, "worker1");
        assert_eq!(creds.password, "sqrrl");
    }

    #[test]
    fn rejects_missing_file() {
        let err = Credentials::from_file(Path::new("/does/not/exist.json")).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }
}
