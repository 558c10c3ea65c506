//! Session credentials for the partners API.
//!
//! The partners API only accepts headers captured from a browser login. An
//! external bot performs that login and writes the headers to a JSON file;
//! this module reads the file and, when asked, re-runs the bot.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::errors::CredentialError;

/// Header name to value, presented verbatim on every partners call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub headers: HashMap<String, String>,
}

impl SessionCredentials {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

// Header values are session secrets.
impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        f.debug_struct("SessionCredentials")
            .field("headers", &names)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credentials. `None` when none have been captured yet.
    async fn get(&self) -> Result<Option<SessionCredentials>, CredentialError>;

    /// Obtains fresh credentials. May block for the length of a login flow.
    ///
    /// Every call performs a new login; callers decide how often to ask.
    async fn refresh(&self) -> Result<(), CredentialError>;
}

/// Reads credentials from a JSON file and refreshes them by running a command.
pub struct FileCredentialProvider {
    path: PathBuf,
    refresh_command: Option<String>,
    refresh_timeout: Duration,
    /// One login flow at a time.
    refresh_lock: Mutex<()>,
}

impl FileCredentialProvider {
    pub fn new(
        path: impl Into<PathBuf>,
        refresh_command: Option<String>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            refresh_command,
            refresh_timeout,
            refresh_lock: Mutex::new(()),
        }
    }

    async fn run_refresh_command(&self, command_line: &str) -> Result<(), CredentialError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| CredentialError::RefreshFailed("empty refresh command".to_string()))?;

        let mut command = Command::new(program);
        command.args(parts).kill_on_drop(true);

        let output = tokio::time::timeout(self.refresh_timeout, command.output())
            .await
            .map_err(|_| CredentialError::RefreshTimedOut(self.refresh_timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CredentialError::RefreshFailed(format!(
                "refresh command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn get(&self) -> Result<Option<SessionCredentials>, CredentialError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let headers: HashMap<String, String> = serde_json::from_str(&raw)?;
        let credentials = SessionCredentials { headers };
        Ok((!credentials.is_empty()).then_some(credentials))
    }

    async fn refresh(&self) -> Result<(), CredentialError> {
        let _guard = self.refresh_lock.lock().await;

        let Some(command_line) = self.refresh_command.as_deref() else {
            return Err(CredentialError::RefreshFailed(
                "no refresh command configured".to_string(),
            ));
        };

        tracing::info!("Refreshing partners API session");
        self.run_refresh_command(command_line).await?;
        tracing::info!("Partners API session refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("session-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_file_means_no_credentials() {
        let provider = FileCredentialProvider::new(temp_path(), None, Duration::from_secs(1));
        assert!(provider.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_header_map() {
        let path = temp_path();
        tokio::fs::write(&path, r#"{"Authorization": "Bearer abc", "Cookie": "sid=1"}"#)
            .await
            .unwrap();

        let provider = FileCredentialProvider::new(&path, None, Duration::from_secs(1));
        let creds = provider.get().await.unwrap().unwrap();
        assert_eq!(creds.headers["Authorization"], "Bearer abc");
        assert!(!format!("{creds:?}").contains("abc"));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let path = temp_path();
        tokio::fs::write(&path, "not json").await.unwrap();

        let provider = FileCredentialProvider::new(&path, None, Duration::from_secs(1));
        assert!(matches!(
            provider.get().await,
            Err(CredentialError::Malformed(_))
        ));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn refresh_without_command_fails() {
        let provider = FileCredentialProvider::new(temp_path(), None, Duration::from_secs(1));
        assert!(matches!(
            provider.refresh().await,
            Err(CredentialError::RefreshFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn every_refresh_runs_the_command() {
        let runs = std::env::temp_dir().join(format!("refresh-runs-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir(&runs).await.unwrap();

        // Each run leaves one new file behind.
        let provider = FileCredentialProvider::new(
            temp_path(),
            Some(format!("mktemp -p {}", runs.display())),
            Duration::from_secs(5),
        );
        provider.refresh().await.unwrap();
        provider.refresh().await.unwrap();

        let mut entries = tokio::fs::read_dir(&runs).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);

        tokio::fs::remove_dir_all(&runs).await.ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported() {
        let provider = FileCredentialProvider::new(
            temp_path(),
            Some("false".to_string()),
            Duration::from_secs(5),
        );
        assert!(matches!(
            provider.refresh().await,
            Err(CredentialError::RefreshFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let provider = FileCredentialProvider::new(
            temp_path(),
            Some("sleep 5".to_string()),
            Duration::from_millis(100),
        );
        assert!(matches!(
            provider.refresh().await,
            Err(CredentialError::RefreshTimedOut(_))
        ));
    }
}
