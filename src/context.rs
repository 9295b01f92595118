//! Project context carried by terminal sessions.
//!
//! A session's environment is fixed at spawn. Later context changes are
//! written to a per-session env file whose path is itself in the
//! environment, so a shell can `source "$DEVDOCK_SESSION_CONTEXT_FILE"` to
//! pick them up.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Suffix of the variable that points at the session's context file.
pub const CONTEXT_FILE_KEY: &str = "SESSION_CONTEXT_FILE";

/// Immutable view of what the user is working on. Replaced wholesale on
/// update, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSnapshot {
    pub project_id: Option<String>,
    pub project_path: Option<String>,
    pub current_file: Option<String>,
    pub active_view: Option<String>,
    pub server_url: Option<String>,
    /// Additional keys, exported as `<PREFIX>_<KEY>`.
    pub extra: BTreeMap<String, String>,
}

impl ContextSnapshot {
    /// Environment variables for this snapshot. Unset fields are omitted.
    /// Named fields win over `extra` keys that map to the same variable.
    pub fn to_env(&self, prefix: &str) -> Vec<(String, String)> {
        let mut vars: BTreeMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (env_key(prefix, k), v.clone()))
            .collect();

        let fields = [
            ("PROJECT_ID", &self.project_id),
            ("PROJECT_PATH", &self.project_path),
            ("CURRENT_FILE", &self.current_file),
            ("ACTIVE_VIEW", &self.active_view),
            ("SERVER_URL", &self.server_url),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                vars.insert(env_key(prefix, key), value.clone());
            }
        }
        vars.into_iter().collect()
    }
}

/// `<PREFIX>_<KEY>` with the key uppercased and anything that is not an
/// ASCII alphanumeric replaced by `_`.
pub fn env_key(prefix: &str, key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_{key}")
}

/// Quote a value for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A fresh, unique context file path under `state_dir`.
pub fn new_context_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(format!("session-{}.env", uuid::Uuid::new_v4()))
}

/// Write `snapshot` as `export` lines. The file is replaced atomically, so
/// a shell sourcing it never sees a partial write.
pub fn write_context_file(path: &Path, snapshot: &ContextSnapshot, prefix: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        create_private_dir(dir)?;
    }

    let mut contents = String::new();
    for (key, value) in snapshot.to_env(prefix) {
        contents.push_str(&format!("export {}={}\n", key, shell_quote(&value)));
    }

    let tmp = path.with_extension("env.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

pub fn remove_context_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove context file: {}", e),
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
