use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use crate::errors::{AppError, Result};

/// Keeps alphanumerics and `._- `, dropping everything else.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string()
}

/// Generates a unique token for temp names
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Short form of the download id used where file names get long
pub fn short_id() -> String {
    generate_download_id()[..8].to_string()
}

/// Hides credentials embedded in a proxy URL before it reaches the logs.
pub fn mask_proxy(proxy_url: &str) -> String {
    match url::Url::parse(proxy_url) {
        Ok(parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let host = parsed.host_str().unwrap_or("");
            match parsed.port() {
                Some(port) => format!("{}://***:***@{}:{}", parsed.scheme(), host, port),
                None => format!("{}://***:***@{}", parsed.scheme(), host),
            }
        }
        Ok(_) => proxy_url.to_string(),
        Err(_) => "***".to_string(),
    }
}

/// Files in `dir` whose name starts with `prefix`.
pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(prefix))
        })
        .collect()
}

/// Best-effort removal, used on failure paths.
pub fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("⚠️ Could not remove {:?}: {}", path, e);
        }
    }
}

/// Output of an external tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Runs an external program, killing it if it outlives `timeout`.
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolOutput> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Tool(format!("Failed to start {}: {}", program, e)))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| AppError::Tool(format!("{} timed out after {}s", program, timeout.as_secs())))??;

    Ok(ToolOutput {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
