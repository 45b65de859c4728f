pub mod mcp_client;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use mcp_client::{BlockingMcpClient, McpClient, McpError, ToolCallResult};

/// Set to `json` for one JSON object per log line.
pub const LOG_FORMAT_ENV: &str = "FI_MCP_LOG_FORMAT";

const DEFAULT_LOG_FILTER: &str = "fi_mcp_client=info,warn";
const LOG_FILE_NAME: &str = "mcp-client.log";
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for the client.
///
/// - macOS: `~/Library/Application Support/fi-mcp-client/`
/// - Windows: `{FOLDERID_RoamingAppData}\fi-mcp-client\`
/// - Linux: `$XDG_DATA_HOME/fi-mcp-client/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.fi-mcp-client/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("fi-mcp-client");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fi-mcp-client")
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Rotating `mcp-client.log` inside this directory.
    File(PathBuf),
}

/// Initialize the tracing subscriber.
///
/// With a file target the previous logs are rotated (keeps the last 3) and a
/// fresh `mcp-client.log` is opened with a line-flushing writer. Returns the
/// log file path in that case. A subscriber installed earlier is left alone.
pub fn init_tracing(target: LogTarget) -> io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, log_path) = match &target {
        LogTarget::Stderr => (BoxMakeWriter::new(io::stderr), None),
        LogTarget::File(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, LOG_FILES_KEPT);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (
                BoxMakeWriter::new(FlushingWriter::new(log_file)),
                Some(log_path),
            )
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let installed = if json {
        fmt::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .try_init()
    } else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
    };
    if installed.is_err() {
        return Ok(log_path);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== fi-mcp-client starting ==="
    );

    Ok(log_path)
}

/// `mcp-client.log.<n>` next to `base`.
fn numbered_log(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift the previous run's log one generation back, keeping at most `keep`
/// numbered copies. Gaps in the numbering are tolerated.
fn rotate_log_file(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(numbered_log(base, keep));
    for generation in (1..keep).rev() {
        let _ = std::fs::rename(numbered_log(base, generation), numbered_log(base, generation + 1));
    }
    if base.exists() {
        let _ = std::fs::rename(base, numbered_log(base, 1));
    }
}

/// Log file handle shared by every formatted event; each write is flushed
/// before returning.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        f(&mut file)
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("mcp-client.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("mcp-client.log.2"), "two").unwrap();
        std::fs::write(dir.path().join("mcp-client.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(dir.path().join(format!("mcp-client.log.{n}")));
        assert_eq!(read(1).unwrap(), "current");
        assert_eq!(read(2).unwrap(), "one");
        assert_eq!(read(3).unwrap(), "two");
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);

        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_data_dir_is_app_scoped() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("fi-mcp-client"));
    }
}
