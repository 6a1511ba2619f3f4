use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. With `output` set, log lines are appended
/// to that file; if it cannot be opened the subscriber falls back to stderr
/// and a warning is logged instead of failing startup.
pub fn init(output: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lansurveyd=info"));

    let mut open_error = None;
    let (writer, ansi) = match output {
        Some(path) => match open_append(path) {
            Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
            Err(e) => {
                open_error = Some((path, e));
                (BoxMakeWriter::new(io::stderr), true)
            }
        },
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .init();

    if let Some((path, e)) = open_error {
        tracing::warn!("Can't open log file {}: {}", path.display(), e);
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_append_keeps_existing_lines() {
        let path = std::env::temp_dir().join(format!("lansurveyd-log-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        writeln!(open_append(&path).unwrap(), "first").unwrap();
        writeln!(open_append(&path).unwrap(), "second").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_append_missing_directory() {
        assert!(open_append(Path::new("/nonexistent-dir/lansurveyd.log")).is_err());
    }
}
