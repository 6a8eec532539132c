use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::sync::LazyLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) static STYLE_RUN: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

pub(crate) static STYLE_NODE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

/// Installs a `tracing` subscriber suited for terminal use.
///
/// Log lines are routed through the progress bar writer so they don't tear
/// the bars drawn by the schedulers. The filter defaults to `info` and can be
/// overridden through `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Writes `data` next to `path` and renames it into place, so that readers
/// only ever observe the old or the complete new content.
pub(crate) fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    let name = path.file_name().unwrap_or("file");
    let temp = path.with_file_name(format!(".{name}.{}.tmp", std::process::id()));

    {
        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&temp, path)
}

/// Hard link with fallback to copy.
pub(crate) fn link_or_copy(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
    if to.exists() {
        fs::remove_file(to)?;
    }

    if fs::hard_link(from, to).is_err() {
        fs::copy(from, to)?;
    }

    Ok(())
}

/// Every file below `dir`, sorted. Directories are descended into but not
/// listed themselves.
pub(crate) fn walk_files(dir: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in current.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                stack.push(entry.into_path());
            } else {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Message carried by a caught panic.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_files_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("b.txt"), "").unwrap();
        fs::write(root.join("sub/deeper/a.txt"), "").unwrap();

        let files = walk_files(&root).unwrap();
        assert_eq!(files, vec![root.join("b.txt"), root.join("sub/deeper/a.txt")]);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("marker.json")).unwrap();

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_link_or_copy() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("a.txt"), "data").unwrap();

        link_or_copy(&root.join("a.txt"), &root.join("b.txt")).unwrap();
        assert_eq!(fs::read_to_string(root.join("b.txt")).unwrap(), "data");
    }
}
