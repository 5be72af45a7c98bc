//! Pre-flight checks for the sampletrace binary
//!
//! Validates the environment before a session is configured, so a missing
//! compressor or an unwritable output fails with an actionable message
//! instead of a half-written trace.

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::transport::Compression;

/// Run all pre-flight checks before the session starts
///
/// # Errors
/// Returns the first failing check
pub fn run_preflight_checks(output: &Path, compression: &Compression) -> Result<()> {
    check_output_writable(output)?;
    if let Compression::Process { program, .. } = compression {
        check_compressor_available(program)?;
    }
    Ok(())
}

/// Check that the output file can be created (or truncated) for writing
fn check_output_writable(output: &Path) -> Result<()> {
    if output.is_dir() {
        bail!(
            "Not a file: {}\n\n\
             --output must name a file, not a directory.",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            bail!(
                "Directory not found: {}\n\n\
                 Create it first or pick another --output path.",
                parent.display()
            );
        }
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(output)
        .with_context(|| format!("Cannot open {} for writing", output.display()))?;
    Ok(())
}

/// Check that the compressor program can be found
fn check_compressor_available(program: &str) -> Result<()> {
    if find_program(program).is_some() {
        return Ok(());
    }
    bail!(
        "Compressor not found: {program}\n\n\
         Install it, or record without compression: --compress none\n\
         (or use the built-in one: --compress relay)"
    );
}

/// Resolve `program` the way a spawn would: paths as-is, bare names on `PATH`
#[must_use]
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path).map(|dir| dir.join(program)).find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_in_missing_directory() {
        let result = check_output_writable(Path::new("/nonexistent/dir/trace.prof"));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Directory not found"));
    }

    #[test]
    fn test_output_is_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_output_writable(dir.path()).unwrap_err().to_string();
        assert!(err.contains("Not a file"));
    }

    #[test]
    fn test_output_writable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_output_writable(&dir.path().join("trace.prof")).is_ok());
    }

    #[test]
    fn test_missing_compressor() {
        let compression =
            Compression::Process { program: "sampletrace-no-such-gzip".into(), args: Vec::new() };
        let dir = tempfile::tempdir().unwrap();
        let err = run_preflight_checks(&dir.path().join("t.prof"), &compression).unwrap_err();
        assert!(err.to_string().contains("Compressor not found"));
    }

    #[test]
    fn test_relay_needs_no_program() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.prof");
        assert!(run_preflight_checks(&out, &Compression::Relay { level: 6 }).is_ok());
    }
}
