//! Helper installation.
//!
//! The bridge only needs a final, executable path for a helper. Where that
//! path comes from is up to an [`Installer`]:
//!
//! - **BundledInstaller**: helpers live in a directory that is already
//!   writable and executable (development checkouts, unpacked installs).
//! - **PackagedInstaller**: helpers ship in a read-only resource directory and
//!   are copied once into a per-user directory before first use.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::platform::ExecMode;

/// Files that belong to the helper set and are copied together.
const ASSET_EXTENSIONS: &[&str] = &["scpt", "sh", "bat"];
const ASSET_FILES: &[&str] = &["connector-win-ppt2010.js"];

/// Absolute path of a runnable helper plus how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub mode: ExecMode,
}

impl ResolvedPath {
    pub fn new(path: impl Into<PathBuf>, mode: ExecMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("helper executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("helper is not executable: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("helper source directory unavailable: {}", .0.display())]
    SourceUnavailable(PathBuf),
}

impl InstallError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Produces a runnable path for a helper executable.
///
/// A returned path must exist, be executable by the current user, and stay
/// valid for the rest of the process lifetime.
pub trait Installer: Send + Sync {
    fn materialize(
        &self,
        executable_name: &str,
        mode: ExecMode,
    ) -> Result<ResolvedPath, InstallError>;
}

/// Uses helpers in place from a fixed directory.
#[derive(Debug, Clone)]
pub struct BundledInstaller {
    dir: PathBuf,
}

impl BundledInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Helpers next to the running executable.
    pub fn beside_current_exe() -> Result<Self, InstallError> {
        let exe = std::env::current_exe().map_err(|e| InstallError::io(Path::new("."), e))?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| InstallError::SourceUnavailable(exe.clone()))?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Installer for BundledInstaller {
    fn materialize(
        &self,
        executable_name: &str,
        mode: ExecMode,
    ) -> Result<ResolvedPath, InstallError> {
        let path = absolute(&self.dir.join(executable_name))?;
        check_runnable(&path, mode)?;
        Ok(ResolvedPath::new(path, mode))
    }
}

/// Copies the helper set from a read-only bundle into a writable directory.
///
/// Copies happen on first use only: a file already present in the target
/// directory is left untouched, so a user-modified helper survives restarts.
#[derive(Debug, Clone)]
pub struct PackagedInstaller {
    source_dir: PathBuf,
    target_dir: PathBuf,
}

impl PackagedInstaller {
    pub fn new(source_dir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Copy missing helper assets into the target directory.
    ///
    /// Returns the number of files copied.
    pub fn sync_assets(&self) -> Result<usize, InstallError> {
        fs::create_dir_all(&self.target_dir).map_err(|e| InstallError::io(&self.target_dir, e))?;

        let entries = match fs::read_dir(&self.source_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(InstallError::SourceUnavailable(self.source_dir.clone()));
            }
            Err(e) => return Err(InstallError::io(&self.source_dir, e)),
        };

        let mut copied = 0;
        for entry in entries {
            let entry = entry.map_err(|e| InstallError::io(&self.source_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_helper_asset(name) {
                continue;
            }

            let source = entry.path();
            let target = self.target_dir.join(name);
            if target.exists() {
                tracing::trace!(target = %target.display(), "Helper asset already installed");
                continue;
            }

            tracing::debug!(
                source = %source.display(),
                target = %target.display(),
                "Copying helper asset"
            );
            fs::copy(&source, &target).map_err(|e| InstallError::io(&target, e))?;
            make_executable(&target, name)?;
            copied += 1;
        }

        Ok(copied)
    }
}

impl Installer for PackagedInstaller {
    fn materialize(
        &self,
        executable_name: &str,
        mode: ExecMode,
    ) -> Result<ResolvedPath, InstallError> {
        let copied = self.sync_assets()?;
        if copied > 0 {
            tracing::info!(
                copied,
                dir = %self.target_dir.display(),
                "Installed helper assets"
            );
        }

        let path = absolute(&self.target_dir.join(executable_name))?;
        check_runnable(&path, mode)?;
        Ok(ResolvedPath::new(path, mode))
    }
}

fn is_helper_asset(name: &str) -> bool {
    if ASSET_FILES.contains(&name) {
        return true;
    }
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ASSET_EXTENSIONS.contains(&ext))
}

#[cfg(unix)]
fn make_executable(path: &Path, name: &str) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    if name.ends_with(".sh") {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| InstallError::io(path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path, _name: &str) -> Result<(), InstallError> {
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, InstallError> {
    std::path::absolute(path).map_err(|e| InstallError::io(path, e))
}

fn check_runnable(path: &Path, mode: ExecMode) -> Result<(), InstallError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InstallError::MissingExecutable(path.to_path_buf()));
        }
        Err(e) => return Err(InstallError::io(path, e)),
    };
    if !meta.is_file() {
        return Err(InstallError::MissingExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        // Shell mode hands the script to an interpreter; no exec bit needed.
        if mode == ExecMode::Direct && meta.permissions().mode() & 0o111 == 0 {
            return Err(InstallError::NotExecutable(path.to_path_buf()));
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[cfg(unix)]
    fn chmod(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn asset_filter_matches_helper_files() {
        assert!(is_helper_asset("connector-osx-kn5.sh"));
        assert!(is_helper_asset("connector-osx-kn5.scpt"));
        assert!(is_helper_asset("connector-win-ppt2010.bat"));
        assert!(is_helper_asset("connector-win-ppt2010.js"));
        assert!(!is_helper_asset("other.js"));
        assert!(!is_helper_asset("README.md"));
        assert!(!is_helper_asset("sh"));
    }

    #[test]
    fn bundled_missing_helper_fails() {
        let dir = tempfile::tempdir().unwrap();
        let installer = BundledInstaller::new(dir.path());
        let err = installer
            .materialize("connector-osx-kn5.sh", ExecMode::Direct)
            .unwrap_err();
        assert!(matches!(err, InstallError::MissingExecutable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn bundled_returns_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_file(dir.path(), "helper.sh", "#!/bin/sh\n");
        chmod(&script, 0o755);

        let resolved = BundledInstaller::new(dir.path())
            .materialize("helper.sh", ExecMode::Direct)
            .unwrap();
        assert!(resolved.path.is_absolute());
        assert_eq!(resolved.path.file_name().unwrap(), "helper.sh");
        assert_eq!(resolved.mode, ExecMode::Direct);
    }

    #[cfg(unix)]
    #[test]
    fn bundled_rejects_non_executable_in_direct_mode() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_file(dir.path(), "helper.sh", "#!/bin/sh\n");
        chmod(&script, 0o644);

        let installer = BundledInstaller::new(dir.path());
        assert!(matches!(
            installer.materialize("helper.sh", ExecMode::Direct),
            Err(InstallError::NotExecutable(_))
        ));
        assert!(installer.materialize("helper.sh", ExecMode::Shell).is_ok());
    }

    #[test]
    fn packaged_copies_assets_once() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let target_dir = target.path().join("slideshow-connectors");

        write_file(source.path(), "connector-osx-kn5.sh", "#!/bin/sh\necho v1\n");
        write_file(source.path(), "connector-osx-kn5.scpt", "scpt");
        write_file(source.path(), "connector-win-ppt2010.js", "js");
        write_file(source.path(), "package.json", "{}");

        let installer = PackagedInstaller::new(source.path(), &target_dir);
        assert_eq!(installer.sync_assets().unwrap(), 3);
        assert!(target_dir.join("connector-osx-kn5.scpt").exists());
        assert!(target_dir.join("connector-win-ppt2010.js").exists());
        assert!(!target_dir.join("package.json").exists());

        // Existing copies are never overwritten.
        write_file(source.path(), "connector-osx-kn5.sh", "#!/bin/sh\necho v2\n");
        assert_eq!(installer.sync_assets().unwrap(), 0);
        let installed = fs::read_to_string(target_dir.join("connector-osx-kn5.sh")).unwrap();
        assert!(installed.contains("v1"));
    }

    #[cfg(unix)]
    #[test]
    fn packaged_marks_scripts_executable() {
        use std::os::unix::fs::PermissionsExt;

        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let script = write_file(source.path(), "connector-osx-kn6.sh", "#!/bin/sh\n");
        chmod(&script, 0o644);

        let resolved = PackagedInstaller::new(source.path(), target.path())
            .materialize("connector-osx-kn6.sh", ExecMode::Direct)
            .unwrap();
        let mode = fs::metadata(&resolved.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(resolved.path.starts_with(std::path::absolute(target.path()).unwrap()));
    }

    #[test]
    fn packaged_missing_source_dir_fails() {
        let target = tempfile::tempdir().unwrap();
        let installer = PackagedInstaller::new("/nonexistent/slideshow/bundle", target.path());
        assert!(matches!(
            installer.materialize("connector-osx-kn5.sh", ExecMode::Direct),
            Err(InstallError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn packaged_missing_executable_fails() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_file(source.path(), "connector-osx-kn5.sh", "#!/bin/sh\n");

        let installer = PackagedInstaller::new(source.path(), target.path());
        assert!(matches!(
            installer.materialize("connector-osx-kn6.sh", ExecMode::Direct),
            Err(InstallError::MissingExecutable(_))
        ));
    }
}
