//! Data structures that must be filled with the input and the parameters of one analysis

use crate::common::LookupError;
use crate::system::WindowsSystem;
use fs_err as fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisTarget {
    /// Path to the target executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisParameters {
    /// Maximum recursion depth of the dependency graph (0 = unlimited)
    pub max_depth: usize,
}

/// Complete specification of an analysis task
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisQuery {
    pub system: Option<WindowsSystem>,
    pub target: AnalysisTarget,
    pub parameters: AnalysisParameters,
}

impl AnalysisQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        let target_exe = target_exe.as_ref();
        if !target_exe.is_file() {
            return Err(LookupError::InputNotFound(target_exe.to_owned()));
        }
        let target_exe = fs::canonicalize(target_exe)?;
        let app_dir = target_exe.parent().ok_or_else(|| {
            LookupError::ContextDeductionError(format!(
                "Could not find application directory for given executable {}",
                target_exe.display()
            ))
        })?;

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(&target_exe);

        Ok(Self {
            system,
            target: AnalysisTarget {
                user_path: Vec::new(),
                target_exe: target_exe.to_owned(),
                app_dir: app_dir.to_owned(),
                working_dir: app_dir.to_owned(),
            },
            parameters: AnalysisParameters::default(),
        })
    }

    /// Use the Windows installation rooted at the given partition instead of the deduced one
    pub fn set_windows_root<P: AsRef<Path>>(&mut self, root: P) -> Result<(), LookupError> {
        self.system = Some(WindowsSystem::from_root(&root).ok_or_else(|| {
            LookupError::ContextDeductionError(format!(
                "no Windows installation found under {}",
                root.as_ref().display()
            ))
        })?);
        Ok(())
    }

    /// Add `;`-separated directories to the user path
    pub fn extend_user_path(&mut self, path: &str) {
        self.target.user_path.extend(
            path.split(';')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::tests::fake_windows_root;

    #[test]
    fn deduce_app_dir_and_system() -> Result<(), LookupError> {
        let d = tempfile::tempdir()?;
        let root = fs::canonicalize(d.path())?;
        fake_windows_root(&root, &[])?;
        let app_dir = root.join("App");
        fs::create_dir_all(&app_dir)?;
        fs::write(app_dir.join("app.exe"), b"MZ")?;

        let mut q = AnalysisQuery::deduce_from_executable_location(app_dir.join("app.exe"))?;
        assert_eq!(q.target.app_dir, app_dir);
        assert_eq!(q.target.working_dir, app_dir);
        assert_eq!(q.parameters.max_depth, 0);
        #[cfg(not(windows))]
        assert_eq!(
            q.system.as_ref().map(|s| s.sys_dir.clone()),
            Some(root.join("Windows").join("System32"))
        );

        q.extend_user_path("C:\\libs;;D:\\more");
        assert_eq!(
            q.target.user_path,
            vec![PathBuf::from("C:\\libs"), PathBuf::from("D:\\more")]
        );
        Ok(())
    }

    #[test]
    fn missing_executable_is_reported() {
        assert!(matches!(
            AnalysisQuery::deduce_from_executable_location("/definitely/not/here.exe"),
            Err(LookupError::InputNotFound(_))
        ));
    }

    #[test]
    fn explicit_windows_root_must_exist() -> Result<(), LookupError> {
        let d = tempfile::tempdir()?;
        let app = d.path().join("app.exe");
        fs::write(&app, b"MZ")?;
        let mut q = AnalysisQuery::deduce_from_executable_location(&app)?;
        assert!(matches!(
            q.set_windows_root(d.path()),
            Err(LookupError::ContextDeductionError(_))
        ));
        Ok(())
    }
}
