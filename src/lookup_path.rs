use crate::apiset;
use crate::common::LookupError;
use crate::manifest::SxsEntries;
use crate::pe::PeImage;
use crate::query::AnalysisQuery;
use crate::strategy::SearchStrategy;
use crate::system::WinFileSystemCache;
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Where the loader would find a module, as decided by a [`ModuleResolver`]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedModule {
    pub strategy: SearchStrategy,
    pub path: Option<PathBuf>,
}

impl ResolvedModule {
    pub fn new(strategy: SearchStrategy, path: Option<PathBuf>) -> Self {
        Self { strategy, path }
    }

    pub fn not_found() -> Self {
        Self::new(SearchStrategy::NotFound, None)
    }
}

/// Maps an imported module name to the way the loader would locate it
///
/// Implementations must answer consistently for the same root image and name
/// within one analysis.
pub trait ModuleResolver {
    fn resolve(&self, root: &PeImage, name: &str) -> ResolvedModule;
}

/// Directory/set of DLLs to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Redirection of api-/ext- contract names to their host modules
    ApiSet,
    /// Modules declared in the manifest of the root executable
    SideBySide,
    /// The DLL is implicitely loaded by the OS for every process, and not looked up every time
    KnownDLLs,
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    // SystemDir16, // ignored
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system (value PATH variable in the shell executing the process)
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn strategy(&self) -> SearchStrategy {
        match self {
            Self::ApiSet => SearchStrategy::ApiSetSchema,
            Self::SideBySide => SearchStrategy::SideBySide,
            Self::KnownDLLs => SearchStrategy::WellKnownDll,
            Self::ExecutableDir(_) => SearchStrategy::ApplicationDirectory,
            Self::SystemDir(_) => SearchStrategy::System32Folder,
            Self::WindowsDir(_) => SearchStrategy::WindowsFolder,
            Self::WorkingDir(_) => SearchStrategy::WorkingDirectory,
            Self::SystemPath(_) => SearchStrategy::EnvironmentPath,
            Self::UserPath(_) => SearchStrategy::UserDefined,
        }
    }
}

/// Sorted list of directories to be looked up when searching for a DLL
/// It is built from a query, depending on the current system configuration
/// (availability of a Windows root, and its configuration that influences the lookup)
pub struct LookupPath {
    pub query: AnalysisQuery,
    pub entries: Vec<LookupPathEntry>,
    apiset_name: Regex,
    fs_cache: RefCell<WinFileSystemCache>,
    sxs_cache: RefCell<HashMap<PathBuf, SxsEntries>>,
}

impl LookupPath {
    pub fn new(query: AnalysisQuery) -> Result<Self, LookupError> {
        let app_dir = LookupPathEntry::ExecutableDir(query.target.app_dir.clone());
        let working_dir = LookupPathEntry::WorkingDir(query.target.working_dir.clone());
        let path_entries = [
            Self::system_path_entries(&query),
            Self::user_path_entries(&query),
        ]
        .concat();

        let entries = if let Some(system) = &query.system {
            let mut loader_entries = Vec::new();
            if system.apiset_map.is_some() {
                loader_entries.push(LookupPathEntry::ApiSet);
            }
            loader_entries.push(LookupPathEntry::SideBySide);
            if system.known_dlls.is_some() {
                loader_entries.push(LookupPathEntry::KnownDLLs);
            }
            let system_entries = vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                // 16-bit system directory ignored
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ];

            if system.safe_dll_search_mode_on.unwrap_or(true) {
                // default mode (assume if not specified)
                [
                    loader_entries,
                    vec![app_dir],
                    system_entries,
                    vec![working_dir],
                    path_entries,
                ]
                .concat()
            } else {
                // if HKEY_LOCAL_MACHINE\System\CurrentControlSet\Control\Session Manager\SafeDllSearchMode is 0
                [
                    loader_entries,
                    vec![app_dir, working_dir],
                    system_entries,
                    path_entries,
                ]
                .concat()
            }
        } else {
            [
                vec![LookupPathEntry::SideBySide, app_dir, working_dir],
                path_entries,
            ]
            .concat()
        };

        Ok(Self {
            query,
            entries,
            apiset_name: apiset::apiset_name_pattern()?,
            fs_cache: RefCell::new(WinFileSystemCache::new()),
            sxs_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &AnalysisQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &AnalysisQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect()
    }

    /// looks for a DLL by name, walking the entries in order
    pub fn search_dll(&self, root: &PeImage, library: &str) -> ResolvedModule {
        let as_path = Path::new(library);
        if as_path.is_absolute() {
            return if as_path.is_file() {
                ResolvedModule::new(SearchStrategy::Fullpath, Some(as_path.to_owned()))
            } else {
                ResolvedModule::not_found()
            };
        }

        for e in &self.entries {
            let found = match e {
                LookupPathEntry::ApiSet => self.search_dll_in_apiset_map(root, library),
                LookupPathEntry::SideBySide => self.search_dll_in_sxs_entries(root, library),
                LookupPathEntry::KnownDLLs => self.search_dll_in_known_dlls(root, library),
                LookupPathEntry::SystemDir(p) => {
                    let dir = self.system_dir_for(root).unwrap_or(p);
                    self.search_file_in_folder(library, dir)
                }
                LookupPathEntry::ExecutableDir(p)
                | LookupPathEntry::WindowsDir(p)
                | LookupPathEntry::WorkingDir(p)
                | LookupPathEntry::SystemPath(p)
                | LookupPathEntry::UserPath(p) => self.search_file_in_folder(library, p),
            };
            if let Some(path) = found {
                trace!("{} found through {:?}", library, e);
                return ResolvedModule::new(e.strategy(), path);
            }
        }
        trace!("{} not found", library);
        ResolvedModule::not_found()
    }

    /// 32-bit images are served from the WOW64 system directory
    fn system_dir_for(&self, root: &PeImage) -> Option<&PathBuf> {
        self.query
            .system
            .as_ref()
            .filter(|s| !root.is_64 && s.wow64_dir.is_dir())
            .map(|s| &s.wow64_dir)
    }

    // the outer Option tells whether the entry matched, the inner one whether a file backs it
    fn search_dll_in_known_dlls(&self, root: &PeImage, library: &str) -> Option<Option<PathBuf>> {
        let system = self.query.system.as_ref()?;
        let known_dlls = if root.is_64 {
            system.known_dlls.as_ref()
        } else {
            system.known_dlls_wow64.as_ref().or(system.known_dlls.as_ref())
        }?;
        known_dlls
            .search_dll_in_known_dlls(library)
            .map(|p| Some(p.clone()))
    }

    fn search_dll_in_apiset_map(&self, root: &PeImage, library: &str) -> Option<Option<PathBuf>> {
        if !self.apiset_name.is_match(library) {
            return None;
        }
        let system = self.query.system.as_ref()?;
        let hosts = system.apiset_map.as_ref()?.get(library)?;
        // API set: return location of the host DLL on disk, although useless, to show it in the results
        let sys_dir = self.system_dir_for(root).unwrap_or(&system.sys_dir);
        Some(
            hosts
                .first()
                .and_then(|host| self.search_file_in_folder(host, sys_dir).flatten()),
        )
    }

    fn search_dll_in_sxs_entries(&self, root: &PeImage, library: &str) -> Option<Option<PathBuf>> {
        let mut cache = self.sxs_cache.borrow_mut();
        let entries = cache
            .entry(root.path.clone())
            .or_insert_with(|| SxsEntries::from_image(root, self.query.system.as_ref()));
        entries.get(library).map(|e| Some(e.path.clone()))
    }

    fn search_file_in_folder<P: AsRef<Path>>(
        &self,
        filename: &str,
        p: P,
    ) -> Option<Option<PathBuf>> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, p.as_ref())
            .map(Some)
    }
}

impl ModuleResolver for LookupPath {
    fn resolve(&self, root: &PeImage, name: &str) -> ResolvedModule {
        self.search_dll(root, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::ApisetMap;
    use crate::manifest::tests::COMCTL_MANIFEST;
    use crate::query::{AnalysisParameters, AnalysisTarget};
    use crate::system::tests::fake_windows_root;
    use crate::system::WindowsSystem;
    use fs_err as fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        app_dir: PathBuf,
        system: WindowsSystem,
    }

    fn fixture() -> Result<Fixture, LookupError> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_owned();
        let system = fake_windows_root(&root, &["sys.dll", "shared.dll", "kernelbase.dll"])?;
        fs::write(system.win_dir.join("win.dll"), b"MZ")?;
        let app_dir = root.join("app");
        fs::create_dir_all(&app_dir)?;
        fs::write(app_dir.join("Shared.dll"), b"MZ")?;
        fs::write(app_dir.join("Plugin.dll"), b"MZ")?;
        Ok(Fixture {
            _dir: dir,
            root,
            app_dir,
            system,
        })
    }

    fn query(f: &Fixture, system: Option<WindowsSystem>) -> AnalysisQuery {
        AnalysisQuery {
            system,
            target: AnalysisTarget {
                target_exe: f.app_dir.join("app.exe"),
                app_dir: f.app_dir.clone(),
                working_dir: f.root.join("work"),
                user_path: vec![f.root.join("user")],
            },
            parameters: AnalysisParameters::default(),
        }
    }

    fn root_image(f: &Fixture) -> PeImage {
        PeImage {
            path: f.app_dir.join("app.exe"),
            is_64: true,
            ..Default::default()
        }
    }

    #[test]
    fn search_order() -> Result<(), LookupError> {
        let f = fixture()?;
        fs::create_dir_all(f.root.join("user"))?;
        fs::write(f.root.join("user").join("mine.dll"), b"MZ")?;
        let lp = LookupPath::new(query(&f, Some(f.system.clone())))?;
        let root = root_image(&f);

        let r = lp.resolve(&root, "KERNEL32.DLL");
        assert_eq!(r.strategy, SearchStrategy::WellKnownDll);
        assert_eq!(r.path, Some(f.system.sys_dir.join("kernel32.dll")));

        let r = lp.resolve(&root, "shared.dll");
        assert_eq!(r.strategy, SearchStrategy::ApplicationDirectory);
        assert_eq!(r.path, Some(f.app_dir.join("Shared.dll")));

        assert_eq!(
            lp.resolve(&root, "SYS.dll"),
            ResolvedModule::new(
                SearchStrategy::System32Folder,
                Some(f.system.sys_dir.join("sys.dll"))
            )
        );
        assert_eq!(
            lp.resolve(&root, "win.dll").strategy,
            SearchStrategy::WindowsFolder
        );
        assert_eq!(
            lp.resolve(&root, "mine.dll").strategy,
            SearchStrategy::UserDefined
        );
        assert_eq!(lp.resolve(&root, "nowhere.dll"), ResolvedModule::not_found());
        Ok(())
    }

    #[test]
    fn working_dir_precedence_depends_on_safe_search_mode() -> Result<(), LookupError> {
        let f = fixture()?;
        fs::create_dir_all(f.root.join("work"))?;
        fs::write(f.root.join("work").join("sys.dll"), b"MZ")?;
        let root = root_image(&f);

        let safe = LookupPath::new(query(&f, Some(f.system.clone())))?;
        assert_eq!(
            safe.resolve(&root, "sys.dll").strategy,
            SearchStrategy::System32Folder
        );

        let mut unsafe_system = f.system.clone();
        unsafe_system.safe_dll_search_mode_on = Some(false);
        let unsafe_lp = LookupPath::new(query(&f, Some(unsafe_system)))?;
        assert_eq!(
            unsafe_lp.resolve(&root, "sys.dll").strategy,
            SearchStrategy::WorkingDirectory
        );
        Ok(())
    }

    #[test]
    fn apiset_and_sxs_resolution() -> Result<(), LookupError> {
        let f = fixture()?;
        let mut system = f.system.clone();
        let mut map = ApisetMap::new();
        map.insert("api-ms-win-core-file-l1-2-0", vec!["kernelbase.dll".to_owned()]);
        system.apiset_map = Some(map);
        let lp = LookupPath::new(query(&f, Some(system)))?;

        let mut root = root_image(&f);
        root.manifest = COMCTL_MANIFEST.to_owned();

        assert_eq!(
            lp.resolve(&root, "api-ms-win-core-file-l1-2-1.dll"),
            ResolvedModule::new(
                SearchStrategy::ApiSetSchema,
                Some(f.system.sys_dir.join("kernelbase.dll"))
            )
        );
        // unknown contract: regular lookup
        assert_eq!(
            lp.resolve(&root, "api-ms-win-unknown-l1-1-0.dll").strategy,
            SearchStrategy::NotFound
        );
        assert_eq!(
            lp.resolve(&root, "plugin.dll"),
            ResolvedModule::new(SearchStrategy::SideBySide, Some(f.app_dir.join("Plugin.dll")))
        );
        Ok(())
    }

    #[test]
    fn without_windows_installation() -> Result<(), LookupError> {
        let f = fixture()?;
        let lp = LookupPath::new(query(&f, None))?;
        let root = root_image(&f);
        assert_eq!(
            lp.resolve(&root, "kernel32.dll").strategy,
            SearchStrategy::NotFound
        );
        assert_eq!(
            lp.resolve(&root, "shared.dll").strategy,
            SearchStrategy::ApplicationDirectory
        );

        let full = f.app_dir.join("Plugin.dll");
        assert_eq!(
            lp.resolve(&root, &full.to_string_lossy()),
            ResolvedModule::new(SearchStrategy::Fullpath, Some(full.clone()))
        );
        Ok(())
    }
}
