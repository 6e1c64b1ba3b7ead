#[cfg(windows)]
extern crate winapi;
use crate::apiset::{self, ApisetMap};
use crate::common::{module_key, LookupError};
#[cfg(windows)]
use crate::knowndlls;
use fs_err as fs;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// KnownDLLs of a stock Windows 10 installation, used when the live list can't be read
///
/// This is the registry list plus the modules it pulls in, which is what the
/// `\KnownDlls` object directory holds at runtime.
pub const DEFAULT_KNOWN_DLLS: &[&str] = &[
    "advapi32.dll",
    "bcrypt.dll",
    "bcryptPrimitives.dll",
    "cfgmgr32.dll",
    "clbcatq.dll",
    "combase.dll",
    "COMDLG32.dll",
    "coml2.dll",
    "difxapi.dll",
    "gdi32.dll",
    "gdi32full.dll",
    "gdiplus.dll",
    "IMAGEHLP.dll",
    "IMM32.dll",
    "kernel.appcore.dll",
    "kernel32.dll",
    "KERNELBASE.dll",
    "MSCTF.dll",
    "msvcp_win.dll",
    "MSVCRT.dll",
    "NORMALIZ.dll",
    "NSI.dll",
    "ntdll.dll",
    "ole32.dll",
    "OLEAUT32.dll",
    "PSAPI.DLL",
    "rpcrt4.dll",
    "sechost.dll",
    "Setupapi.dll",
    "SHCORE.dll",
    "SHELL32.dll",
    "SHLWAPI.dll",
    "ucrtbase.dll",
    "user32.dll",
    "win32u.dll",
    "WINTRUST.dll",
    "WLDAP32.dll",
    "wow64.dll",
    "wow64cpu.dll",
    "wow64win.dll",
    "WS2_32.dll",
];

/// List of DLLs provided by the operating system and hardcoded into the loader
/// If a DLL with this name is required, the OS will not perform any further lookup but load the
/// copy distributed with Windows
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct KnownDLLList {
    /// lowercase name => full path in the system directory
    pub entries: BTreeMap<String, PathBuf>,
}

impl KnownDLLList {
    pub fn new<S: AsRef<str>>(names: &[S], folder: &Path) -> Self {
        Self {
            entries: names
                .iter()
                .map(|n| (module_key(n.as_ref()), folder.join(n.as_ref())))
                .collect(),
        }
    }

    /// look for a DLL by name among the entries
    pub fn search_dll_in_known_dlls(&self, library: &str) -> Option<&PathBuf> {
        self.entries.get(&module_key(library))
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.values()
    }
}

// supported DLL search modes: standard for desktop application, safe or unsafe
// https://docs.microsoft.com/en-us/windows/win32/dlls/dynamic-link-library-search-order#standard-search-order-for-desktop-applications

/// Description of a Windows system
/// If running from within Windows we extract the available information from the environment
/// variables and the Windows API.
/// If running in another OS we can only look at a mounted partition, and can't do anything about the PATH
#[derive(Debug, Clone)]
pub struct WindowsSystem {
    pub safe_dll_search_mode_on: Option<bool>,
    pub apiset_map: Option<ApisetMap>,
    pub known_dlls: Option<KnownDLLList>,
    pub known_dlls_wow64: Option<KnownDLLList>,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
    pub wow64_dir: PathBuf,
    pub system_path: Option<Vec<PathBuf>>,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;
        let wow64_dir = win_dir.join("SysWOW64");
        let apiset_map = match apiset::parse_apiset(sys_dir.join("apisetschema.dll")) {
            Ok(apiset) => Some(apiset),
            Err(e) => {
                debug!("API set schema not available: {}", e);
                None
            }
        };

        let system_path = std::env::var("PATH").ok().map(|s| {
            s.split(';')
                .filter(|e| !e.is_empty())
                .filter_map(|e| fs::canonicalize(e).ok())
                .collect()
        });

        let live_or_default = |directory: &str, folder: &Path| {
            let names = knowndlls::get_known_dlls(directory).unwrap_or_else(|e| {
                debug!("falling back to the default KnownDLLs list: {}", e);
                DEFAULT_KNOWN_DLLS.iter().map(|s| s.to_string()).collect()
            });
            KnownDLLList::new(names.as_slice(), folder)
        };

        Ok(Self {
            safe_dll_search_mode_on: None,
            apiset_map,
            known_dlls: Some(live_or_default(r"\KnownDlls", &sys_dir)),
            known_dlls_wow64: Some(live_or_default(r"\KnownDlls32", &wow64_dir)),
            win_dir,
            sys_dir,
            wow64_dir,
            system_path,
        })
    }

    /// Collect information about the Windows operating system installed on the partition the target
    /// executable lies into
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Option<Self> {
        let root = Self::find_root(&p)?;
        Self::from_root(root)
    }

    /// Try finding a Windows installation along the path to the target executable
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find(|a| Self::system_folders(a).is_some())
            .map(Path::to_owned)
    }

    /// Windows and System32 directories under a partition root, if present
    fn system_folders<P: AsRef<Path>>(root_path: P) -> Option<(PathBuf, PathBuf)> {
        let win_dir = find_child_case_insensitive(root_path.as_ref(), "Windows")?;
        let sys_dir = find_child_case_insensitive(&win_dir, "System32")?;
        Some((win_dir, sys_dir))
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let (win_dir, sys_dir) = Self::system_folders(&root_path)?;
        let wow64_dir =
            find_child_case_insensitive(&win_dir, "SysWOW64").unwrap_or_else(|| win_dir.join("SysWOW64"));
        let apiset_map = find_child_case_insensitive(&sys_dir, "apisetschema.dll")
            .map(apiset::parse_apiset)
            .and_then(|r| match r {
                Ok(map) => Some(map),
                Err(e) => {
                    debug!("API set schema not available: {}", e);
                    None
                }
            });
        debug!("using Windows installation at {}", win_dir.display());
        Some(Self {
            safe_dll_search_mode_on: None,
            apiset_map,
            known_dlls: Some(KnownDLLList::new(DEFAULT_KNOWN_DLLS, &sys_dir)),
            known_dlls_wow64: Some(KnownDLLList::new(DEFAULT_KNOWN_DLLS, &wow64_dir)),
            win_dir,
            sys_dir,
            wow64_dir,
            system_path: None,
        })
    }

    pub fn winsxs_dir(&self) -> PathBuf {
        find_child_case_insensitive(&self.win_dir, "WinSxS")
            .unwrap_or_else(|| self.win_dir.join("WinSxS"))
    }
}

impl PartialEq for WindowsSystem {
    fn eq(&self, other: &Self) -> bool {
        self.sys_dir == other.sys_dir
            && self.win_dir == other.win_dir
            && self.safe_dll_search_mode_on == other.safe_dll_search_mode_on
            && self.known_dlls == other.known_dlls
            && self.system_path == other.system_path
    }
}

/// Find an entry of a directory, ignoring case (mounted NTFS partitions keep the original case)
fn find_child_case_insensitive(parent: &Path, name: &str) -> Option<PathBuf> {
    let exact = parent.join(name);
    if exact.exists() {
        return Some(exact);
    }
    let key = module_key(name);
    fs::read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|s| module_key(s) == key)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
#[derive(Debug, Default)]
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, OsString>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Full path of `filename` inside `folder`, matched without regard to case
    ///
    /// Unreadable or missing folders behave as empty ones.
    pub(crate) fn test_file_in_folder_case_insensitive<Q: AsRef<Path>>(
        &mut self,
        filename: &str,
        folder: Q,
    ) -> Option<PathBuf> {
        let folder = folder.as_ref();
        let dir = self
            .files_in_dirs
            .entry(folder.to_owned())
            .or_insert_with(|| scan_folder(folder));
        dir.get(&module_key(filename)).map(|f| folder.join(f))
    }
}

fn scan_folder(folder: &Path) -> HashMap<String, OsString> {
    match fs::read_dir(folder) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.metadata().map(|m| m.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str().map(|s| (module_key(s), name.clone()))
            })
            .collect(),
        Err(e) => {
            trace!("skipping unreadable folder {}: {}", folder.display(), e);
            HashMap::new()
        }
    }
}
