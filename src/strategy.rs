use serde::Serialize;
use std::fmt;

/// How the loader would locate a module requested by name
///
/// The declaration order is the order used by the flat module listing.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Clone, Copy, Serialize)]
pub enum SearchStrategy {
    /// The analyzed file itself
    Root,
    /// Redirected by the activation context of the root manifest
    SideBySide,
    /// Virtual API set module, forwarded by the loader to its host
    ApiSetSchema,
    /// Among the KnownDLLs, mapped into every process by the OS
    WellKnownDll,
    ApplicationDirectory,
    System32Folder,
    WindowsFolder,
    WorkingDirectory,
    EnvironmentPath,
    AppInitDll,
    /// The import names an absolute path
    Fullpath,
    ManagedAssembly,
    UserDefined,
    NotFound,
}

impl SearchStrategy {
    /// Whether a module found this way is parsed and its own imports followed
    ///
    /// Opaque strategies are handled inside the loader and are never expanded,
    /// even when a file on disk is known for them.
    pub fn is_expandable(self) -> bool {
        match self {
            Self::Root
            | Self::ApplicationDirectory
            | Self::WorkingDirectory
            | Self::EnvironmentPath
            | Self::AppInitDll
            | Self::Fullpath
            | Self::ManagedAssembly
            | Self::UserDefined => true,
            Self::SideBySide
            | Self::ApiSetSchema
            | Self::WellKnownDll
            | Self::System32Folder
            | Self::WindowsFolder
            | Self::NotFound => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Root => "Root",
            Self::SideBySide => "SideBySide",
            Self::ApiSetSchema => "ApiSetSchema",
            Self::WellKnownDll => "WellKnownDll",
            Self::ApplicationDirectory => "ApplicationDirectory",
            Self::System32Folder => "System32Folder",
            Self::WindowsFolder => "WindowsFolder",
            Self::WorkingDirectory => "WorkingDirectory",
            Self::EnvironmentPath => "EnvironmentPath",
            Self::AppInitDll => "AppInitDll",
            Self::Fullpath => "Fullpath",
            Self::ManagedAssembly => "ManagedAssembly",
            Self::UserDefined => "UserDefined",
            Self::NotFound => "NotFound",
        }
    }
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
