//! Embedded application manifests and the side-by-side assemblies they declare

use crate::common::{module_key, path_to_string, LookupError};
use crate::pe::PeImage;
use crate::system::WindowsSystem;
use fs_err as fs;
use serde::Serialize;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use tracing::{debug, trace};

/// Placeholder path component marking an assembly that could not be located
pub const UNRESOLVED_MARKER: &str = "???";

/// `<assemblyIdentity>` of a dependent assembly
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: Option<String>,
    pub processor_architecture: Option<String>,
    pub public_key_token: Option<String>,
    pub language: Option<String>,
}

impl AssemblyIdentity {
    fn from_node(n: &roxmltree::Node) -> Option<Self> {
        Some(Self {
            name: n.attribute("name")?.to_owned(),
            version: n.attribute("version").map(str::to_owned),
            processor_architecture: n.attribute("processorArchitecture").map(str::to_owned),
            public_key_token: n.attribute("publicKeyToken").map(str::to_owned),
            language: n.attribute("language").map(str::to_owned),
        })
    }

    /// Glob matching the assembly's folder in the WinSxS store
    /// (`<arch>_<name>_<token>_<version>_<language>_<hash>`)
    fn winsxs_pattern(&self, default_arch: &str) -> String {
        let component = |v: Option<&String>| match v.map(String::as_str) {
            None | Some("*") => "*".to_owned(),
            Some(v) => glob::Pattern::escape(v),
        };
        let arch = match self.processor_architecture.as_deref() {
            None | Some("*") => default_arch.to_owned(),
            Some(a) => glob::Pattern::escape(a),
        };
        format!(
            "{}_{}_{}_{}_*",
            arch,
            glob::Pattern::escape(&self.name),
            component(self.public_key_token.as_ref()),
            component(self.version.as_ref()),
        )
    }
}

/// The parts of a manifest relevant to DLL lookup
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct Manifest {
    /// `<file name="...">` entries, shipped next to the executable
    pub files: Vec<String>,
    pub dependencies: Vec<AssemblyIdentity>,
}

pub fn parse_manifest(text: &str) -> Result<Manifest, LookupError> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();
    if !root.has_tag_name("assembly") {
        return Err(LookupError::ManifestParseError(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }

    let files = root
        .descendants()
        .filter(|n| n.has_tag_name("file"))
        .filter_map(|n| n.attribute("name"))
        .map(str::to_owned)
        .collect();
    let dependencies = root
        .descendants()
        .filter(|n| n.has_tag_name("dependentAssembly"))
        .filter_map(|n| n.children().find(|c| c.has_tag_name("assemblyIdentity")))
        .filter_map(|n| AssemblyIdentity::from_node(&n))
        .collect();

    Ok(Manifest {
        files,
        dependencies,
    })
}

/// A module provided through the manifest of the root executable
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SxsEntry {
    pub name: String,
    pub path: PathBuf,
}

impl SxsEntry {
    pub fn is_found(&self) -> bool {
        !path_to_string(&self.path).contains(UNRESOLVED_MARKER)
    }

    fn unresolved(name: &str, folder: &Path) -> Self {
        Self {
            name: name.to_owned(),
            path: folder.join(UNRESOLVED_MARKER).join(name),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SxsEntries {
    entries: Vec<SxsEntry>,
}

impl SxsEntries {
    /// Collect the side-by-side modules declared by the manifest embedded in `image`
    ///
    /// An image without a (well-formed) manifest has no entries.
    pub fn from_image(image: &PeImage, system: Option<&WindowsSystem>) -> Self {
        if image.manifest.is_empty() {
            return Self::default();
        }
        let manifest = match parse_manifest(&image.manifest) {
            Ok(m) => m,
            Err(e) => {
                debug!("ignoring malformed manifest of {:?}: {}", image.path, e);
                return Self::default();
            }
        };

        let app_dir = image.path.parent().unwrap_or_else(|| Path::new(""));
        let mut entries: Vec<SxsEntry> = manifest
            .files
            .iter()
            .map(|f| {
                let p = app_dir.join(f);
                if p.is_file() {
                    SxsEntry {
                        name: f.clone(),
                        path: p,
                    }
                } else {
                    SxsEntry::unresolved(f, app_dir)
                }
            })
            .collect();

        let default_arch = if image.is_64 { "amd64" } else { "x86" };
        for identity in &manifest.dependencies {
            let private = app_dir.join(&identity.name);
            let found = if private.is_dir() {
                dlls_in_folder(&private)
            } else if let Some(system) = system {
                search_winsxs(identity, default_arch, &system.winsxs_dir())
            } else {
                Vec::new()
            };
            if found.is_empty() {
                let store = system
                    .map(WindowsSystem::winsxs_dir)
                    .unwrap_or_else(|| app_dir.to_owned());
                entries.push(SxsEntry::unresolved(&identity.name, &store));
            } else {
                entries.extend(found);
            }
        }
        Self { entries }
    }

    /// First located entry providing the given module
    pub fn get(&self, library: &str) -> Option<&SxsEntry> {
        let key = module_key(library);
        self.entries
            .iter()
            .find(|e| e.is_found() && module_key(&e.name) == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SxsEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn search_winsxs(identity: &AssemblyIdentity, default_arch: &str, winsxs: &Path) -> Vec<SxsEntry> {
    let pattern = format!(
        "{}{}{}",
        glob::Pattern::escape(&path_to_string(winsxs)),
        MAIN_SEPARATOR,
        identity.winsxs_pattern(default_arch)
    );
    let options = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    trace!("looking up {} with {}", identity.name, pattern);
    let mut folders: Vec<PathBuf> = match glob::glob_with(&pattern, options) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_dir()).collect(),
        Err(e) => {
            debug!("bad WinSxS pattern {}: {}", pattern, e);
            Vec::new()
        }
    };
    // highest version wins
    folders.sort_by(|a, b| {
        folder_version(a)
            .cmp(&folder_version(b))
            .then_with(|| a.cmp(b))
    });
    folders
        .last()
        .map(|folder| dlls_in_folder(folder))
        .unwrap_or_default()
}

/// Dotted version of a WinSxS folder (`..._<version>_<language>_<hash>`), compared numerically
fn folder_version(folder: &Path) -> Vec<u32> {
    folder
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit('_').nth(2))
        .map(|v| v.split('.').map(|c| c.parse().unwrap_or(0)).collect())
        .unwrap_or_default()
}

fn dlls_in_folder(folder: &Path) -> Vec<SxsEntry> {
    let mut ret: Vec<SxsEntry> = match fs::read_dir(folder) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("dll"))
                    .unwrap_or(false)
            })
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_owned();
                Some(SxsEntry { name, path: p })
            })
            .collect(),
        Err(e) => {
            debug!("could not list {}: {}", folder.display(), e);
            Vec::new()
        }
    };
    ret.sort_by_key(|e| module_key(&e.name));
    ret
}
