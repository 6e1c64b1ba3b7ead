//! Report modes that don't need the dependency graph
//!
//! Every report is a plain serializable value; the `write_*` functions render the
//! human readable form.

use crate::apiset::ApisetMap;
use crate::common::display_path;
use crate::manifest::{parse_manifest, Manifest, SxsEntries};
use crate::pe::{demangle_symbol, PeExport, PeImage, PeImportDll};
use crate::system::WindowsSystem;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownDllsReport {
    pub x64: Vec<PathBuf>,
    pub x86: Vec<PathBuf>,
}

impl KnownDllsReport {
    pub fn from_system(system: &WindowsSystem) -> Self {
        let paths = |list: Option<&crate::system::KnownDLLList>| {
            list.map(|l| l.paths().cloned().collect())
                .unwrap_or_default()
        };
        Self {
            x64: paths(system.known_dlls.as_ref()),
            x86: paths(system.known_dlls_wow64.as_ref()),
        }
    }
}

pub fn write_known_dlls<W: Write>(out: &mut W, report: &KnownDllsReport) -> io::Result<()> {
    for (bits, list) in [("64", &report.x64), ("32", &report.x86)] {
        writeln!(out, "[-] {bits}-bit KnownDlls :")?;
        for p in list {
            writeln!(out, "  {}", display_path(Some(p)))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApisetsReport {
    /// file the schema was read from
    pub source: Option<PathBuf>,
    pub schema: ApisetMap,
}

pub fn write_apisets<W: Write>(out: &mut W, report: &ApisetsReport) -> io::Result<()> {
    writeln!(out, "[-] Api Sets Map :")?;
    for (name, hosts) in report.schema.iter() {
        writeln!(out, "{} -> [ {} ]", name, hosts.join(","))?;
    }
    writeln!(out)
}

/// Manifest embedded in an image; a malformed one is kept verbatim along with the error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestReport {
    pub path: PathBuf,
    pub manifest: String,
    pub parsed: Option<Manifest>,
    pub parse_error: Option<String>,
}

impl ManifestReport {
    pub fn from_image(image: &PeImage) -> Self {
        let (parsed, parse_error) = if image.manifest.is_empty() {
            (None, None)
        } else {
            match parse_manifest(&image.manifest) {
                Ok(m) => (Some(m), None),
                Err(e) => (None, Some(e.to_string())),
            }
        };
        Self {
            path: image.path.clone(),
            manifest: image.manifest.clone(),
            parsed,
            parse_error,
        }
    }
}

pub fn write_manifest<W: Write>(out: &mut W, report: &ManifestReport) -> io::Result<()> {
    let path = display_path(Some(&report.path));
    writeln!(out, "[-] Manifest for file : {path}")?;
    if report.manifest.is_empty() {
        return writeln!(out, "[x] No embedded pe manifest for file {path}");
    }
    writeln!(out, "{}", report.manifest.trim_end())?;
    if let Some(e) = &report.parse_error {
        writeln!(out, "[x] Exception : {e}")?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SxsReport {
    pub path: PathBuf,
    pub entries: SxsEntries,
}

impl SxsReport {
    pub fn from_image(image: &PeImage, system: Option<&WindowsSystem>) -> Self {
        Self {
            path: image.path.clone(),
            entries: SxsEntries::from_image(image, system),
        }
    }
}

pub fn write_sxs_entries<W: Write>(out: &mut W, report: &SxsReport) -> io::Result<()> {
    writeln!(
        out,
        "[-] sxs dependencies for executable : {}",
        display_path(Some(&report.path))
    )?;
    for e in report.entries.iter() {
        let mark = if e.is_found() { '+' } else { 'x' };
        writeln!(out, "  [{mark}] {} : {}", e.name, display_path(Some(&e.path)))?;
    }
    Ok(())
}

/// MSVC-decorated names are demangled, anything else is kept
fn undecorate(symbol: &str) -> String {
    if symbol.starts_with('?') {
        demangle_symbol(symbol).unwrap_or_else(|_| symbol.to_owned())
    } else {
        symbol.to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportsReport {
    pub path: PathBuf,
    pub imports: Vec<PeImportDll>,
}

impl ImportsReport {
    pub fn from_image(image: &PeImage, undecorate_names: bool) -> Self {
        let mut imports = image.imports.clone();
        if undecorate_names {
            for f in imports.iter_mut().flat_map(|dll| dll.imports.iter_mut()) {
                f.name = f.name.as_deref().map(undecorate);
            }
        }
        Self {
            path: image.path.clone(),
            imports,
        }
    }
}

pub fn write_imports<W: Write>(
    out: &mut W,
    report: &ImportsReport,
    show_functions: bool,
) -> io::Result<()> {
    writeln!(
        out,
        "[-] Import listing for file : {}",
        display_path(Some(&report.path))
    )?;
    for dll in &report.imports {
        writeln!(out, "Import from module {} :", dll.name)?;
        if !show_functions {
            continue;
        }
        for f in &dll.imports {
            match (&f.name, f.ordinal) {
                (Some(name), _) => write!(out, "\t Function {name}")?,
                (None, ordinal) => write!(out, "\t Ordinal_{}", ordinal.unwrap_or_default())?,
            }
            if f.delay_import {
                writeln!(out, " (Delay Import)")?;
            } else {
                writeln!(out)?;
            }
        }
    }
    writeln!(out, "[-] Import listing done")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportsReport {
    pub path: PathBuf,
    pub exports: Vec<PeExport>,
}

impl ExportsReport {
    pub fn from_image(image: &PeImage, undecorate_names: bool) -> Self {
        let mut exports = image.exports.clone();
        if undecorate_names {
            for e in exports.iter_mut() {
                e.name = e.name.as_deref().map(undecorate);
            }
        }
        Self {
            path: image.path.clone(),
            exports,
        }
    }
}

pub fn write_exports<W: Write>(out: &mut W, report: &ExportsReport) -> io::Result<()> {
    writeln!(
        out,
        "[-] Export listing for file : {}",
        display_path(Some(&report.path))
    )?;
    for e in &report.exports {
        writeln!(out, "Export {} :", e.ordinal)?;
        writeln!(out, "\t Name : {}", e.name.as_deref().unwrap_or_default())?;
        writeln!(out, "\t VA : 0x{:X}", e.virtual_address)?;
        if let Some(fwd) = e.forwarded_name.as_deref().filter(|f| !f.is_empty()) {
            writeln!(out, "\t ForwardedName : {fwd}")?;
        }
    }
    writeln!(out, "[-] Export listing done")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LookupError;
    use crate::manifest::tests::COMCTL_MANIFEST;
    use crate::pe::PeImport;
    use crate::system::{KnownDLLList, DEFAULT_KNOWN_DLLS};
    use std::path::Path;

    fn to_string<F>(f: F) -> Result<String, LookupError>
    where
        F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
    {
        let mut out = Vec::new();
        f(&mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn sample_image() -> PeImage {
        let import = |name: Option<&str>, ordinal: Option<u16>, delay_import| PeImport {
            name: name.map(str::to_owned),
            ordinal,
            hint: 0,
            delay_import,
        };
        PeImage {
            path: PathBuf::from("/app/app.exe"),
            is_64: true,
            imports: vec![
                PeImportDll {
                    name: "KERNEL32.dll".to_owned(),
                    delay_import: false,
                    imports: vec![import(Some("CreateFileW"), None, false)],
                },
                PeImportDll {
                    name: "mylib.dll".to_owned(),
                    delay_import: true,
                    imports: vec![
                        import(Some("?world@@YA?AUa@@XZ"), None, true),
                        import(None, Some(7), true),
                    ],
                },
            ],
            exports: vec![
                PeExport {
                    ordinal: 1,
                    name: Some("DoWork".to_owned()),
                    virtual_address: 0x1a2b,
                    forwarded_name: None,
                },
                PeExport {
                    ordinal: 2,
                    name: Some("Forwarded".to_owned()),
                    virtual_address: 0x3000,
                    forwarded_name: Some("NTDLL.RtlFoo".to_owned()),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn import_listing() -> Result<(), LookupError> {
        let report = ImportsReport::from_image(&sample_image(), false);
        let text = to_string(|o| write_imports(o, &report, true))?;
        assert_eq!(
            text,
            "[-] Import listing for file : /app/app.exe\n\
             Import from module KERNEL32.dll :\n\
             \t Function CreateFileW\n\
             Import from module mylib.dll :\n\
             \t Function ?world@@YA?AUa@@XZ (Delay Import)\n\
             \t Ordinal_7 (Delay Import)\n\
             [-] Import listing done\n"
        );

        let modules_only = to_string(|o| write_imports(o, &report, false))?;
        assert!(!modules_only.contains("Function"));

        let undecorated = ImportsReport::from_image(&sample_image(), true);
        let name = undecorated.imports[1].imports[0]
            .name
            .clone()
            .unwrap_or_default();
        assert!(name.contains("world"));
        assert!(!name.starts_with('?'));
        assert_eq!(
            undecorated.imports[0].imports[0].name.as_deref(),
            Some("CreateFileW")
        );
        Ok(())
    }

    #[test]
    fn export_listing() -> Result<(), LookupError> {
        let report = ExportsReport::from_image(&sample_image(), true);
        let text = to_string(|o| write_exports(o, &report))?;
        assert_eq!(
            text,
            "[-] Export listing for file : /app/app.exe\n\
             Export 1 :\n\
             \t Name : DoWork\n\
             \t VA : 0x1A2B\n\
             Export 2 :\n\
             \t Name : Forwarded\n\
             \t VA : 0x3000\n\
             \t ForwardedName : NTDLL.RtlFoo\n\
             [-] Export listing done\n"
        );
        Ok(())
    }

    #[test]
    fn manifest_listing() -> Result<(), LookupError> {
        let mut image = sample_image();
        let text = to_string(|o| write_manifest(o, &ManifestReport::from_image(&image)))?;
        assert!(text.ends_with("[x] No embedded pe manifest for file /app/app.exe\n"));

        image.manifest = COMCTL_MANIFEST.to_owned();
        let report = ManifestReport::from_image(&image);
        assert!(report.parsed.is_some());
        assert!(report.parse_error.is_none());

        image.manifest = "<assembly><file></assembly>".to_owned();
        let report = ManifestReport::from_image(&image);
        assert!(report.parsed.is_none());
        let text = to_string(|o| write_manifest(o, &report))?;
        assert!(text.contains("<assembly><file></assembly>\n[x] Exception : "));
        Ok(())
    }

    #[test]
    fn known_dlls_and_apisets() -> Result<(), LookupError> {
        let d = tempfile::tempdir()?;
        let mut system = crate::system::tests::fake_windows_root(d.path(), &[])?;
        system.known_dlls = Some(KnownDLLList::new(&["kernel32.dll"], Path::new("/w/System32")));
        system.known_dlls_wow64 =
            Some(KnownDLLList::new(DEFAULT_KNOWN_DLLS, Path::new("/w/SysWOW64")));
        let report = KnownDllsReport::from_system(&system);
        assert_eq!(report.x86.len(), DEFAULT_KNOWN_DLLS.len());
        let text = to_string(|o| write_known_dlls(o, &report))?;
        assert!(text.starts_with("[-] 64-bit KnownDlls :\n  /w/System32/kernel32.dll\n\n[-] 32-bit KnownDlls :\n"));

        let mut schema = ApisetMap::new();
        schema.insert(
            "api-ms-win-core-file-l1-2-0",
            vec!["kernel32.dll".to_owned(), "kernelbase.dll".to_owned()],
        );
        schema.insert("ext-ms-win-gdi-draw-l1-1-0", vec![]);
        let text = to_string(|o| {
            write_apisets(
                o,
                &ApisetsReport {
                    source: None,
                    schema,
                },
            )
        })?;
        assert_eq!(
            text,
            "[-] Api Sets Map :\n\
             api-ms-win-core-file-l1-2-0 -> [ kernel32.dll,kernelbase.dll ]\n\
             ext-ms-win-gdi-draw-l1-1-0 -> [  ]\n\n"
        );
        Ok(())
    }

    #[test]
    fn sxs_listing_marks_missing_assemblies() -> Result<(), LookupError> {
        let d = tempfile::tempdir()?;
        let mut image = sample_image();
        image.path = d.path().join("app.exe");
        image.manifest = COMCTL_MANIFEST.to_owned();
        let report = SxsReport::from_image(&image, None);
        let text = to_string(|o| write_sxs_entries(o, &report))?;
        assert!(text.contains("  [x] Plugin.dll : "));
        assert!(text.contains("  [x] Microsoft.Windows.Common-Controls : "));
        assert!(text.contains("???"));
        Ok(())
    }
}
