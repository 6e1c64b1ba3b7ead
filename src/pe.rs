//! Low-level PE file format access through the goblin and pelite libraries
//!
//! The parser extracts everything the analysis needs from an image in one pass and
//! hands out an owned [`PeImage`]; nothing downstream touches raw bytes.

extern crate msvc_demangler;
use crate::apiset::{self, ApisetMap};
use crate::common::LookupError;
use dataview::Pod;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single symbol imported from a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeImport {
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    pub hint: u16,
    pub delay_import: bool,
}

impl PeImport {
    pub fn import_by_ordinal(&self) -> bool {
        self.name.is_none()
    }
}

/// All symbols imported from one module through one import descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeImportDll {
    pub name: String,
    pub delay_import: bool,
    pub imports: Vec<PeImport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeExport {
    pub ordinal: u32,
    pub name: Option<String>,
    pub virtual_address: u32,
    pub forwarded_name: Option<String>,
}

/// Facts extracted from a PE file
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeImage {
    pub path: PathBuf,
    pub is_64: bool,
    /// Normal import descriptors first, then delay-load descriptors
    pub imports: Vec<PeImportDll>,
    pub exports: Vec<PeExport>,
    /// Embedded RT_MANIFEST resource, empty when there is none
    pub manifest: String,
    #[serde(skip)]
    pub apiset: Option<ApisetMap>,
}

impl PeImage {
    /// Names of the imported modules in table order, duplicates kept
    pub fn module_names(&self) -> Vec<String> {
        self.imports.iter().map(|i| i.name.clone()).collect()
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Source of parsed images for the dependency analysis
pub trait ImageParser {
    fn load(&self, path: &Path) -> Result<PeImage, LookupError>;
}

/// Reads PE files from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct PeParser;

impl ImageParser for PeParser {
    fn load(&self, path: &Path) -> Result<PeImage, LookupError> {
        if !path.is_file() {
            return Err(LookupError::InputNotFound(path.to_owned()));
        }
        debug!("loading {}", path.display());
        let content = fs_err::read(path)?;
        parse_image(path, &content)
    }
}

fn not_a_valid_image(path: &Path, reason: impl ToString) -> LookupError {
    LookupError::NotAValidImage {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

/// Parse an in-memory PE file
///
/// goblin validates the file and provides the import directory, pelite the export
/// directory, the delay-load descriptors and the resources.
pub fn parse_image(path: &Path, content: &[u8]) -> Result<PeImage, LookupError> {
    let pe = match goblin::Object::parse(content) {
        Ok(goblin::Object::PE(pe)) => pe,
        Ok(_) => return Err(not_a_valid_image(path, "unexpected executable format")),
        Err(e) => return Err(not_a_valid_image(path, e)),
    };

    let mut imports = read_imports(&pe);
    let mut exports = Vec::new();
    let mut manifest = String::new();
    match pelite::PeFile::from_bytes(content) {
        Ok(file) => {
            let delay_dir = pe
                .header
                .optional_header
                .as_ref()
                .and_then(|oh| oh.data_directories.get_delay_import_descriptor().copied());
            if let Some(dir) = delay_dir {
                match read_delay_imports(file, dir.virtual_address, pe.is_64, pe.image_base) {
                    Ok(delay_imports) => imports.extend(delay_imports),
                    Err(e) => warn!("ignoring delay imports of {}: {}", path.display(), e),
                }
            }
            exports = read_exports(file).unwrap_or_else(|e| {
                warn!("ignoring exports of {}: {}", path.display(), e);
                Vec::new()
            });
            manifest = read_manifest(file);
        }
        Err(e) => warn!("{} only partially readable: {}", path.display(), e),
    }

    let apiset = pe
        .sections
        .iter()
        .find(|s| s.name().map(|n| n == ".apiset").unwrap_or(false))
        .and_then(|s| {
            let start = s.pointer_to_raw_data as usize;
            content.get(start..start + s.size_of_raw_data as usize)
        })
        .and_then(|bytes| match apiset::parse_schema(bytes) {
            Ok(map) => Some(map),
            Err(e) => {
                warn!("ignoring API set schema in {}: {}", path.display(), e);
                None
            }
        });

    Ok(PeImage {
        path: path.to_owned(),
        is_64: pe.is_64,
        imports,
        exports,
        manifest,
        apiset,
    })
}

/// One group per import descriptor, in table order
fn read_imports(pe: &goblin::pe::PE) -> Vec<PeImportDll> {
    use goblin::pe::import::SyntheticImportLookupTableEntry::{HintNameTableRVA, OrdinalNumber};
    pe.import_data
        .iter()
        .flat_map(|data| data.import_data.iter())
        .map(|entry| PeImportDll {
            name: entry.name.to_owned(),
            delay_import: false,
            imports: entry
                .import_lookup_table
                .iter()
                .flatten()
                .map(|symbol| match symbol {
                    OrdinalNumber(ordinal) => PeImport {
                        name: None,
                        ordinal: Some(*ordinal),
                        hint: 0,
                        delay_import: false,
                    },
                    HintNameTableRVA((_, hint_name)) => PeImport {
                        name: Some(hint_name.name.to_owned()),
                        ordinal: None,
                        hint: hint_name.hint,
                        delay_import: false,
                    },
                })
                .collect(),
        })
        .collect()
}

/// `ImgDelayDescr` from delayimp.h
#[derive(Copy, Clone, Debug, Pod)]
#[repr(C)]
struct DelayLoadDescriptor {
    attributes: u32,
    dll_name: u32,
    module_handle: u32,
    import_address_table: u32,
    import_name_table: u32,
    bound_import_address_table: u32,
    unload_information_table: u32,
    time_date_stamp: u32,
}

// descriptors without it (pre-VC7) hold virtual addresses instead of RVAs
const DELAY_ATTRIBUTE_RVA: u32 = 1;

/// Walk the delay-load descriptors, which neither goblin nor pelite decode
fn read_delay_imports(
    file: pelite::PeFile,
    directory: u32,
    is_64: bool,
    image_base: u64,
) -> Result<Vec<PeImportDll>, LookupError> {
    let mut ret = Vec::new();
    let mut at = directory;
    loop {
        let desc: DelayLoadDescriptor = file.derva_copy(at)?;
        if desc.dll_name == 0 {
            break;
        }
        let bias = if desc.attributes & DELAY_ATTRIBUTE_RVA == 0 {
            image_base
        } else {
            0
        };
        let to_rva = |v: u64| v.wrapping_sub(bias) as u32;
        let thunks: Vec<u64> = if is_64 {
            file.derva_slice_s::<u64>(to_rva(desc.import_name_table.into()), 0)?
                .to_vec()
        } else {
            file.derva_slice_s::<u32>(to_rva(desc.import_name_table.into()), 0)?
                .iter()
                .map(|&t| u64::from(t))
                .collect()
        };
        let ordinal_flag = if is_64 { 1u64 << 63 } else { 1u64 << 31 };
        let imports = thunks
            .into_iter()
            .map(|thunk| -> Result<PeImport, LookupError> {
                if thunk & ordinal_flag != 0 {
                    return Ok(PeImport {
                        name: None,
                        ordinal: Some((thunk & 0xffff) as u16),
                        hint: 0,
                        delay_import: true,
                    });
                }
                let hint_name = to_rva(thunk);
                Ok(PeImport {
                    name: Some(file.derva_c_str(hint_name.wrapping_add(2))?.to_string()),
                    ordinal: None,
                    hint: file.derva_copy::<u16>(hint_name)?,
                    delay_import: true,
                })
            })
            .collect::<Result<Vec<PeImport>, LookupError>>()?;

        ret.push(PeImportDll {
            name: file
                .derva_c_str(to_rva(desc.dll_name.into()))?
                .to_string(),
            delay_import: true,
            imports,
        });
        at = at.wrapping_add(std::mem::size_of::<DelayLoadDescriptor>() as u32);
    }
    Ok(ret)
}

/// Every entry of the export address table, with the names pointing at it
fn read_exports(file: pelite::PeFile) -> Result<Vec<PeExport>, LookupError> {
    let exports = match file.exports() {
        Ok(exports) => exports,
        // there is no export directory, e.g. in case of an executable
        Err(pelite::Error::Null) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let by = exports.by()?;

    let mut names: HashMap<usize, String> = HashMap::new();
    for (name, index) in by.iter_name_indices() {
        names.entry(index).or_insert(name?.to_string());
    }

    let base = u32::from(by.ordinal_base());
    let mut ret = Vec::new();
    for (index, &rva) in by.functions().iter().enumerate() {
        let export = match by.index(index) {
            Ok(export) => export,
            // unused slot of the address table
            Err(pelite::Error::Null) => continue,
            Err(e) => return Err(e.into()),
        };
        ret.push(PeExport {
            ordinal: base + index as u32,
            name: names.remove(&index),
            virtual_address: rva,
            forwarded_name: export.forward().map(|f| f.to_string()),
        });
    }
    Ok(ret)
}

fn read_manifest(file: pelite::PeFile) -> String {
    file.resources()
        .ok()
        .and_then(|res| res.manifest().ok())
        .map(|m| m.trim_start_matches('\u{feff}').to_owned())
        .unwrap_or_default()
}

/// Get a humanly-readable version of the (imported or exported) symbol
pub fn demangle_symbol(symbol: &str) -> Result<String, LookupError> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags)
        .map_err(|_| LookupError::ScanError(format!("could not demangle {symbol}")))
}
