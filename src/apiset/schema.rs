//! Windows 10 (version 6) API set namespace layout
//!
//! All offsets are relative to the start of the namespace, string lengths are in bytes.

use super::ApisetMap;
use crate::common::LookupError;
use dataview::{DataView, Pod};

const SUPPORTED_VERSION: u32 = 6;

#[derive(Copy, Clone, Debug, Pod)]
#[repr(C)]
struct Namespace {
    version: u32,
    size: u32,
    flags: u32,
    count: u32,
    entry_offset: u32,
    hash_offset: u32,
    hash_factor: u32,
}

#[derive(Copy, Clone, Debug, Pod)]
#[repr(C)]
struct NamespaceEntry {
    flags: u32,
    name_offset: u32,
    name_length: u32,
    hashed_length: u32,
    value_offset: u32,
    value_count: u32,
}

#[derive(Copy, Clone, Debug, Pod)]
#[repr(C)]
struct ValueEntry {
    flags: u32,
    name_offset: u32,
    name_length: u32,
    value_offset: u32,
    value_length: u32,
}

fn truncated(what: &str, offset: usize) -> LookupError {
    LookupError::ApisetError(format!("truncated {what} at offset {offset:#x}"))
}

fn read_utf16(view: &DataView, offset: u32, length: u32) -> Result<String, LookupError> {
    let units = (0..length as usize / 2)
        .map(|i| {
            let at = offset as usize + 2 * i;
            view.try_read::<u16>(at)
                .ok_or_else(|| truncated("string", at))
        })
        .collect::<Result<Vec<u16>, LookupError>>()?;
    Ok(String::from_utf16_lossy(&units))
}

/// Decode the raw bytes of an `.apiset` section
pub fn parse_schema(bytes: &[u8]) -> Result<ApisetMap, LookupError> {
    let view = DataView::from(bytes);
    let header: Namespace = view
        .try_read(0)
        .ok_or_else(|| truncated("namespace header", 0))?;
    if header.version != SUPPORTED_VERSION {
        return Err(LookupError::ApisetError(format!(
            "unsupported API set schema version {}",
            header.version
        )));
    }

    let mut map = ApisetMap::new();
    for i in 0..header.count as usize {
        let at = header.entry_offset as usize + i * std::mem::size_of::<NamespaceEntry>();
        let entry: NamespaceEntry = view
            .try_read(at)
            .ok_or_else(|| truncated("namespace entry", at))?;
        let name = read_utf16(view, entry.name_offset, entry.name_length)?;

        let max_values = bytes.len() / std::mem::size_of::<ValueEntry>();
        if entry.value_count as usize > max_values {
            return Err(LookupError::ApisetError(format!(
                "entry {name} claims {} values, more than the schema can hold",
                entry.value_count
            )));
        }
        let mut hosts = Vec::new();
        for j in 0..entry.value_count as usize {
            let at = entry.value_offset as usize + j * std::mem::size_of::<ValueEntry>();
            let value: ValueEntry = view
                .try_read(at)
                .ok_or_else(|| truncated("value entry", at))?;
            if value.value_length > 0 {
                hosts.push(read_utf16(view, value.value_offset, value.value_length)?);
            }
        }
        map.insert(&name, hosts);
    }
    Ok(map)
}
