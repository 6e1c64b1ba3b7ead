//! Utilities to read the list of known DLLs of the running Windows installation

extern crate ntapi;
extern crate winapi;

use crate::common::LookupError;
use ntapi::ntobapi::{
    NtClose, NtOpenDirectoryObject, NtQueryDirectoryObject, DIRECTORY_QUERY,
    OBJECT_DIRECTORY_INFORMATION,
};
use std::mem::size_of;
use std::ptr::null_mut;
use winapi::shared::ntdef::{
    FALSE, HANDLE, NTSTATUS, NT_SUCCESS, OBJECT_ATTRIBUTES, TRUE, ULONG, UNICODE_STRING, USHORT,
    WCHAR,
};
use winapi::shared::ntstatus::{STATUS_MORE_ENTRIES, STATUS_NO_MORE_ENTRIES};

fn unicode_to_string(s: &UNICODE_STRING) -> String {
    if s.Buffer.is_null() {
        return String::new();
    }
    let units = unsafe { std::slice::from_raw_parts(s.Buffer, s.Length as usize / 2) };
    String::from_utf16_lossy(units)
}

fn nt_error(directory: &str, status: NTSTATUS) -> LookupError {
    LookupError::ScanError(format!(
        "could not enumerate {directory} (NTSTATUS {:#x})",
        status as u32
    ))
}

// according to https://lucasg.github.io/2017/06/07/listing-known-dlls/,
// in contrast to reading the HKEY_LOCAL_MACHINE\SYSTEM\CurrentControlSet\Control\Session Manager\KnownDLLs key,
// listing \KnownDlls gives us the entire list of DLLs, so we don't need to look up the dependencies of each DLL

/// Returns the complete list of KnownDlls in the given object directory
/// (`\KnownDlls` for native modules, `\KnownDlls32` for WOW64 ones)
///
/// These DLLs are mapped into each process' memory as
/// copy-on-write for performance (and a sprinkle of security) reasons.
///
/// They are all located in the system directory and can't be overridden/hijacked.
pub fn get_known_dlls(directory: &str) -> Result<Vec<String>, LookupError> {
    let mut name: Vec<WCHAR> = directory.encode_utf16().collect();
    let byte_len = (name.len() * size_of::<WCHAR>()) as USHORT;
    let mut object_name = UNICODE_STRING {
        Length: byte_len,
        MaximumLength: byte_len,
        Buffer: name.as_mut_ptr(),
    };
    let mut oa = OBJECT_ATTRIBUTES {
        Length: size_of::<OBJECT_ATTRIBUTES>() as ULONG,
        RootDirectory: null_mut(),
        ObjectName: &mut object_name,
        Attributes: 0,
        SecurityDescriptor: null_mut(),
        SecurityQualityOfService: null_mut(),
    };

    let mut handle: HANDLE = null_mut();
    let status = unsafe { NtOpenDirectoryObject(&mut handle, DIRECTORY_QUERY, &mut oa) };
    if !NT_SUCCESS(status) {
        return Err(nt_error(directory, status));
    }

    let mut ret = Vec::new();
    let mut context: ULONG = 0;
    let mut restart_scan = TRUE;
    // u64 storage keeps the entries pointer-aligned
    let mut buffer: Vec<u64> = vec![0; 0x800];
    loop {
        buffer.iter_mut().for_each(|w| *w = 0);
        let mut return_length: ULONG = 0;
        let status = unsafe {
            NtQueryDirectoryObject(
                handle,
                buffer.as_mut_ptr() as *mut _,
                (buffer.len() * size_of::<u64>()) as ULONG,
                FALSE,
                restart_scan,
                &mut context,
                &mut return_length,
            )
        };
        if status == STATUS_NO_MORE_ENTRIES {
            break;
        }
        if !NT_SUCCESS(status) {
            unsafe { NtClose(handle) };
            return Err(nt_error(directory, status));
        }

        // the array of entries is terminated by a zeroed one
        let entries = buffer.as_ptr() as *const OBJECT_DIRECTORY_INFORMATION;
        for i in 0.. {
            let info = unsafe { &*entries.add(i) };
            if info.Name.Buffer.is_null() {
                break;
            }
            if unicode_to_string(&info.TypeName) == "Section" {
                ret.push(unicode_to_string(&info.Name));
            }
        }

        if status != STATUS_MORE_ENTRIES {
            break;
        }
        restart_scan = FALSE;
    }
    unsafe { NtClose(handle) };

    ret.sort_by_key(|n| n.to_ascii_lowercase());
    Ok(ret)
}
