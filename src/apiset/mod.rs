/*!
API set schema decoding

Fun with MS Api Set Schemas

Resources:

* https://ofekshilon.com/2016/03/27/on-api-ms-win-xxxxx-dll-and-other-dependency-walker-glitches/
* https://blog.quarkslab.com/runtime-dll-name-resolution-apisetschema-part-i.html
* https://blog.quarkslab.com/runtime-dll-name-resolution-apisetschema-part-ii.html
* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm

 */

mod schema;

use crate::common::LookupError;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

pub use schema::parse_schema;

/// Map from API set name (lowercase, without extension) to its host modules
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ApisetMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl ApisetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, hosts: Vec<String>) {
        self.entries
            .insert(name.trim_end_matches(".dll").to_ascii_lowercase(), hosts);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }

    /// Find the hosts an imported API set name is redirected to
    ///
    /// The last revision number is not part of the match, as the loader
    /// compares only the hashed part of the name.
    pub fn get(&self, library: &str) -> Option<&Vec<String>> {
        let lower = library.to_ascii_lowercase();
        let name = lower.trim_end_matches(".dll");
        if let Some(hosts) = self.entries.get(name) {
            return Some(hosts);
        }
        let hashed = hashed_name(name);
        self.entries
            .iter()
            .find(|(k, _)| hashed_name(k) == hashed)
            .map(|(_, v)| v)
    }

}

fn hashed_name(name: &str) -> &str {
    name.rfind('-').map(|i| &name[..i]).unwrap_or(name)
}

/// Pattern of the names following the API set naming convention (api-/ext- contracts)
pub fn apiset_name_pattern() -> Result<Regex, LookupError> {
    Ok(Regex::new(
        r"(?i)^(api|ext)-[a-z0-9-]+-l\d+-\d+-\d+(\.dll)?$",
    )?)
}

/// Read the schema embedded in the `.apiset` section of a PE file (typically apisetschema.dll)
pub fn parse_apiset<P: AsRef<Path>>(apisetschema_path: P) -> Result<ApisetMap, LookupError> {
    let filemap = pelite::FileMap::open(apisetschema_path.as_ref())?;
    let pefile = pelite::PeFile::from_bytes(&filemap)?;
    if let Some(section) = pefile.section_headers().by_name(".apiset") {
        parse_schema(pefile.get_section_bytes(section)?)
    } else {
        Err(LookupError::ApisetError(format!(
            "no .apiset section in {:?}",
            apisetschema_path.as_ref()
        )))
    }
}
