use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// A weight referenced directly by CivitAI download URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CivitaiModel {
    pub url: String,
    #[serde(rename = "dest")]
    pub destination_directory: PathBuf,
    /// Used as the filename when the server does not report one.
    #[serde(rename = "name")]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListSource {
    Wrapped {
        #[serde(rename = "LIST")]
        list: Vec<CivitaiModel>,
    },
    Bare(Vec<CivitaiModel>),
}

pub fn parse_list(source: &str) -> Result<Vec<CivitaiModel>> {
    let parsed: ListSource =
        serde_json::from_str(source).map_err(|err| ProvisionError::Manifest(err.to_string()))?;
    Ok(match parsed {
        ListSource::Wrapped { list } => list,
        ListSource::Bare(list) => list,
    })
}

pub fn load_list(path: &Path) -> Result<Vec<CivitaiModel>> {
    let raw = fs::read_to_string(path).map_err(|err| ProvisionError::io(path, err))?;
    parse_list(&raw)
}
