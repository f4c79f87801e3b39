use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

static GLOBAL: OnceCell<Manifest> = OnceCell::new();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LicenseClass {
    Open,
    NonCommercial,
}

/// One remote source for a weight and the directory it lands in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeightLocation {
    pub url: String,
    #[serde(rename = "dest")]
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl WeightLocation {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            sha256: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WeightEntry {
    pub identifier: String,
    pub locations: Vec<WeightLocation>,
    pub license_class: LicenseClass,
    pub kind: String,
}

impl WeightEntry {
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.license_class == LicenseClass::NonCommercial
    }

    /// Lowercased extension of the identifier, including the leading dot.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.identifier)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LocationSpec {
    One(WeightLocation),
    Many(Vec<WeightLocation>),
}

impl LocationSpec {
    fn into_vec(self) -> Vec<WeightLocation> {
        match self {
            LocationSpec::One(location) => vec![location],
            LocationSpec::Many(locations) => locations,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManifestSource {
    base_url: Option<String>,
    categories: BTreeMap<String, Vec<String>>,
    weights: BTreeMap<String, LocationSpec>,
    non_commercial: Vec<String>,
}

/// Catalog of every known weight. Immutable once built.
#[derive(Debug, Default)]
pub struct Manifest {
    entries: BTreeMap<String, WeightEntry>,
}

impl Manifest {
    pub fn from_json_str(source: &str) -> Result<Self> {
        let source: ManifestSource = serde_json::from_str(source)
            .map_err(|err| ProvisionError::Manifest(err.to_string()))?;
        Self::from_source(source)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| ProvisionError::io(path, err))?;
        Self::from_json_str(&raw)
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = WeightEntry>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.identifier.clone(), entry))
                .collect(),
        }
    }

    fn from_source(source: ManifestSource) -> Result<Self> {
        let restricted: BTreeSet<String> = source.non_commercial.into_iter().collect();
        let license_for = |identifier: &str| {
            if restricted.contains(identifier) {
                LicenseClass::NonCommercial
            } else {
                LicenseClass::Open
            }
        };

        let mut entries = BTreeMap::new();

        if !source.categories.is_empty() {
            let base_url = source.base_url.as_deref().ok_or_else(|| {
                ProvisionError::Manifest("categories require a base_url".into())
            })?;
            let base_url = base_url.trim_end_matches('/');
            for (category, identifiers) in &source.categories {
                let folder = category.to_ascii_lowercase();
                for identifier in identifiers {
                    let location = WeightLocation::new(
                        format!("{base_url}/{folder}/{identifier}.tar"),
                        folder.clone(),
                    );
                    entries.insert(
                        identifier.clone(),
                        WeightEntry {
                            identifier: identifier.clone(),
                            locations: vec![location],
                            license_class: license_for(identifier),
                            kind: category.to_ascii_uppercase(),
                        },
                    );
                }
            }
        }

        for (identifier, spec) in source.weights {
            let locations = spec.into_vec();
            let Some(first) = locations.first() else {
                return Err(ProvisionError::Manifest(format!(
                    "{identifier} has no download locations"
                )));
            };
            let kind = entries
                .get(&identifier)
                .map(|existing: &WeightEntry| existing.kind.clone())
                .unwrap_or_else(|| kind_from_destination(&first.destination));
            entries.insert(
                identifier.clone(),
                WeightEntry {
                    license_class: license_for(&identifier),
                    identifier,
                    locations,
                    kind,
                },
            );
        }

        Ok(Self { entries })
    }

    /// Makes this manifest the process-wide instance. Fails with the
    /// rejected manifest if one was already installed.
    pub fn install(self) -> std::result::Result<&'static Manifest, Manifest> {
        GLOBAL.try_insert(self).map_err(|(_, rejected)| rejected)
    }

    pub fn global() -> Option<&'static Manifest> {
        GLOBAL.get()
    }

    pub fn lookup(&self, identifier: &str) -> Option<&WeightEntry> {
        self.entries.get(identifier)
    }

    /// Entries of one kind. A tag starting with `.` selects by identifier
    /// extension instead of manifest category.
    pub fn entries_by_type(&self, type_tag: &str) -> Vec<&WeightEntry> {
        if type_tag.starts_with('.') {
            let wanted = type_tag.to_ascii_lowercase();
            return self
                .entries
                .values()
                .filter(|entry| entry.extension().as_deref() == Some(wanted.as_str()))
                .collect();
        }
        self.entries
            .values()
            .filter(|entry| entry.kind.eq_ignore_ascii_case(type_tag))
            .collect()
    }

    pub fn is_restricted(&self, identifier: &str) -> bool {
        self.lookup(identifier)
            .map(WeightEntry::is_restricted)
            .unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = &WeightEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn kind_from_destination(destination: &Path) -> String {
    destination
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_ascii_uppercase)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"{
        "base_url": "https://weights.example/comfy-ui/",
        "categories": {
            "CHECKPOINTS": ["sd_xl_base_1.0.safetensors"],
            "EMBEDDINGS": ["easynegative.safetensors"]
        },
        "weights": {
            "vae.safetensors": { "url": "https://example/vae.tar", "dest": "/models/vae" },
            "clip_pair": [
                { "url": "https://example/model.tar", "dest": "ComfyUI/models/clip_vision" },
                { "url": "https://example/config.tar", "dest": "ComfyUI/models/clip_vision" }
            ],
            "loras/style.safetensors": { "url": "https://example/style.tar", "dest": "ComfyUI/models/loras" }
        },
        "non_commercial": ["clip_pair", "not-in-catalog"]
    }"#;

    #[test]
    fn category_entries_expand_to_tar_urls() {
        let manifest = Manifest::from_json_str(SOURCE).unwrap();
        let entry = manifest.lookup("sd_xl_base_1.0.safetensors").unwrap();
        assert_eq!(
            entry.locations,
            vec![WeightLocation::new(
                "https://weights.example/comfy-ui/checkpoints/sd_xl_base_1.0.safetensors.tar",
                "checkpoints",
            )]
        );
        assert_eq!(entry.kind, "CHECKPOINTS");
    }

    #[test]
    fn single_and_list_locations_both_parse() {
        let manifest = Manifest::from_json_str(SOURCE).unwrap();
        assert_eq!(manifest.lookup("vae.safetensors").unwrap().locations.len(), 1);
        let pair = manifest.lookup("clip_pair").unwrap();
        assert_eq!(pair.locations.len(), 2);
        assert_eq!(pair.locations[1].url, "https://example/config.tar");
        assert_eq!(pair.kind, "CLIP_VISION");
    }

    #[test]
    fn restricted_flags_follow_non_commercial_list() {
        let manifest = Manifest::from_json_str(SOURCE).unwrap();
        assert!(manifest.is_restricted("clip_pair"));
        assert!(!manifest.is_restricted("vae.safetensors"));
        assert!(!manifest.is_restricted("not-in-catalog"));
        assert!(manifest.lookup("not-in-catalog").is_none());
    }

    #[test]
    fn entries_by_type_matches_category_or_extension() {
        let manifest = Manifest::from_json_str(SOURCE).unwrap();
        let loras: Vec<_> = manifest
            .entries_by_type("loras")
            .into_iter()
            .map(|entry| entry.identifier.as_str())
            .collect();
        assert_eq!(loras, vec!["loras/style.safetensors"]);

        let safetensors = manifest.entries_by_type(".SAFETENSORS");
        assert_eq!(safetensors.len(), 4);
        assert!(manifest.entries_by_type("UPSCALE_MODELS").is_empty());
    }

    #[test]
    fn explicit_weights_override_category_entries() {
        let manifest = Manifest::from_json_str(
            r#"{
                "base_url": "https://weights.example",
                "categories": { "VAE": ["vae.safetensors"] },
                "weights": { "vae.safetensors": { "url": "https://mirror/vae.tar", "dest": "/models/vae" } }
            }"#,
        )
        .unwrap();
        let entry = manifest.lookup("vae.safetensors").unwrap();
        assert_eq!(entry.locations[0].url, "https://mirror/vae.tar");
        assert_eq!(entry.kind, "VAE");
    }

    #[test]
    fn categories_without_base_url_are_rejected() {
        let err = Manifest::from_json_str(r#"{ "categories": { "VAE": ["a.pt"] } }"#).unwrap_err();
        assert!(matches!(err, ProvisionError::Manifest(_)));
    }

    #[test]
    fn global_manifest_installs_once() {
        let installed = Manifest::from_json_str(SOURCE).unwrap().install().unwrap();
        assert!(std::ptr::eq(installed, Manifest::global().unwrap()));
        let rejected = Manifest::default().install().unwrap_err();
        assert!(rejected.is_empty());
        assert!(Manifest::global().unwrap().lookup("vae.safetensors").is_some());
    }

    #[test]
    fn empty_location_list_is_rejected() {
        let err = Manifest::from_json_str(r#"{ "weights": { "a.pt": [] } }"#).unwrap_err();
        assert!(err.to_string().contains("a.pt"));
    }
}
