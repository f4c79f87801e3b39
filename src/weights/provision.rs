use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::core::settings::Settings;
use crate::error::{ProvisionError, Result};
use crate::workflow::WorkflowGraph;

use super::bulk::{self, BulkFetcher};
use super::civitai::CivitaiModel;
use super::integrity;
use super::manifest::{Manifest, WeightEntry, WeightLocation};
use super::outcome::{DownloadOutcome, OutcomeStatus, ProvisionReport};
use super::presence;
use super::streaming::{HttpTransport, StreamingDownloader};
use super::SUPPORTED_FILETYPES;

const EMBEDDINGS: &str = "EMBEDDINGS";

/// Entry point for the inference glue: makes every requested weight exist
/// locally, one download at a time.
pub struct Provisioner<'a> {
    manifest: &'a Manifest,
    bulk: Box<dyn BulkFetcher>,
    streaming: StreamingDownloader,
    models_root: PathBuf,
    verify_checksums: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        manifest: &'a Manifest,
        bulk: Box<dyn BulkFetcher>,
        streaming: StreamingDownloader,
        models_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manifest,
            bulk,
            streaming,
            models_root: models_root.into(),
            verify_checksums: false,
        }
    }

    pub fn from_settings(manifest: &'a Manifest, settings: &Settings) -> Result<Self> {
        let transport =
            HttpTransport::new().map_err(|err| ProvisionError::HttpClient(err.to_string()))?;
        let streaming = StreamingDownloader::new(
            Box::new(transport),
            settings.civitai_api_token.clone(),
            &settings.models_root,
        );
        Ok(Self::new(
            manifest,
            bulk::select_fetcher(&settings.fetch_tool)?,
            streaming,
            &settings.models_root,
        )
        .with_checksum_verification(settings.verify_checksums))
    }

    #[must_use]
    pub fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Provisions catalogued weights in request order, then every CivitAI
    /// model. The first fatal error stops the call; earlier downloads stay.
    pub fn download_weights<S: AsRef<str>>(
        &self,
        requested: &[S],
        civitai_models: &[CivitaiModel],
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();
        let mut seen = HashSet::new();

        for identifier in requested.iter().map(AsRef::as_ref) {
            if !seen.insert(identifier) {
                continue;
            }
            let Some(entry) = self.manifest.lookup(identifier) else {
                warn!(identifier, "weight not in manifest; skipping");
                report.unknown.push(identifier.to_string());
                continue;
            };
            if entry.is_restricted() {
                warn!(
                    identifier,
                    license = ?entry.license_class,
                    "weight is for non-commercial use only unless you hold a commercial license"
                );
            }
            self.provision_entry(entry, &mut report)?;
        }

        for model in civitai_models {
            let outcome = self.streaming.fetch_with_token(model).map_err(|err| {
                let destination = self.models_root.join(&model.destination_directory);
                error!(
                    name = %model.display_name,
                    url = %model.url,
                    destination = %destination.display(),
                    error = %err,
                    "civitai download failed"
                );
                err
            })?;
            outcome.log();
            report.outcomes.push(outcome);
        }

        info!(
            succeeded = report.count(OutcomeStatus::Succeeded),
            skipped = report.count(OutcomeStatus::SkippedExisting),
            unknown = report.unknown.len(),
            bytes = report.bytes_transferred(),
            "provisioning finished"
        );
        Ok(report)
    }

    /// Scans the graph for weight references, adds `extra` identifiers and
    /// provisions the lot.
    pub fn handle_workflow<S: AsRef<str>>(
        &self,
        graph: &WorkflowGraph,
        extra: &[S],
        civitai_models: &[CivitaiModel],
    ) -> Result<ProvisionReport> {
        let embeddings: Vec<&str> = self
            .manifest
            .entries_by_type(EMBEDDINGS)
            .into_iter()
            .map(|entry| entry.identifier.as_str())
            .collect();
        let mut requested = graph.weight_references(SUPPORTED_FILETYPES, &embeddings);
        requested.extend(extra.iter().map(|id| id.as_ref().to_string()));
        self.download_weights(&requested, civitai_models)
    }

    /// Attempts every location once, even after one fails, then reports the
    /// first failure.
    fn provision_entry(&self, entry: &WeightEntry, report: &mut ProvisionReport) -> Result<()> {
        let mut first_error = None;
        for location in &entry.locations {
            match self.provision_location(entry, location) {
                Ok(outcome) => {
                    outcome.log();
                    report.outcomes.push(outcome);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn provision_location(
        &self,
        entry: &WeightEntry,
        location: &WeightLocation,
    ) -> Result<DownloadOutcome> {
        let identifier = entry.identifier.as_str();
        let destination = self.models_root.join(&location.destination);
        let candidate = presence::candidate_path(identifier, &destination);
        if presence::exists(identifier, &destination) {
            return Ok(DownloadOutcome::skipped(identifier, candidate));
        }

        let start = Instant::now();
        let result = bulk::download(self.bulk.as_ref(), identifier, &location.url, &destination)
            .and_then(|transfer| {
                let basename = identifier.rsplit('/').next().unwrap_or(identifier);
                let file = transfer.directory.join(basename);
                if self.verify_checksums {
                    if let Some(expected) = &location.sha256 {
                        integrity::verify_sha256(&file, expected)?;
                    }
                }
                Ok(DownloadOutcome::succeeded(
                    identifier,
                    file,
                    transfer.bytes.unwrap_or(0),
                    transfer.elapsed,
                ))
            });

        result.map_err(|err| {
            error!(
                identifier,
                url = %location.url,
                destination = %destination.display(),
                error = %err,
                "weight download failed"
            );
            DownloadOutcome::failed(identifier, candidate, start.elapsed()).log();
            err
        })
    }
}
