//! The import run.
//!
//! One [`Importer`] is bound to a mapping, an optional record kind, a mapping
//! slug and the acting principal. [`Importer::run`] validates and saves the
//! uploaded file, counts its rows, assembles the template from the header row
//! and reconciles every data row in order, keeping the progress log current
//! after each one. Whatever the outcome, a run that got as far as saving the
//! file leaves an upload record in the store's history.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, error, info, warn};

use crate::{
    columns::{ColumnRefs, slugify},
    error::{ImportError, ImportResult},
    hooks::FilterHooks,
    identity::IdentityIndex,
    mapping::{Mapping, Settings},
    progress::{ProgressLog, ProgressTracker, Status, TransientStore, progress_key},
    reconcile::{ProcessingOptions, Reconciler},
    sheet::SheetReader,
    store::{RecordStore, UploadRecord},
    template::Template,
};

pub const DEFAULT_SLUG: &str = "default";
/// Kind label used in keys and tags by an importer not bound to a kind.
pub const ANY_KIND: &str = "any";

/// Per-run overrides of the mapping's `_settings` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingOverrides {
    pub header_row: Option<usize>,
    pub force_publish: Option<bool>,
    pub append_terms: Option<bool>,
}

impl ProcessingOverrides {
    pub fn apply(&self, settings: &Settings) -> Settings {
        Settings {
            header_row: self.header_row.unwrap_or(settings.header_row).max(1),
            force_publish: self.force_publish.unwrap_or(settings.force_publish),
            append_terms: self.append_terms.unwrap_or(settings.append_terms),
        }
    }
}

pub struct Importer<S, I> {
    mapping: Mapping,
    hooks: FilterHooks,
    store: S,
    identities: I,
    progress: Arc<dyn TransientStore>,
    uploads_dir: PathBuf,
    kind: Option<String>,
    slug: String,
    principal: String,
    structured_fields: bool,
    delimiter: Option<u8>,
    encoding: &'static Encoding,
}

impl<S, I> Importer<S, I>
where
    S: RecordStore,
    I: IdentityIndex,
{
    pub fn new(
        mapping: Mapping,
        store: S,
        identities: I,
        progress: Arc<dyn TransientStore>,
        uploads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mapping,
            hooks: FilterHooks::new(),
            store,
            identities,
            progress,
            uploads_dir: uploads_dir.into(),
            kind: None,
            slug: DEFAULT_SLUG.to_string(),
            principal: "0".to_string(),
            structured_fields: false,
            delimiter: None,
            encoding: UTF_8,
        }
    }

    /// Binds the importer to one record kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_slug(mut self, slug: &str) -> Self {
        let slug = slugify(slug);
        self.slug = if slug.is_empty() {
            DEFAULT_SLUG.to_string()
        } else {
            slug
        };
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn with_hooks(mut self, hooks: FilterHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_structured_fields(mut self, enabled: bool) -> Self {
        self.structured_fields = enabled;
        self
    }

    pub fn with_delimiter(mut self, delimiter: Option<u8>) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn kind_label(&self) -> &str {
        self.kind.as_deref().unwrap_or(ANY_KIND)
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Tag carried by this importer's upload records.
    pub fn tag(&self) -> String {
        format!("{}_{}", self.kind_label(), self.slug)
    }

    pub fn progress_key(&self) -> String {
        progress_key(self.kind_label(), &self.slug, &self.principal)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn identities(&self) -> &I {
        &self.identities
    }

    /// Upload records for this importer's tag, oldest first.
    pub fn history(&self) -> Vec<UploadRecord> {
        self.store.uploads(&self.tag())
    }

    /// Current progress log, or an empty one when none is stored.
    pub fn read_progress(&self) -> ImportResult<ProgressLog> {
        self.tracker().read()
    }

    /// Imports `file` and returns the terminal progress log.
    ///
    /// On failure the log is moved to `error` with the rendered message, and
    /// rows reconciled before the failure stay written.
    pub fn run(
        &mut self,
        file: Option<&Path>,
        overrides: &ProcessingOverrides,
    ) -> ImportResult<ProgressLog> {
        let tracker = self.tracker();
        tracker.init()?;
        let mut saved_name = None;

        match self.execute(file, overrides, &tracker, &mut saved_name) {
            Ok(log) => {
                info!(
                    "Import complete: {} of {} row(s) processed",
                    log.processed, log.total
                );
                if let Some(name) = saved_name {
                    if let Err(audit_err) = self.record_upload(name, log.clone()) {
                        warn!("Unable to record the completed upload: {audit_err}");
                    }
                }
                Ok(log)
            }
            Err(err) => {
                error!("Import failed: {err}");
                match tracker.fail(err.to_string()) {
                    Ok(log) => {
                        if let Some(name) = saved_name {
                            if let Err(audit_err) = self.record_upload(name, log) {
                                warn!("Unable to record the failed upload: {audit_err}");
                            }
                        }
                    }
                    Err(progress_err) => {
                        warn!("Unable to record the failure in the progress log: {progress_err}")
                    }
                }
                Err(err)
            }
        }
    }

    fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(Arc::clone(&self.progress), self.progress_key())
    }

    fn execute(
        &mut self,
        file: Option<&Path>,
        overrides: &ProcessingOverrides,
        tracker: &ProgressTracker,
        saved_name: &mut Option<String>,
    ) -> ImportResult<ProgressLog> {
        let upload = file.ok_or(ImportError::NoFileReceived)?;
        SheetReader::open(upload, self.delimiter, self.encoding)?;
        tracker.transition(Status::Saving, |_| {})?;

        let stored = self.save_upload(upload)?;
        *saved_name = upload
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let reader = SheetReader::open(&stored, self.delimiter, self.encoding)?;

        let settings = overrides.apply(self.mapping.settings());
        let header_index = settings.header_row - 1;
        let (header, row_count) = reader.scan(header_index)?;
        let header = header.ok_or(ImportError::MissingHeaderRow(settings.header_row))?;
        let total = row_count.saturating_sub(header_index + 1);
        tracker.transition(Status::Processing, |log| {
            log.total = total;
            log.stored_path = Some(stored.display().to_string());
        })?;
        info!(
            "Processing {total} row(s) from {} as {}",
            stored.display(),
            self.tag()
        );

        let refs = ColumnRefs::from_header(&header);
        let template = Template::assemble(&self.mapping, &refs, |name| {
            self.store.has_classification(name)
        })?;
        debug!(
            "Template resolved against {} column(s), {} slot(s) per row",
            refs.total(),
            template.size()
        );

        let options = ProcessingOptions::from(&settings);
        let mut reconciler = Reconciler::new(
            &mut self.store,
            &mut self.identities,
            self.kind.as_deref(),
        )
        .with_structured_fields(self.structured_fields);

        for row in reader.rows()? {
            let (row_number, cells) = row?;
            if row_number <= header_index {
                continue;
            }
            let cells = self.hooks.apply(row_number, cells, &refs)?;
            let record = template.interpolate(&cells);
            let (id, outcome) = reconciler.reconcile(record, &options)?;
            tracker.update(|log| {
                log.posts.insert(id, outcome);
                log.processed += 1;
            })?;
        }

        tracker.transition(Status::Complete, |_| {})
    }

    fn save_upload(&self, upload: &Path) -> ImportResult<PathBuf> {
        let dir = self.uploads_dir.join(self.kind_label()).join(&self.slug);
        fs::create_dir_all(&dir)?;
        let name = upload
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or(ImportError::NoFileReceived)?;
        let stored = dir.join(format!("{}-{name}", Utc::now().timestamp()));
        fs::copy(upload, &stored)?;
        debug!("Saved {} to {}", upload.display(), stored.display());
        Ok(stored)
    }

    fn record_upload(&mut self, file_name: String, log: ProgressLog) -> ImportResult<()> {
        let upload = UploadRecord::new(file_name, self.tag(), log);
        self.store
            .record_upload(upload)
            .map_err(|err| ImportError::StoreOperationFailed(err.to_string()))
    }
}
