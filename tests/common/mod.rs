#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sheet_importer::{
    identity::MemoryIdentityIndex,
    importer::Importer,
    mapping::Mapping,
    progress::{MemoryTransientStore, TransientStore},
    store::MemoryRecordStore,
};
use tempfile::{TempDir, tempdir};

pub type MemoryImporter = Importer<MemoryRecordStore, MemoryIdentityIndex>;

/// Path of a checked-in file under `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

/// Scratch directory that is removed on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    /// Writes rows as comma separated lines.
    pub fn write_csv(&self, name: &str, rows: &[&[&str]]) -> PathBuf {
        let mut contents = String::new();
        for row in rows {
            contents.push_str(&row.join(","));
            contents.push('\n');
        }
        self.write(name, &contents)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.path().join("uploads")
    }

    /// In-memory importer over a YAML mapping, saving uploads into the
    /// workspace and sharing `progress` with any poller.
    pub fn importer(&self, mapping: &str, progress: Arc<dyn TransientStore>) -> MemoryImporter {
        let mapping = Mapping::from_yaml_str(mapping).expect("mapping parses");
        Importer::new(
            mapping,
            MemoryRecordStore::new(),
            MemoryIdentityIndex::new(),
            progress,
            self.uploads_dir(),
        )
    }

    pub fn memory_importer(&self, mapping: &str) -> MemoryImporter {
        self.importer(mapping, Arc::new(MemoryTransientStore::new()))
    }
}
