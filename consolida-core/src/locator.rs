//! Discovery of `YYYY-MM` snapshot folders and the extracts inside them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::model::{Period, RecordKind};
use crate::registry::KindRegistry;

#[derive(thiserror::Error, Debug)]
/// Failures that prevent building the inventory at all.
pub enum LocateError {
    /// The data root or a period folder cannot be listed.
    #[error("Cannot list {path}: {source}")]
    Unreadable {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One extract to consolidate.
pub struct SourceFile {
    /// Snapshot the file belongs to.
    pub period: Period,
    /// Record kind resolved from the file name.
    pub kind: RecordKind,
    /// Full path of the file.
    pub path: PathBuf,
}

impl SourceFile {
    /// Name of the file without its folder.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Stable identifier used for checkpoints: `<period>/<file name>`.
    #[must_use]
    pub fn source_id(&self) -> String {
        format!("{}/{}", self.period, self.file_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Ordered list of extracts plus files nobody claimed.
pub struct Inventory {
    /// Recognized extracts ordered by period, kind, and file name.
    pub sources: Vec<SourceFile>,
    /// Files inside period folders that matched no pattern.
    pub unrecognized: Vec<PathBuf>,
    /// Period folders that could not be listed; their files are left out.
    pub unreadable: Vec<PathBuf>,
}

impl Inventory {
    /// Distinct periods present, oldest first.
    #[must_use]
    pub fn periods(&self) -> Vec<Period> {
        let mut periods: Vec<Period> = self.sources.iter().map(|source| source.period).collect();
        periods.dedup();
        periods
    }
}

/// Walks a data root laid out as `<root>/<YYYY-MM>/<files>`.
pub struct SnapshotLocator<'reg> {
    root: PathBuf,
    registry: &'reg KindRegistry,
}

impl<'reg> SnapshotLocator<'reg> {
    /// Locator over `root`, classifying files with `registry`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, registry: &'reg KindRegistry) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    /// Enumerate every recognized extract in chronological order.
    ///
    /// Folders that are not `YYYY-MM` are ignored, as are `.zip` archives.
    /// Other unrecognized files and unreadable period folders are logged and
    /// listed, never fatal.
    ///
    /// # Errors
    ///
    /// Returns [`LocateError::Unreadable`] when the root cannot be listed.
    pub fn locate(&self) -> Result<Inventory, LocateError> {
        let mut periods = Vec::new();
        for entry in list(&self.root)? {
            if !entry.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match name.parse::<Period>() {
                Ok(period) => periods.push((period, entry)),
                Err(_) => tracing::debug!(folder = %entry.display(), "ignoring non-period folder"),
            }
        }
        periods.sort();
        Ok(self.inventory(periods))
    }

    fn inventory(&self, periods: Vec<(Period, PathBuf)>) -> Inventory {
        let mut inventory = Inventory::default();
        for (period, folder) in periods {
            let entries = match list(&folder) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(
                        period = %period,
                        error = %err,
                        "period folder unreadable, skipping"
                    );
                    inventory.unreadable.push(folder);
                    continue;
                }
            };
            let mut found = Vec::new();
            for path in entries {
                if !path.is_file() || is_archive(&path) {
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match self.registry.classify(&name) {
                    Some(kind) => found.push(SourceFile { period, kind, path }),
                    None => {
                        tracing::warn!(
                            period = %period,
                            file = %path.display(),
                            "unrecognized file, skipping"
                        );
                        inventory.unrecognized.push(path);
                    }
                }
            }
            found.sort_by(|left, right| {
                left.kind
                    .cmp(&right.kind)
                    .then_with(|| left.file_name().cmp(&right.file_name()))
            });
            tracing::info!(period = %period, files = found.len(), "period located");
            inventory.sources.extend(found);
        }
        inventory
    }
}

fn list(dir: &Path) -> Result<Vec<PathBuf>, LocateError> {
    let unreadable = |source| LocateError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };
    fs::read_dir(dir)
        .map_err(unreadable)?
        .map(|entry| entry.map(|entry| entry.path()).map_err(unreadable))
        .collect()
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("zip"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::model::ReferenceTable;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").expect("write fixture");
    }

    #[test]
    fn periods_are_chronological_and_references_come_first() {
        let root = tempfile::tempdir().expect("temp dir");
        for folder in ["2023-07", "2023-05", "notes", "2023-13"] {
            fs::create_dir(root.path().join(folder)).expect("create folder");
        }
        let july = root.path().join("2023-07");
        let may = root.path().join("2023-05");
        touch(&july, "K3241.K03200Y0.D30708.EMPRECSV");
        touch(&may, "K3241.K03200Y1.D30513.ESTABELE");
        touch(&may, "K3241.K03200Y0.D30513.EMPRECSV");
        touch(&may, "F.K03200$Z.D30513.CNAECSV");
        touch(&may, "Empresas0.zip");
        touch(&may, "LEIAME.txt");
        touch(&root.path().join("2023-13"), "K3241.K03200Y0.D31300.EMPRECSV");

        let registry = KindRegistry::standard().expect("valid registry");
        let inventory = SnapshotLocator::new(root.path(), &registry)
            .locate()
            .expect("root is readable");

        let order: Vec<(String, RecordKind)> = inventory
            .sources
            .iter()
            .map(|source| (source.period.to_string(), source.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2023-05".to_owned(), RecordKind::Reference(ReferenceTable::Cnae)),
                ("2023-05".to_owned(), RecordKind::Company),
                ("2023-05".to_owned(), RecordKind::Establishment),
                ("2023-07".to_owned(), RecordKind::Company),
            ],
            "period then kind order"
        );
        assert_eq!(
            inventory.unrecognized,
            vec![may.join("LEIAME.txt")],
            "archives are silent, other strays are reported"
        );
        assert_eq!(inventory.periods().len(), 2, "two valid periods");
    }

    #[test]
    fn unreadable_period_folder_is_reported_and_skipped() {
        let root = tempfile::tempdir().expect("temp dir");
        let july = root.path().join("2023-07");
        fs::create_dir(&july).expect("create folder");
        touch(&july, "K3241.K03200Y0.D30708.EMPRECSV");
        let vanished = root.path().join("2023-05");

        let registry = KindRegistry::standard().expect("valid registry");
        let locator = SnapshotLocator::new(root.path(), &registry);
        let inventory = locator.inventory(vec![
            ("2023-05".parse().expect("valid period"), vanished.clone()),
            ("2023-07".parse().expect("valid period"), july),
        ]);

        assert_eq!(inventory.unreadable, vec![vanished], "folder reported");
        assert_eq!(
            inventory.periods(),
            vec!["2023-07".parse::<Period>().expect("valid period")],
            "later period still located"
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = tempfile::tempdir().expect("temp dir");
        let registry = KindRegistry::standard().expect("valid registry");
        let result = SnapshotLocator::new(root.path().join("absent"), &registry).locate();
        assert!(
            matches!(result, Err(LocateError::Unreadable { .. })),
            "unreadable root is fatal"
        );
    }
}
