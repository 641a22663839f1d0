use crate::config::{ConfigErrors, TableSource};
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Tables of a chain in chain order.
///
/// Listed tables keep their order, collected tables are sorted by file name
/// (table names start with their date) and then by path.
pub fn collect_tables(source: &TableSource) -> Result<Vec<PathBuf>, ConfigErrors> {
    match source {
        TableSource::List(tables) => Ok(tables.clone()),
        TableSource::Collect { paths, glob } => {
            let Some((first, others)) = paths.split_first() else {
                warn!("No paths to collect tables from");
                return Ok(Vec::new());
            };
            let matcher = GlobBuilder::new(glob)
                .literal_separator(false)
                .build()?
                .compile_matcher();
            let mut builder = WalkBuilder::new(first);

            debug!("Filtering with glob: {glob:?}");
            others.iter().for_each(|path| {
                builder.add(path);
            });

            // tables are data, ignore files of source repositories do not apply
            builder
                .standard_filters(false)
                .hidden(true)
                .sort_by_file_name(|first, second| first.cmp(second));

            let mut tables = Vec::new();
            for entry in builder.build() {
                let entry = entry?;

                if entry.file_type().map_or(false, |kind| !kind.is_dir())
                    && entry
                        .path()
                        .file_name()
                        .map_or(false, |name| matcher.is_match(name))
                {
                    tables.push(DirEntry::into_path(entry));
                }
            }

            Ok(tables
                .into_iter()
                .sorted_by(|first, second| {
                    first
                        .file_name()
                        .cmp(&second.file_name())
                        .then_with(|| first.cmp(second))
                })
                .dedup()
                .collect())
        }
    }
}
