//! Builders for the relax commands of a chain.
//!
//! A builder never runs anything itself, it returns either `StepResult::Skipped`
//! when the target is newer than its source or the command producing it.

use crate::{
    chart::{ChartError, ChartStore, ColumnBasisMap, MinimumColumnBasis},
    command::{Command, StepResult},
    config::{ChainSetup, Programs},
    log::BatchLog,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// merge column bases closer than this to the table's own count as equal
pub const COLUMN_BASIS_TOLERANCE: f64 = 1e-6;

/// tables with fewer antigens or sera are not mapped individually
pub const MINIMUM_ANTIGENS_AND_SERA: usize = 3;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("Source {0:?} does not exist")]
    MissingSource(PathBuf),
    #[error("Failed to access {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
    #[error(transparent)]
    Chart(#[from] ChartError),
    #[error(
        "Column basis of {serum} in merge {merge:?} ({merge_value}) is lower than in table {table:?} ({table_value})"
    )]
    ColumnBasisDecrease {
        serum: String,
        table: PathBuf,
        table_value: f64,
        merge: PathBuf,
        merge_value: f64,
    },
    #[error("No column basis for {serum} of table {table:?} in merge {merge:?}")]
    MissingColumnBasis {
        serum: String,
        table: PathBuf,
        merge: PathBuf,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MapError + '_ {
    move |error| MapError::Io {
        path: path.to_path_buf(),
        error,
    }
}

/// true if `target` is missing or any of `sources` was modified after it
pub fn older_than(target: &Path, sources: &[&Path]) -> Result<bool, MapError> {
    let target_modified = match fs::metadata(target) {
        Ok(metadata) => metadata.modified().map_err(io_error(target))?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(error) => return Err(io_error(target)(error)),
    };

    for source in sources {
        let source_modified = match fs::metadata(source) {
            Ok(metadata) => metadata.modified().map_err(io_error(source))?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(MapError::MissingSource(source.to_path_buf()))
            }
            Err(error) => return Err(io_error(source)(error)),
        };

        if source_modified > target_modified {
            return Ok(true);
        }
    }

    Ok(false)
}

/// `<target without extension>.grid.json`
pub fn grid_json(target: &Path) -> PathBuf {
    target.with_extension("grid.json")
}

/// directory of individual table maps made with `minimum_column_basis`
pub fn individual_map_directory(output_root: &Path, minimum: &MinimumColumnBasis) -> PathBuf {
    output_root.join(format!("i-{minimum}"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Command builder for one kind of map
pub trait MapMaker {
    /// `Skipped` if `target` is up to date, the command making it otherwise
    fn command(&self, source: &Path, target: &Path) -> Result<StepResult, MapError>;
}

fn pending(command: Command, target: &Path) -> Result<StepResult, MapError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    Ok(StepResult::Pending {
        command,
        target: target.to_path_buf(),
    })
}

/// Full grid relax of a chart, used for merges and individual tables alike
#[derive(Clone, Debug)]
pub struct ScratchRelax {
    program: String,
    number_of_optimizations: usize,
    number_of_dimensions: usize,
    minimum_column_basis: MinimumColumnBasis,
    projections_to_keep: usize,
    reorient_to: Option<PathBuf>,
    disconnect_having_few_titers: bool,
}

impl ScratchRelax {
    pub fn new(programs: &Programs, setup: &ChainSetup, minimum: &MinimumColumnBasis) -> Self {
        Self {
            program: programs.relax_grid.clone(),
            number_of_optimizations: setup.number_of_optimizations,
            number_of_dimensions: setup.number_of_dimensions,
            minimum_column_basis: minimum.clone(),
            projections_to_keep: setup.projections_to_keep,
            reorient_to: setup.reorient_to.clone(),
            disconnect_having_few_titers: setup.disconnect_having_few_titers,
        }
    }

    fn build(&self, name: String, source: &Path, target: &Path) -> Command {
        let mut command = Command::new(&self.program)
            .named(name)
            .arg("-n")
            .arg(self.number_of_optimizations)
            .arg("-d")
            .arg(self.number_of_dimensions)
            .arg("-m")
            .arg(&self.minimum_column_basis)
            .arg("--keep-projections")
            .arg(self.projections_to_keep);

        if let Some(ref reorient_to) = self.reorient_to {
            command = command.arg("--reorient").path(reorient_to);
        }
        if !self.disconnect_having_few_titers {
            command = command.arg("--no-disconnect-having-few-titers");
        }

        command
            .arg("--grid-json")
            .path(&grid_json(target))
            .path(source)
            .output(target)
    }
}

impl MapMaker for ScratchRelax {
    fn command(&self, source: &Path, target: &Path) -> Result<StepResult, MapError> {
        if !older_than(target, &[source])? {
            return Ok(StepResult::Skipped);
        }

        pending(
            self.build(format!("scratch {}", file_name(target)), source, target),
            target,
        )
    }
}

/// Incremental relax of a merge: the merge projection is dropped and only the
/// newly added points are placed on a grid
#[derive(Clone, Debug)]
pub struct IncrementalRelax {
    program: String,
    number_of_optimizations: usize,
    projections_to_keep: usize,
    disconnect_having_few_titers: bool,
}

impl IncrementalRelax {
    pub fn new(programs: &Programs, setup: &ChainSetup) -> Self {
        Self {
            program: programs.relax_incremental.clone(),
            number_of_optimizations: setup.number_of_optimizations,
            projections_to_keep: setup.projections_to_keep,
            disconnect_having_few_titers: setup.disconnect_having_few_titers,
        }
    }
}

impl MapMaker for IncrementalRelax {
    fn command(&self, source: &Path, target: &Path) -> Result<StepResult, MapError> {
        if !older_than(target, &[source])? {
            return Ok(StepResult::Skipped);
        }

        let mut command = Command::new(&self.program)
            .named(format!("incremental {}", file_name(target)))
            .arg("-n")
            .arg(self.number_of_optimizations)
            .arg("--grid-test")
            .arg("--remove-source-projection")
            .arg("--keep-projections")
            .arg(self.projections_to_keep);

        if !self.disconnect_having_few_titers {
            command = command.arg("--no-disconnect-having-few-titers");
        }

        let command = command
            .arg("--grid-json")
            .path(&grid_json(target))
            .path(source)
            .output(target);

        pending(command, target)
    }
}

/// Map of a single table, skipping tables too small to be mapped
pub struct IndividualMap<'a> {
    relax: ScratchRelax,
    store: &'a dyn ChartStore,
    log: &'a BatchLog,
    ignore_tables_with_too_few_sera: bool,
}

impl<'a> IndividualMap<'a> {
    pub fn new(
        programs: &Programs,
        setup: &ChainSetup,
        minimum: &MinimumColumnBasis,
        store: &'a dyn ChartStore,
        log: &'a BatchLog,
    ) -> Self {
        Self {
            relax: ScratchRelax::new(programs, setup, minimum),
            store,
            log,
            ignore_tables_with_too_few_sera: setup.ignore_tables_with_too_few_sera,
        }
    }

    /// whether `table` is skipped for having fewer than three antigens or sera
    pub fn ignore(&self, table: &Path) -> Result<bool, MapError> {
        if !self.ignore_tables_with_too_few_sera {
            return Ok(false);
        }

        let summary = self.store.summary(table)?;
        if summary.antigens < MINIMUM_ANTIGENS_AND_SERA || summary.sera < MINIMUM_ANTIGENS_AND_SERA {
            self.log.info(format_args!(
                "{} has too few antigens ({}) or sera ({}), ignored",
                table.display(),
                summary.antigens,
                summary.sera
            ));
            return Ok(true);
        }

        Ok(false)
    }
}

impl MapMaker for IndividualMap<'_> {
    fn command(&self, source: &Path, target: &Path) -> Result<StepResult, MapError> {
        if !older_than(target, &[source])? || self.ignore(source)? {
            return Ok(StepResult::Skipped);
        }

        pending(
            self.relax
                .build(format!("individual {}", file_name(target)), source, target),
            target,
        )
    }
}

/// Table exported with column bases taken over from a merge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedTable {
    /// transient copy of the table with the merge column bases
    pub source: PathBuf,
    /// map of that copy
    pub target: PathBuf,
}

/// Individual table map using the column bases of the merge it went into
pub struct MergeColumnBasesMap<'a> {
    individual: IndividualMap<'a>,
    minimum_column_basis: MinimumColumnBasis,
    store: &'a dyn ChartStore,
    log: &'a BatchLog,
}

impl<'a> MergeColumnBasesMap<'a> {
    pub fn new(
        programs: &Programs,
        setup: &ChainSetup,
        minimum: &MinimumColumnBasis,
        store: &'a dyn ChartStore,
        log: &'a BatchLog,
    ) -> Self {
        Self {
            individual: IndividualMap::new(programs, setup, minimum, store, log),
            minimum_column_basis: minimum.clone(),
            store,
            log,
        }
    }

    /// Export `table` with the column bases of `merge` as
    /// `<prefix><date>.mcb-table<ext>`.
    ///
    /// Returns `None` if the map is up to date, the table is ignored or the
    /// merge does not change any column basis. A merge column basis lower than
    /// the table's own is an error.
    pub fn prepare(
        &self,
        table: &Path,
        merge_column_bases: &ColumnBasisMap,
        merge: &Path,
        output_dir: &Path,
        output_prefix: &str,
    ) -> Result<Option<PreparedTable>, MapError> {
        let summary = self.store.summary(table)?;
        let extension = table
            .extension()
            .map(|extension| format!(".{}", extension.to_string_lossy()))
            .unwrap_or_default();
        let prepared = PreparedTable {
            source: output_dir.join(format!("{output_prefix}{}.mcb-table{extension}", summary.date)),
            target: output_dir.join(format!("{output_prefix}{}.mcb{extension}", summary.date)),
        };

        if !older_than(&prepared.target, &[table])? || self.individual.ignore(table)? {
            return Ok(None);
        }

        self.log.info(format_args!(
            "Individual table map ({}) with column bases from the merge ({})",
            file_name(table),
            file_name(merge)
        ));

        let own = self.store.column_bases(table, &self.minimum_column_basis)?;
        let mut updated = false;
        let mut column_bases = Vec::with_capacity(own.len());

        for entry in own.iter() {
            let merged = merge_column_bases.get(&entry.serum).ok_or_else(|| {
                MapError::MissingColumnBasis {
                    serum: entry.serum.clone(),
                    table: table.to_path_buf(),
                    merge: merge.to_path_buf(),
                }
            })?;

            if merged < entry.column_basis - COLUMN_BASIS_TOLERANCE {
                self.log.error(format_args!(
                    "Column basis for {} in the merge ({merged}) is less than in the individual table ({})",
                    entry.serum, entry.column_basis
                ));
                return Err(MapError::ColumnBasisDecrease {
                    serum: entry.serum.clone(),
                    table: table.to_path_buf(),
                    table_value: entry.column_basis,
                    merge: merge.to_path_buf(),
                    merge_value: merged,
                });
            }

            if merged > entry.column_basis + COLUMN_BASIS_TOLERANCE {
                updated = true;
                column_bases.push(merged);
            } else {
                column_bases.push(entry.column_basis);
            }
        }

        if !updated {
            self.log
                .info("Column bases in the merge are the same as in the individual table");
            return Ok(None);
        }

        self.store
            .export_with_column_bases(table, &column_bases, &prepared.source)?;
        self.log.info(format_args!(
            "{} <-- {}: column bases updated from merge\n    orig: {:?}\n     new: {:?}",
            prepared.source.display(),
            table.display(),
            own.iter().map(|entry| entry.column_basis).collect::<Vec<_>>(),
            column_bases
        ));

        Ok(Some(prepared))
    }
}

impl MapMaker for MergeColumnBasesMap<'_> {
    fn command(&self, source: &Path, target: &Path) -> Result<StepResult, MapError> {
        self.individual.command(source, target)
    }
}
