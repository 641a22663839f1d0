use super::{
    chain_name, individual::make_individual_maps, io_error, output_directory, output_prefix,
    ChainContext, ChainError, ChainOutcome,
};
use crate::{
    chart::{extract_column_bases, ChartStore, ColumnBasisMap, MergeOptions, MinimumColumnBasis},
    command::add_threads,
    log::BatchLog,
    maps::{IncrementalRelax, MapMaker, MergeColumnBasesMap, ScratchRelax},
    runner::RunError,
};
use std::{
    env, fs,
    os::unix::fs::symlink,
    path::{Component, Path, PathBuf},
    time::Instant,
};
use tracing::instrument;

/// Folds a list of tables into one merge, relaxing every merge incrementally
/// and from scratch and carrying the better of both to the next step.
#[derive(Clone, Debug)]
pub struct IncrementalChain {
    name: String,
    minimum_column_basis: MinimumColumnBasis,
    tables: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateKind {
    Incremental,
    Scratch,
}

/// One of the two competing relax results of a step
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub path: PathBuf,
    pub stress: f64,
}

/// lower stress wins, a tie goes to the incremental map
pub fn select_winner(incremental: Candidate, scratch: Candidate) -> Candidate {
    if incremental.stress <= scratch.stress {
        incremental
    } else {
        scratch
    }
}

/// Result of the merge step: the merge file and its column bases
#[derive(Clone, Debug)]
pub struct Merge {
    pub path: PathBuf,
    pub column_bases: ColumnBasisMap,
}

/// `<prev date>-<new date>`, the start of a previous merge's range is kept
pub fn merge_date(previous_date: &str, previous_layers: usize, new_date: &str) -> String {
    if previous_layers < 2 {
        format!("{previous_date}-{new_date}")
    } else {
        let start = previous_date.split('-').next().unwrap_or(previous_date);
        format!("{start}-{new_date}")
    }
}

/// `.ext` of `path` or nothing
fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// replace the `.merge.` part of a merge file name with `.<kind>.`
pub fn candidate_path(merge: &Path, kind: &str) -> PathBuf {
    let name = merge
        .file_name()
        .map(|name| name.to_string_lossy().replacen(".merge.", &format!(".{kind}."), 1))
        .unwrap_or_default();

    merge.with_file_name(name)
}

/// path of `target` relative to the directory `base`, both absolute or both relative
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target = target.components().collect::<Vec<_>>();
    let base = base.components().collect::<Vec<_>>();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(first, second)| first == second)
        .count();

    base[common..]
        .iter()
        .filter(|component| !matches!(component, Component::CurDir))
        .map(|_| Component::ParentDir)
        .chain(target[common..].iter().copied())
        .collect()
}

/// `path` made absolute against the current directory
fn absolute(path: &Path) -> Result<PathBuf, ChainError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(io_error(path))
    }
}

/// Remove `link` if it is a symlink not pointing to `target`.
///
/// Returns whether a link has to be (re)created. Anything but a symlink at
/// `link` is an error.
pub fn unlink_if_wrong_symlink(link: &Path, target: &Path) -> Result<bool, ChainError> {
    let metadata = match fs::symlink_metadata(link) {
        Ok(metadata) => metadata,
        Err(_) => return Ok(true),
    };

    if !metadata.file_type().is_symlink() {
        return Err(ChainError::NotASymlink(
            link.to_path_buf(),
            target.to_path_buf(),
        ));
    }

    if fs::read_link(link).map_err(io_error(link))? != target {
        fs::remove_file(link).map_err(io_error(link))?;
        return Ok(true);
    }

    Ok(false)
}

/// Strict, incremental merge of the chain's cursor with the next table
pub struct MergeStep<'a> {
    store: &'a dyn ChartStore,
    options: MergeOptions,
    minimum_column_basis: &'a MinimumColumnBasis,
    log: &'a BatchLog,
}

impl<'a> MergeStep<'a> {
    pub fn new(
        store: &'a dyn ChartStore,
        options: MergeOptions,
        minimum_column_basis: &'a MinimumColumnBasis,
        log: &'a BatchLog,
    ) -> Self {
        Self {
            store,
            options,
            minimum_column_basis,
            log,
        }
    }

    /// merge into `<prefix><date range>.merge<ext>` unless it already exists
    pub fn make(
        &self,
        previous: &Path,
        table: &Path,
        output_dir: &Path,
        output_prefix: &str,
    ) -> Result<Merge, ChainError> {
        self.log.info(format_args!(
            "merging {} and {} (incrementally)",
            previous.display(),
            table.display()
        ));

        let previous_summary = self.store.summary(previous)?;
        let addition = self.store.summary(table)?;
        let date = merge_date(&previous_summary.date, previous_summary.layers, &addition.date);
        let path = output_dir.join(format!(
            "{output_prefix}{date}.merge{}",
            dotted_extension(previous)
        ));

        if path.exists() {
            self.log
                .info(format_args!("{} up to date", path.display()));
        } else {
            self.store
                .merge_incremental(previous, table, &path, &self.options)?;
        }

        let column_bases = extract_column_bases(self.store, &path, self.minimum_column_basis)?;
        self.log.separator();

        Ok(Merge { path, column_bases })
    }
}

impl IncrementalChain {
    pub fn new(name: &str, minimum_column_basis: MinimumColumnBasis, tables: Vec<PathBuf>) -> Self {
        Self {
            name: chain_name(name, &minimum_column_basis),
            minimum_column_basis,
            tables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> &[PathBuf] {
        &self.tables
    }

    #[instrument(skip(self, context), fields(chain = %self.name), level = "info")]
    pub fn run(&self, context: &ChainContext) -> Result<ChainOutcome, ChainError> {
        let log = context
            .runner
            .open_log(&self.name)
            .map_err(io_error(&context.runner.log_path(&self.name)))?;
        let start = Instant::now();

        let result = self.steps(context, &log);

        match result {
            Ok(ref outcome) => log.info(format_args!(
                "chain {} finished with {}",
                self.name,
                outcome
                    .products()
                    .iter()
                    .map(|product| product.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            Err(ref error) => log.error(format_args!("chain {} failed: {error}", self.name)),
        }
        log.info(format_args!("chain run time: {:.1?}", start.elapsed()));

        result
    }

    fn steps(&self, context: &ChainContext, log: &BatchLog) -> Result<ChainOutcome, ChainError> {
        let output_dir = output_directory(context.output_root, &self.name)?;
        let mut failures = Vec::new();
        let mut cursor = self.first_map(context, &output_dir, log, &mut failures)?;
        log.info(format_args!("first map: {}", cursor.display()));
        log.separator();

        let merge_step = MergeStep::new(
            context.store,
            MergeOptions {
                combine_cheating_assays: context.setup.combine_cheating_assays,
            },
            &self.minimum_column_basis,
            log,
        );
        let mcb_map = MergeColumnBasesMap::new(
            context.programs,
            context.setup,
            &self.minimum_column_basis,
            context.store,
            log,
        );
        let incremental_relax = IncrementalRelax::new(context.programs, context.setup);
        let scratch_relax =
            ScratchRelax::new(context.programs, context.setup, &self.minimum_column_basis);

        for (step, table) in self.tables.iter().enumerate().skip(1) {
            let prefix = output_prefix(step);
            let merge = merge_step.make(&cursor, table, &output_dir, &prefix)?;
            let prepared = mcb_map.prepare(table, &merge.column_bases, &merge.path, &output_dir, &prefix)?;
            let incremental_output = candidate_path(&merge.path, "incremental");
            let scratch_output = candidate_path(&merge.path, "scratch");

            let mut commands = Vec::new();
            if let Some(ref prepared) = prepared {
                commands.extend(mcb_map.command(&prepared.source, &prepared.target)?.command());
            }
            commands.extend(incremental_relax.command(&merge.path, &incremental_output)?.command());
            commands.extend(scratch_relax.command(&merge.path, &scratch_output)?.command());

            if !commands.is_empty() {
                let batch = format!("{} step {prefix}", self.name);
                let expected = [incremental_output.clone(), scratch_output.clone()];

                match context
                    .runner
                    .run(&batch, &commands, log, add_threads, &expected)
                {
                    Ok(_) => {}
                    Err(RunError::RunFailed { outcome, .. }) => {
                        log.warning(format_args!(
                            "{} command(s) of {batch} failed, continuing with what was made",
                            outcome.failures.len()
                        ));
                        failures.extend(outcome.failures);
                    }
                    Err(error) => return Err(error.into()),
                }
            }

            if let Some(prepared) = prepared {
                fs::remove_file(&prepared.source).map_err(io_error(&prepared.source))?;
            }

            cursor = self.choose(context.store, &incremental_output, &scratch_output, log)?;
            log.separator();
            log.flush();
        }

        Ok(ChainOutcome::new(vec![cursor], failures))
    }

    /// Link the seed of the chain as `000.<date><ext>` into the output directory.
    ///
    /// A table with projections is used as is, a single table without
    /// projections is mapped first, a merge without projections is an error.
    fn first_map(
        &self,
        context: &ChainContext,
        output_dir: &Path,
        log: &BatchLog,
        failures: &mut Vec<String>,
    ) -> Result<PathBuf, ChainError> {
        let table = self
            .tables
            .first()
            .ok_or_else(|| ChainError::NoTables(self.name.clone()))?;
        let summary = context.store.summary(table)?;

        let seed = if summary.projections > 0 {
            table.clone()
        } else if summary.layers < 2 {
            let (maps, seed_failures) = make_individual_maps(
                context,
                &self.minimum_column_basis,
                std::slice::from_ref(table),
                &format!("{} first map", self.name),
                log,
            )?;
            failures.extend(seed_failures);

            match maps.into_iter().next() {
                Some(seed) if seed.exists() => seed,
                Some(seed) => return Err(ChainError::SeedMissing(seed)),
                None => return Err(ChainError::SeedMissing(table.clone())),
            }
        } else {
            return Err(ChainError::WrongFirstChart(format!(
                "{} has layers but no projections",
                table.display()
            )));
        };

        let link = output_dir.join(format!(
            "{}{}{}",
            output_prefix(0),
            summary.date,
            dotted_extension(table)
        ));
        let target = relative_path(&absolute(&seed)?, &absolute(output_dir)?);

        if unlink_if_wrong_symlink(&link, &target)? {
            symlink(&target, &link).map_err(io_error(&link))?;
        }

        Ok(link)
    }

    fn choose(
        &self,
        store: &dyn ChartStore,
        incremental: &Path,
        scratch: &Path,
        log: &BatchLog,
    ) -> Result<PathBuf, ChainError> {
        let candidate = |kind, path: &Path| -> Result<Candidate, ChainError> {
            let stress = store
                .summary(path)?
                .stress
                .ok_or_else(|| ChainError::NoStress(path.to_path_buf()))?;

            Ok(Candidate {
                kind,
                path: path.to_path_buf(),
                stress,
            })
        };

        match (incremental.exists(), scratch.exists()) {
            (true, true) => {}
            (true, false) => return Err(ChainError::NotImplemented(incremental.to_path_buf())),
            (false, true) => return Err(ChainError::NotImplemented(scratch.to_path_buf())),
            (false, false) => {
                return Err(ChainError::NoCandidates(
                    incremental.to_path_buf(),
                    scratch.to_path_buf(),
                ))
            }
        }

        let incremental = candidate(CandidateKind::Incremental, incremental)?;
        let scratch = candidate(CandidateKind::Scratch, scratch)?;
        log.info(format_args!(
            "choosing between incremental ({}) and from scratch ({})\n    incremental stress: {}\n        scratch stress: {}",
            file_name(&incremental.path),
            file_name(&scratch.path),
            incremental.stress,
            scratch.stress
        ));

        let winner = select_winner(incremental, scratch);
        log.info(format_args!(
            "using {} map ({}) for the next step",
            match winner.kind {
                CandidateKind::Incremental => "incremental",
                CandidateKind::Scratch => "from scratch",
            },
            file_name(&winner.path)
        ));

        Ok(winner.path)
    }
}

#[cfg(test)]
#[path = "incremental_test.rs"]
mod incremental_test;
