use super::{chain_name, io_error, ChainContext, ChainError, ChainOutcome};
use crate::{
    chart::MinimumColumnBasis,
    command::add_threads,
    log::BatchLog,
    maps::{individual_map_directory, IndividualMap, MapMaker},
    runner::RunError,
};
use std::{path::PathBuf, time::Instant};
use tracing::instrument;

/// One map per table, all made in a single batch
#[derive(Clone, Debug)]
pub struct IndividualChain {
    name: String,
    minimum_column_basis: MinimumColumnBasis,
    tables: Vec<PathBuf>,
}

/// Make the individual maps of `tables` in `<output_root>/i-<mcb>/`.
///
/// Returns the map path of every table, made or not, and the failures of the
/// batch, which are logged and not raised.
pub(crate) fn make_individual_maps(
    context: &ChainContext,
    minimum: &MinimumColumnBasis,
    tables: &[PathBuf],
    batch: &str,
    log: &BatchLog,
) -> Result<(Vec<PathBuf>, Vec<String>), ChainError> {
    let maker = IndividualMap::new(context.programs, context.setup, minimum, context.store, log);
    let directory = individual_map_directory(context.output_root, minimum);

    let targets = tables
        .iter()
        .map(|table| directory.join(table.file_name().unwrap_or(table.as_os_str())))
        .collect::<Vec<_>>();

    let mut commands = Vec::new();
    for (table, target) in tables.iter().zip(targets.iter()) {
        commands.extend(maker.command(table, target)?.command());
    }

    if commands.is_empty() {
        log.info(format_args!("{batch}: all maps up to date"));
        return Ok((targets, Vec::new()));
    }

    // like the cluster, only the first output is waited for
    match context
        .runner
        .run(batch, &commands, log, add_threads, &targets[..1])
    {
        Ok(_) => Ok((targets, Vec::new())),
        Err(RunError::RunFailed { outcome, .. }) => {
            log.warning(format_args!(
                "{batch}: {} map(s) failed, reported when all chains are done",
                outcome.failures.len()
            ));
            Ok((targets, outcome.failures))
        }
        Err(error) => Err(error.into()),
    }
}

impl IndividualChain {
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

        if self.tables.is_empty() {
            log.warning(format_args!("chain {} has no tables", self.name));
            return Ok(ChainOutcome::new(Vec::new(), Vec::new()));
        }

        let result = make_individual_maps(
            context,
            &self.minimum_column_basis,
            &self.tables,
            &self.name,
            &log,
        );
        if let Err(ref error) = result {
            log.error(format_args!("chain {} failed: {error}", self.name));
        }
        log.info(format_args!("chain run time: {:.1?}", start.elapsed()));

        let (maps, failures) = result?;

        Ok(ChainOutcome::new(
            maps.into_iter().filter(|map| map.exists()).collect(),
            failures,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chart::ChartSummary,
        config::{ChainSetup, Programs},
        runner::Runner,
        testing::{summary, StubBackend, StubStore},
    };

    #[test]
    fn maps_all_tables_in_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = StubStore::new();
        let tables = ["20210101", "20210201", "20210301"]
            .iter()
            .map(|date| store.table(&dir.path().join(format!("t{date}.ace")), summary(date, 0, 0)))
            .collect::<Vec<_>>();
        let small = store.table(
            &dir.path().join("small.ace"),
            ChartSummary {
                antigens: 2,
                ..summary("20210401", 0, 0)
            },
        );

        let backend = StubBackend::failing(|command| command.name().contains("t20210201"));
        let runner = Runner::new(Box::new(backend.clone()), dir.path().join("log")).unwrap();
        let setup = ChainSetup::default();
        let programs = Programs::default();
        let context = ChainContext {
            runner: &runner,
            store: &store,
            setup: &setup,
            programs: &programs,
            output_root: dir.path(),
        };

        let chain = IndividualChain::new(
            "singles",
            MinimumColumnBasis::None,
            tables.iter().cloned().chain([small]).collect(),
        );
        let outcome = chain.run(&context).unwrap();

        assert_eq!(backend.submitted().len(), 3);
        assert_eq!(
            outcome.products(),
            [
                dir.path().join("i-none/t20210101.ace"),
                dir.path().join("i-none/t20210301.ace")
            ]
        );
        assert_eq!(outcome.failures().len(), 1);
        assert_eq!(runner.failures().len(), 1);
        assert!(runner.log_path("singles-none").exists());

        // made maps are not made again
        chain.run(&context).unwrap();
        assert_eq!(backend.submitted().len(), 4);
    }
}
