use crate::{
    chain::{Chain, ChainContext, ChainError, ChainOutcome},
    runner::Runner,
};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    num::NonZeroUsize,
    path::PathBuf,
    thread,
    time::Instant,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Failed to build the chain pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(
        "{failed_commands} command(s) and {} chain(s) failed, see logs in {log_dir:?}",
        .failed_chains.len()
    )]
    PartialFailure {
        log_dir: PathBuf,
        failed_commands: usize,
        failed_chains: Vec<String>,
        reports: Vec<ChainReport>,
    },
}

/// Result of one chain of the set
#[derive(Debug)]
pub struct ChainReport {
    pub name: String,
    pub result: Result<ChainOutcome, ChainError>,
}

/// Called once after all chains are done if anything failed
pub trait OperatorHook: Send + Sync {
    fn attention(&self, runner: &Runner, failed_chains: &[String]);
}

/// Prints the logs of all failed commands to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportToStderr;

impl OperatorHook for ReportToStderr {
    fn attention(&self, runner: &Runner, failed_chains: &[String]) {
        if runner.is_failed() {
            eprintln!("{}", runner.report_failures());
        }
        if !failed_chains.is_empty() {
            eprintln!(
                "> {} chain(s) failed: {}",
                failed_chains.len(),
                failed_chains.join(", ")
            );
        }
        eprintln!("> Logs are in {}", runner.log_dir().display());
    }
}

/// one worker per chain, at most one per core
pub fn workers(chains: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);

    chains.min(cores).max(1)
}

/// Run all `chains` concurrently and report on them.
///
/// A failing chain never stops its siblings. Failed commands, recorded by the
/// shared runner, and failed chains both end in
/// `OrchestratorError::PartialFailure` after `hook` was called.
#[instrument(skip_all, fields(chains = chains.len()), level = "info")]
pub fn run_chains(
    chains: &[Chain],
    context: &ChainContext,
    hook: &dyn OperatorHook,
) -> Result<Vec<ChainReport>, OrchestratorError> {
    let workers = workers(chains.len());
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("chain-{index}"))
        .build()?;

    info!(workers, backend = context.runner.backend().name(), "Running chains");
    let start = Instant::now();

    let reports = pool.install(|| {
        chains
            .par_iter()
            .map(|chain| {
                let result = chain.run(context);

                match result {
                    Ok(ChainOutcome::Completed { .. }) => info!(chain = chain.name(), "Chain completed"),
                    Ok(ChainOutcome::PartiallyFailed { ref failures, .. }) => warn!(
                        chain = chain.name(),
                        failures = failures.len(),
                        "Chain completed with failed commands"
                    ),
                    Err(ref error) => error!(chain = chain.name(), "Chain failed: {error}"),
                }

                ChainReport {
                    name: chain.name().to_string(),
                    result,
                }
            })
            .collect::<Vec<_>>()
    });

    info!(elapsed = ?start.elapsed(), "All chains done");

    let failures = context.runner.failures();
    let failed_chains = reports
        .iter()
        .filter(|report| report.result.is_err())
        .map(|report| report.name.clone())
        .collect::<Vec<_>>();

    if failures.is_empty() && failed_chains.is_empty() {
        return Ok(reports);
    }

    hook.attention(context.runner, &failed_chains);

    Err(OrchestratorError::PartialFailure {
        log_dir: context.runner.log_dir().to_path_buf(),
        failed_commands: failures.len(),
        failed_chains,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{IncrementalChain, IndividualChain},
        chart::MinimumColumnBasis,
        config::{ChainSetup, Programs},
        testing::{bases, summary, StubBackend, StubStore},
    };
    use parking_lot::Mutex;
    use std::fs;

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(PathBuf, usize, usize)>>,
    }

    impl OperatorHook for RecordingHook {
        fn attention(&self, runner: &Runner, failed_chains: &[String]) {
            self.calls.lock().push((
                runner.log_dir().to_path_buf(),
                runner.failures().len(),
                failed_chains.len(),
            ));
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: StubStore,
        runner: Runner,
        backend: StubBackend,
        setup: ChainSetup,
        programs: Programs,
    }

    impl Setup {
        fn new(backend: StubBackend) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().canonicalize().unwrap();

            Self {
                runner: Runner::new(Box::new(backend.clone()), root.join("log")).unwrap(),
                _dir: dir,
                root,
                store: StubStore::new(),
                backend,
                setup: ChainSetup::default(),
                programs: Programs::default(),
            }
        }

        fn context(&self) -> ChainContext<'_> {
            ChainContext {
                runner: &self.runner,
                store: &self.store,
                setup: &self.setup,
                programs: &self.programs,
                output_root: &self.root,
            }
        }

        /// incremental chain whose every merge raises the column basis of the added table
        fn incremental(&self, name: &str, dates: &[&str]) -> Chain {
            let tables = dates
                .iter()
                .enumerate()
                .map(|(index, date)| {
                    let path = self.root.join("tables").join(format!("{date}.ace"));
                    let table = self
                        .store
                        .table(&path, summary(date, 0, usize::from(index == 0)));
                    self.store
                        .register_column_bases(&table, bases(&[(date, 5.0)]));
                    table
                })
                .collect::<Vec<_>>();

            for step in 1..dates.len() {
                let merge = self.root.join(format!("{name}-none")).join(format!(
                    "{step:03}.{}-{}.merge.ace",
                    dates[0], dates[step]
                ));
                self.store.register_column_bases(
                    &merge,
                    bases(&dates[..=step].iter().map(|date| (*date, 6.0)).collect::<Vec<_>>()),
                );
            }

            Chain::Incremental(IncrementalChain::new(name, MinimumColumnBasis::None, tables))
        }

        fn individual(&self, name: &str, tables: &[&str]) -> Chain {
            let tables = tables
                .iter()
                .map(|table| {
                    self.store.table(
                        &self.root.join("singles").join(format!("{table}.ace")),
                        summary("20220101", 0, 0),
                    )
                })
                .collect();

            Chain::Individual(IndividualChain::new(name, MinimumColumnBasis::None, tables))
        }
    }

    #[test]
    fn successful_chains() {
        let setup = Setup::new(StubBackend::new());
        let chains = [
            setup.incremental("a", &["20200101", "20200201"]),
            setup.individual("c", &["c1", "c2"]),
        ];
        let hook = RecordingHook::default();

        let reports = run_chains(&chains, &setup.context(), &hook).unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|report| matches!(report.result, Ok(ChainOutcome::Completed { .. }))));
        assert!(hook.calls.lock().is_empty());
    }

    #[test]
    fn failures_of_concurrent_chains_add_up() {
        let backend = StubBackend::failing(|command| {
            command.name().ends_with(".mcb.ace") || command.name().contains("bad")
        });
        let setup = Setup::new(backend);
        let chains = [
            setup.incremental("a", &["20200101", "20200201", "20200301"]),
            setup.incremental("b", &["20210101", "20210201"]),
            setup.individual("c", &["c1", "c2-bad"]),
        ];
        let hook = RecordingHook::default();

        let result = run_chains(&chains, &setup.context(), &hook);

        let Err(OrchestratorError::PartialFailure {
            log_dir,
            failed_commands,
            failed_chains,
            reports,
        }) = result
        else {
            panic!("expected a partial failure");
        };

        assert_eq!(log_dir, setup.root.join("log"));
        assert_eq!(failed_commands, 4);
        assert!(failed_chains.is_empty());

        let per_chain = reports
            .iter()
            .map(|report| (report.name.as_str(), report.result.as_ref().unwrap().failures().len()))
            .collect::<Vec<_>>();
        assert_eq!(per_chain, [("a-none", 2), ("b-none", 1), ("c-none", 1)]);
        assert_eq!(
            per_chain.iter().map(|(_, failures)| failures).sum::<usize>(),
            failed_commands
        );
        assert_eq!(*hook.calls.lock(), [(setup.root.join("log"), 4, 0)]);

        // every chain only wrote into its own directory
        for (chain, own, other) in [("a-none", "2020", "2021"), ("b-none", "2021", "2020")] {
            for entry in fs::read_dir(setup.root.join(chain)).unwrap() {
                let name = entry.unwrap().file_name().to_string_lossy().into_owned();
                assert!(name.contains(own) && !name.contains(other), "{chain}: {name}");
            }
        }
        for command in setup.backend.submitted() {
            let output = command.output_path().unwrap();
            let directory = output.parent().unwrap().file_name().unwrap().to_string_lossy();
            let date = output.file_name().unwrap().to_string_lossy();
            match directory.as_ref() {
                "a-none" => assert!(date.contains("2020")),
                "b-none" => assert!(date.contains("2021")),
                "i-none" => assert!(date.starts_with("c")),
                other => panic!("unexpected output directory {other}"),
            }
        }
    }

    #[test]
    fn failed_chain_does_not_stop_siblings() {
        let setup = Setup::new(StubBackend::new());
        let broken = setup.store.table(
            &setup.root.join("tables").join("merge.ace"),
            summary("20190101-20190201", 2, 0),
        );
        let chains = [
            Chain::Incremental(IncrementalChain::new(
                "broken",
                MinimumColumnBasis::None,
                vec![broken],
            )),
            setup.incremental("a", &["20200101", "20200201"]),
        ];
        let hook = RecordingHook::default();

        match run_chains(&chains, &setup.context(), &hook) {
            Err(OrchestratorError::PartialFailure {
                failed_commands,
                failed_chains,
                reports,
                ..
            }) => {
                assert_eq!(failed_commands, 0);
                assert_eq!(failed_chains, ["broken-none"]);
                assert!(matches!(reports[0].result, Err(ChainError::WrongFirstChart(_))));
                assert!(reports[1].result.is_ok());
            }
            other => panic!("unexpected orchestrator result: {other:?}"),
        }
        assert_eq!(hook.calls.lock().len(), 1);
    }

    #[test]
    fn workers_are_bounded() {
        assert_eq!(workers(0), 1);
        assert_eq!(workers(1), 1);
        assert!(workers(1000) <= thread::available_parallelism().unwrap().get());
    }
}
