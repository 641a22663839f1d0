use super::{
    ChartError, ChartStore, ChartSummary, MergeOptions, MinimumColumnBasis, SerumColumnBasis,
};
use flate2::read::GzDecoder;
use itertools::Itertools;
use serde_json::{Map, Value};
use std::{
    fs,
    io::Read,
    path::Path,
    process::{self, Stdio},
};
use tracing::{debug, instrument};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Chart store for ACE files (acmacs JSON charts).
///
/// Reading, column bases and export are done here, merging is delegated to
/// the external merge program of the map library.
#[derive(Debug, Clone)]
pub struct AceStore {
    merge_program: String,
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn invalid(path: &Path, reason: impl Into<String>) -> ChartError {
    ChartError::Invalid {
        path: display(path),
        reason: reason.into(),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ChartError + '_ {
    move |source| ChartError::Io {
        path: display(path),
        source,
    }
}

/// titer in log units as used for column bases, `None` for don't-care titers
pub fn logged_titer(titer: &str) -> Option<f64> {
    let titer = titer.trim();
    let (value, adjust) = match titer.chars().next()? {
        '*' => return None,
        '<' => (&titer[1..], -1.0),
        '>' => (&titer[1..], 1.0),
        '~' => (&titer[1..], 0.0),
        _ => (titer, 0.0),
    };

    value
        .parse::<f64>()
        .ok()
        .filter(|value| *value > 0.0)
        .map(|value| (value / 10.0).log2() + adjust)
}

/// Parsed chart document with accessors for the fields the chain needs
struct AceChart<'a> {
    path: &'a Path,
    document: Value,
}

impl<'a> AceChart<'a> {
    fn load(path: &'a Path) -> Result<Self, ChartError> {
        let raw = fs::read(path).map_err(io_error(path))?;

        let bytes = if raw.starts_with(&GZIP_MAGIC) {
            let mut decompressed = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut decompressed)
                .map_err(io_error(path))?;
            decompressed
        } else if raw.starts_with(&XZ_MAGIC) {
            return Err(invalid(path, "xz compressed charts must be decompressed first"));
        } else {
            raw
        };

        let document = serde_json::from_slice(&bytes).map_err(|source| ChartError::Json {
            path: display(path),
            source,
        })?;

        let chart = Self { path, document };
        chart.chart()?;

        Ok(chart)
    }

    fn chart(&self) -> Result<&Map<String, Value>, ChartError> {
        self.document
            .get("c")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(self.path, "no chart object \"c\""))
    }

    fn list_len(&self, key: &str) -> Result<usize, ChartError> {
        Ok(self
            .chart()?
            .get(key)
            .and_then(Value::as_array)
            .map_or(0, Vec::len))
    }

    fn titers(&self) -> Option<&Map<String, Value>> {
        self.chart().ok()?.get("t").and_then(Value::as_object)
    }

    fn layers(&self) -> usize {
        self.titers()
            .and_then(|titers| titers.get("L"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    fn date(&self) -> Result<String, ChartError> {
        let info = self.chart()?.get("i");
        let own = info
            .and_then(|info| info.get("D"))
            .and_then(Value::as_str)
            .filter(|date| !date.is_empty());

        if let Some(date) = own {
            return Ok(date.to_string());
        }

        // merged charts only carry the dates of their sources
        let dates = info
            .and_then(|info| info.get("S"))
            .and_then(Value::as_array)
            .map(|sources| {
                sources
                    .iter()
                    .filter_map(|source| source.get("D").and_then(Value::as_str))
                    .filter(|date| !date.is_empty())
                    .sorted()
                    .collect_vec()
            })
            .unwrap_or_default();

        match (dates.first(), dates.last()) {
            (Some(first), Some(last)) if first == last => Ok(first.to_string()),
            (Some(first), Some(last)) => Ok(format!("{first}-{last}")),
            _ => Err(invalid(self.path, "chart has no date")),
        }
    }

    fn stress(&self) -> Result<Option<f64>, ChartError> {
        Ok(self
            .chart()?
            .get("P")
            .and_then(Value::as_array)
            .and_then(|projections| projections.first())
            .and_then(|projection| projection.get("s"))
            .and_then(Value::as_f64))
    }

    /// serum name, reassortant, annotations and serum id joined by spaces
    fn serum_names(&self) -> Result<Vec<String>, ChartError> {
        let sera = self
            .chart()?
            .get("s")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        Ok(sera
            .iter()
            .map(|serum| {
                let field = |key: &str| serum.get(key).and_then(Value::as_str).unwrap_or("");
                let annotations = serum
                    .get("a")
                    .and_then(Value::as_array)
                    .map(|annotations| annotations.iter().filter_map(Value::as_str).join(" "))
                    .unwrap_or_default();

                let name = [field("N"), field("R"), annotations.as_str(), field("I")]
                    .into_iter()
                    .filter(|part| !part.is_empty())
                    .join(" ");
                name
            })
            .collect())
    }

    /// maximum logged titer of every serum, over the dense (`l`) or sparse (`d`) table
    fn computed_column_bases(&self, sera: usize) -> Vec<Option<f64>> {
        let mut bases = vec![None; sera];
        let Some(titers) = self.titers() else {
            return bases;
        };
        let mut update = |serum: usize, titer: &Value| {
            if let (Some(base), Some(logged)) = (
                bases.get_mut(serum),
                titer.as_str().and_then(logged_titer),
            ) {
                *base = Some(base.map_or(logged, |current: f64| current.max(logged)));
            }
        };

        if let Some(dense) = titers.get("l").and_then(Value::as_array) {
            for row in dense.iter().filter_map(Value::as_array) {
                row.iter()
                    .enumerate()
                    .for_each(|(serum, titer)| update(serum, titer));
            }
        } else if let Some(sparse) = titers.get("d").and_then(Value::as_array) {
            for row in sparse.iter().filter_map(Value::as_object) {
                for (serum, titer) in row {
                    if let Ok(serum) = serum.parse::<usize>() {
                        update(serum, titer);
                    }
                }
            }
        }

        bases
    }

    fn forced_column_bases(&self, sera: usize) -> Result<Option<Vec<f64>>, ChartError> {
        match self.chart()?.get("C").and_then(Value::as_array) {
            None => Ok(None),
            Some(forced) if forced.len() == sera => forced
                .iter()
                .map(|value| {
                    value
                        .as_f64()
                        .ok_or_else(|| invalid(self.path, "non numeric forced column basis"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(forced) => Err(invalid(
                self.path,
                format!(
                    "{} forced column bases for {sera} sera",
                    forced.len()
                ),
            )),
        }
    }

    fn column_bases(&self, minimum: &MinimumColumnBasis) -> Result<Vec<f64>, ChartError> {
        let sera = self.list_len("s")?;

        if let Some(forced) = self.forced_column_bases(sera)? {
            return Ok(forced);
        }

        let minimum = minimum.logged();

        self.computed_column_bases(sera)
            .into_iter()
            .enumerate()
            .map(|(serum, base)| match (base, minimum) {
                (Some(base), Some(minimum)) => Ok(base.max(minimum)),
                (Some(base), None) => Ok(base),
                (None, Some(minimum)) => Ok(minimum),
                (None, None) => Err(invalid(
                    self.path,
                    format!("serum {serum} has no titers to derive a column basis from"),
                )),
            })
            .collect()
    }
}

impl AceStore {
    pub fn new(merge_program: impl Into<String>) -> Self {
        Self {
            merge_program: merge_program.into(),
        }
    }
}

impl ChartStore for AceStore {
    fn summary(&self, path: &Path) -> Result<ChartSummary, ChartError> {
        let chart = AceChart::load(path)?;

        Ok(ChartSummary {
            date: chart.date()?,
            layers: chart.layers(),
            projections: chart.list_len("P")?,
            antigens: chart.list_len("a")?,
            sera: chart.list_len("s")?,
            stress: chart.stress()?,
        })
    }

    #[instrument(skip(self, options), level = "debug")]
    fn merge_incremental(
        &self,
        previous: &Path,
        addition: &Path,
        output: &Path,
        options: &MergeOptions,
    ) -> Result<(), ChartError> {
        let mut command = process::Command::new(&self.merge_program);
        command.args(["--match", "strict", "--merge-type", "incremental"]);
        if options.combine_cheating_assays {
            command.arg("--combine-cheating-assays");
        }
        command
            .arg("-o")
            .arg(output)
            .arg(previous)
            .arg(addition)
            .stdin(Stdio::null());

        let result = command.output().map_err(io_error(output))?;
        let report = format!(
            "{}{}",
            String::from_utf8_lossy(&result.stdout),
            String::from_utf8_lossy(&result.stderr)
        );
        debug!(report = %report, "Merge finished with {}", result.status);

        if result.status.success() && output.exists() {
            Ok(())
        } else {
            Err(ChartError::Merge {
                previous: display(previous),
                addition: display(addition),
                status: result.status.to_string(),
                output: report,
            })
        }
    }

    fn column_bases(
        &self,
        path: &Path,
        minimum: &MinimumColumnBasis,
    ) -> Result<Vec<SerumColumnBasis>, ChartError> {
        let chart = AceChart::load(path)?;

        Ok(chart
            .serum_names()?
            .into_iter()
            .zip(chart.column_bases(minimum)?)
            .map(|(serum, column_basis)| SerumColumnBasis {
                serum,
                column_basis,
            })
            .collect())
    }

    fn export_with_column_bases(
        &self,
        source: &Path,
        column_bases: &[f64],
        output: &Path,
    ) -> Result<(), ChartError> {
        let mut chart = AceChart::load(source)?;
        let sera = chart.list_len("s")?;

        if column_bases.len() != sera {
            return Err(invalid(
                source,
                format!("{} column bases given for {sera} sera", column_bases.len()),
            ));
        }

        if let Some(object) = chart.document.get_mut("c").and_then(Value::as_object_mut) {
            object.insert(
                String::from("C"),
                Value::Array(column_bases.iter().map(|base| Value::from(*base)).collect()),
            );
        }

        let bytes = serde_json::to_vec(&chart.document).map_err(|source| ChartError::Json {
            path: display(output),
            source,
        })?;

        fs::write(output, bytes).map_err(io_error(output))
    }
}

#[cfg(test)]
#[path = "ace_test.rs"]
mod ace_test;
