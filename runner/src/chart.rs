//! Seam to the antigenic map library.
//!
//! The chain never looks into chart files itself, everything it needs to know
//! about a dataset goes through `ChartStore`.

pub mod ace;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, io, path::Path, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("Failed to access chart {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse chart {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Chart {path} is invalid: {reason}")]
    Invalid { path: String, reason: String },
    #[error("Merging {previous} and {addition} failed ({status}):\n{output}")]
    Merge {
        previous: String,
        addition: String,
        status: String,
        output: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected \"none\" or a titer such as 1280, got {0:?}")]
pub struct MinimumColumnBasisError(String);

/// Lower bound applied to computed column bases, `none` or a titer
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(try_from = "RawMinimumColumnBasis", into = "String")]
pub enum MinimumColumnBasis {
    #[default]
    None,
    Titer(u32),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMinimumColumnBasis {
    Number(u32),
    Text(String),
}

impl TryFrom<RawMinimumColumnBasis> for MinimumColumnBasis {
    type Error = MinimumColumnBasisError;

    fn try_from(raw: RawMinimumColumnBasis) -> Result<Self, Self::Error> {
        match raw {
            RawMinimumColumnBasis::Number(titer) => titer.to_string().parse(),
            RawMinimumColumnBasis::Text(text) => text.parse(),
        }
    }
}

impl FromStr for MinimumColumnBasis {
    type Err = MinimumColumnBasisError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim() {
            "none" | "" => Ok(Self::None),
            titer => match titer.parse::<u32>() {
                Ok(titer) if titer >= 10 => Ok(Self::Titer(titer)),
                _ => Err(MinimumColumnBasisError(text.to_string())),
            },
        }
    }
}

impl fmt::Display for MinimumColumnBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Titer(titer) => write!(f, "{titer}"),
        }
    }
}

impl From<MinimumColumnBasis> for String {
    fn from(value: MinimumColumnBasis) -> Self {
        value.to_string()
    }
}

impl MinimumColumnBasis {
    /// the bound in log titer units, i.e. log2(titer / 10)
    pub fn logged(&self) -> Option<f64> {
        match self {
            Self::None => None,
            Self::Titer(titer) => Some((f64::from(*titer) / 10.0).log2()),
        }
    }
}

/// What the chain needs to know about a chart
#[derive(Clone, Debug, PartialEq)]
pub struct ChartSummary {
    /// date or date range of the underlying table(s), e.g. `20210301` or `20200101-20210301`
    pub date: String,
    pub layers: usize,
    pub projections: usize,
    pub antigens: usize,
    pub sera: usize,
    /// stress of the first projection
    pub stress: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SerumColumnBasis {
    /// full name of the serum, stable across tables and merges
    pub serum: String,
    pub column_basis: f64,
}

/// Column bases of a merge keyed by serum full name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnBasisMap(BTreeMap<String, f64>);

impl ColumnBasisMap {
    pub fn get(&self, serum: &str) -> Option<f64> {
        self.0.get(serum).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

impl FromIterator<SerumColumnBasis> for ColumnBasisMap {
    fn from_iter<I: IntoIterator<Item = SerumColumnBasis>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|entry| (entry.serum, entry.column_basis))
                .collect(),
        )
    }
}

impl FromIterator<(String, f64)> for ColumnBasisMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    pub combine_cheating_assays: bool,
}

/// Access to chart files, implemented by the map library binding
pub trait ChartStore: Send + Sync {
    fn summary(&self, path: &Path) -> Result<ChartSummary, ChartError>;

    /// strict-match incremental merge of `previous` and `addition` written to `output`
    fn merge_incremental(
        &self,
        previous: &Path,
        addition: &Path,
        output: &Path,
        options: &MergeOptions,
    ) -> Result<(), ChartError>;

    /// column bases of all sera in chart order
    fn column_bases(
        &self,
        path: &Path,
        minimum: &MinimumColumnBasis,
    ) -> Result<Vec<SerumColumnBasis>, ChartError>;

    /// write a copy of `source` to `output` with the given (forced) column bases
    fn export_with_column_bases(
        &self,
        source: &Path,
        column_bases: &[f64],
        output: &Path,
    ) -> Result<(), ChartError>;
}

/// column bases of a merge keyed by serum name
pub fn extract_column_bases(
    store: &dyn ChartStore,
    path: &Path,
    minimum: &MinimumColumnBasis,
) -> Result<ColumnBasisMap, ChartError> {
    Ok(store.column_bases(path, minimum)?.into_iter().collect())
}
