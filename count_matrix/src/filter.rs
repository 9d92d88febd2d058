//! Column (barcode) filtration.

use crate::{CountMatrix, CountType, IndexType};
use anyhow::Result;
use fxhash::FxHashMap;
use log::info;

/// Sparse view of the stored entries of one barcode.
#[derive(Clone, Copy, Debug)]
pub struct BarcodeColumn<'a> {
    index: usize,
    barcode: &'a str,
    rows: &'a [IndexType],
    counts: &'a [CountType],
}

impl<'a> BarcodeColumn<'a> {
    pub(crate) fn new(
        index: usize,
        barcode: &'a str,
        rows: &'a [IndexType],
        counts: &'a [CountType],
    ) -> Self {
        BarcodeColumn {
            index,
            barcode,
            rows,
            counts,
        }
    }

    /// Column index in the matrix this view was taken from.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn barcode(&self) -> &'a str {
        self.barcode
    }

    /// Feature rows of the stored entries.
    pub fn rows(&self) -> &'a [IndexType] {
        self.rows
    }

    pub fn counts(&self) -> &'a [CountType] {
        self.counts
    }

    pub fn total(&self) -> i64 {
        self.counts.iter().map(|&c| i64::from(c)).sum()
    }

    /// Features with a nonzero count. Explicitly stored zeros are not counted.
    pub fn num_features_detected(&self) -> usize {
        self.counts.iter().filter(|&&c| c != 0).count()
    }
}

/// Result of filtering the columns of a matrix.
#[derive(Clone, Debug)]
pub struct FilteredMatrix {
    pub matrix: CountMatrix,
    /// Original column of each retained column, in new column order.
    pub kept_columns: Vec<usize>,
}

impl FilteredMatrix {
    /// Map from original column to its column in the filtered matrix.
    pub fn original_to_new(&self) -> FxHashMap<usize, usize> {
        self.kept_columns
            .iter()
            .enumerate()
            .map(|(new, &original)| (original, new))
            .collect()
    }
}

/// Thresholds of the cell filtration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarcodeFilter {
    /// Minimum sum of counts.
    pub min_counts: i64,
    /// Minimum number of features with a nonzero count.
    pub min_features: usize,
}

/// Keeps every barcode with at least one nonzero count.
impl Default for BarcodeFilter {
    fn default() -> Self {
        BarcodeFilter {
            min_counts: 1,
            min_features: 1,
        }
    }
}

impl BarcodeFilter {
    /// Thresholds configured in parameters.toml.
    pub fn from_parameters() -> Result<Self> {
        Ok(BarcodeFilter {
            min_counts: *parameters_toml::min_counts_per_barcode()?,
            min_features: *parameters_toml::min_features_per_barcode()?,
        })
    }

    pub fn accepts(&self, column: &BarcodeColumn<'_>) -> bool {
        column.total() >= self.min_counts && column.num_features_detected() >= self.min_features
    }
}

impl CountMatrix {
    /// New matrix holding only the columns for which `keep` returns true,
    /// in their original order. Row indices are carried over unchanged.
    pub fn filter_barcodes<F>(&self, keep: F) -> FilteredMatrix
    where
        F: FnMut(&BarcodeColumn<'_>) -> bool,
    {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(self.num_barcodes() + 1);
        indptr.push(0);
        let mut barcodes = Vec::new();
        let mut kept_columns = Vec::new();

        for column in self.columns().filter(keep) {
            data.extend_from_slice(column.counts());
            indices.extend_from_slice(column.rows());
            indptr.push(data.len() as IndexType);
            barcodes.push(column.barcode().to_string());
            kept_columns.push(column.index());
        }

        // A subset of indexed (hence unique) barcodes can be indexed directly.
        let barcode_index = self.has_index().then(|| {
            barcodes
                .iter()
                .enumerate()
                .map(|(column, barcode)| (barcode.clone(), column))
                .collect()
        });

        info!(
            "kept {} of {} barcodes",
            kept_columns.len(),
            self.num_barcodes()
        );
        FilteredMatrix {
            matrix: CountMatrix {
                data,
                indices,
                indptr,
                feature_names: self.feature_names.clone(),
                feature_ids: self.feature_ids.clone(),
                barcodes,
                barcode_index,
            },
            kept_columns,
        }
    }

    /// Cell filtration: keep barcodes passing the count and feature thresholds.
    pub fn cell_filtration(&self, filter: &BarcodeFilter) -> FilteredMatrix {
        self.filter_barcodes(|column| filter.accepts(column))
    }
}
