//! Feature-barcode count matrix held in compressed sparse column form.
//!
//! Rows are features (genes) and columns are barcodes (cells). Each column
//! owns the half-open range `indptr[j]..indptr[j + 1]` of the shared `data`
//! and `indices` arrays.

use fxhash::FxHashMap;
use itertools::Itertools;
use log::debug;
use ndarray::{Array1, Array2};
use std::ops::Range;

pub mod error;
pub mod filter;

pub use error::MatrixError;
pub use filter::{BarcodeColumn, BarcodeFilter, FilteredMatrix};

/// Type of a stored count.
pub type CountType = i32;
/// Type of the row indices and column pointers, as laid out on disk.
pub type IndexType = i64;

/// A single stored entry of the matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawCount {
    pub count: CountType,
    pub barcode_idx: usize,
    pub feature_idx: usize,
}

/// Shape and fill of a matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatrixDimensions {
    pub num_features: usize,
    pub num_barcodes: usize,
    pub num_nonzeros: usize,
}

impl MatrixDimensions {
    /// Memory in GiB needed to hold a `CountMatrix` of these dimensions,
    /// including labels and the barcode index.
    pub fn estimate_mem_gib(&self) -> f64 {
        // i32 count + i64 row index
        const BYTES_PER_NONZERO: f64 = 12.0;
        // i64 pointer, barcode string and its index entry
        const BYTES_PER_BARCODE: f64 = 8.0 + 2.0 * 48.0 + 16.0;
        const BYTES_PER_FEATURE: f64 = 48.0;
        (BYTES_PER_NONZERO * self.num_nonzeros as f64
            + BYTES_PER_BARCODE * self.num_barcodes as f64
            + BYTES_PER_FEATURE * self.num_features as f64)
            / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Storage that a `CountMatrix` can be loaded from and saved to.
pub trait MatrixContainer {
    type Error;

    fn load(&self) -> Result<CountMatrix, Self::Error>;

    fn save(&self, matrix: &CountMatrix) -> Result<(), Self::Error>;
}

/// Compressed sparse column matrix of counts with feature and barcode labels.
#[derive(Clone, Debug)]
pub struct CountMatrix {
    data: Vec<CountType>,
    indices: Vec<IndexType>,
    indptr: Vec<IndexType>,
    feature_names: Vec<String>,
    /// Stable feature identifiers (e.g. Ensembl gene IDs), one per row.
    feature_ids: Vec<String>,
    barcodes: Vec<String>,
    /// Column of each barcode. `None` until `build_index` runs and again
    /// whenever the barcodes are replaced.
    barcode_index: Option<FxHashMap<String, usize>>,
}

impl Default for CountMatrix {
    fn default() -> Self {
        CountMatrix {
            data: Vec::new(),
            indices: Vec::new(),
            indptr: vec![0],
            feature_names: Vec::new(),
            feature_ids: Vec::new(),
            barcodes: Vec::new(),
            barcode_index: None,
        }
    }
}

/// Two matrices are equal when their arrays and labels are, whether or not
/// their barcode indices have been built.
impl PartialEq for CountMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.indices == other.indices
            && self.indptr == other.indptr
            && self.feature_names == other.feature_names
            && self.feature_ids == other.feature_ids
            && self.barcodes == other.barcodes
    }
}

impl Eq for CountMatrix {}

fn check_layout(
    data: &[CountType],
    indices: &[IndexType],
    indptr: &[IndexType],
    num_features: usize,
    num_barcodes: usize,
) -> Result<(), MatrixError> {
    let malformed = |msg: String| Err(MatrixError::Malformed(msg));

    if indptr.len() != num_barcodes + 1 {
        return malformed(format!(
            "indptr has {} entries but there are {num_barcodes} barcodes",
            indptr.len()
        ));
    }
    if indptr[0] != 0 {
        return malformed(format!("indptr starts at {} instead of 0", indptr[0]));
    }
    if data.len() != indices.len() {
        return malformed(format!(
            "data has {} entries but indices has {}",
            data.len(),
            indices.len()
        ));
    }
    if let Some((column, (start, end))) = indptr
        .iter()
        .tuple_windows()
        .enumerate()
        .find(|(_, (start, end))| end < start)
    {
        return malformed(format!(
            "indptr decreases from {start} to {end} at column {column}"
        ));
    }
    let nnz = indptr[num_barcodes];
    if usize::try_from(nnz).ok() != Some(data.len()) {
        return malformed(format!(
            "indptr ends at {nnz} but {} entries are stored",
            data.len()
        ));
    }

    // Column (plus one) that last set each row, to catch repeats within a column.
    let mut last_seen = vec![0usize; num_features];
    for (column, (&start, &end)) in indptr.iter().tuple_windows().enumerate() {
        for &row in &indices[start as usize..end as usize] {
            let Some(seen) = usize::try_from(row)
                .ok()
                .and_then(|row| last_seen.get_mut(row))
            else {
                return malformed(format!(
                    "row index {row} in column {column} is outside [0, {num_features})"
                ));
            };
            if *seen == column + 1 {
                return malformed(format!("row {row} is stored twice in column {column}"));
            }
            *seen = column + 1;
        }
    }
    Ok(())
}

impl CountMatrix {
    /// Assemble a matrix from its compressed arrays and labels, validating the
    /// layout and building the barcode index. Feature IDs start out as copies
    /// of the feature names; see `with_feature_ids`.
    pub fn new(
        data: Vec<CountType>,
        indices: Vec<IndexType>,
        indptr: Vec<IndexType>,
        feature_names: Vec<String>,
        barcodes: Vec<String>,
    ) -> Result<Self, MatrixError> {
        check_layout(
            &data,
            &indices,
            &indptr,
            feature_names.len(),
            barcodes.len(),
        )?;
        let mut matrix = CountMatrix {
            data,
            indices,
            indptr,
            feature_ids: feature_names.clone(),
            feature_names,
            barcodes,
            barcode_index: None,
        };
        matrix.build_index()?;
        Ok(matrix)
    }

    /// Build a matrix from `(feature_idx, count)` lists, one per barcode.
    pub fn from_columns<I, C>(
        feature_names: Vec<String>,
        barcodes: Vec<String>,
        columns: I,
    ) -> Result<Self, MatrixError>
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = (usize, CountType)>,
    {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0];
        for column in columns {
            for (feature_idx, count) in column {
                indices.push(feature_idx as IndexType);
                data.push(count);
            }
            indptr.push(data.len() as IndexType);
        }
        Self::new(data, indices, indptr, feature_names, barcodes)
    }

    /// (Re)build the barcode to column index.
    pub fn build_index(&mut self) -> Result<(), MatrixError> {
        self.barcode_index = None;
        let mut index = FxHashMap::default();
        index.reserve(self.barcodes.len());
        for (column, barcode) in self.barcodes.iter().enumerate() {
            if let Some(first) = index.insert(barcode.clone(), column) {
                return Err(MatrixError::DuplicateBarcode {
                    barcode: barcode.clone(),
                    first,
                    second: column,
                });
            }
        }
        debug!("indexed {} barcodes", index.len());
        self.barcode_index = Some(index);
        Ok(())
    }

    /// Replace the feature IDs. There must be one per feature.
    pub fn with_feature_ids(mut self, feature_ids: Vec<String>) -> Result<Self, MatrixError> {
        if feature_ids.len() != self.num_features() {
            return Err(MatrixError::Malformed(format!(
                "{} feature ids given for a matrix with {} features",
                feature_ids.len(),
                self.num_features()
            )));
        }
        self.feature_ids = feature_ids;
        Ok(self)
    }

    pub fn has_index(&self) -> bool {
        self.barcode_index.is_some()
    }

    /// Replace the barcode labels. The barcode index is dropped and must be
    /// rebuilt before any lookup by name.
    pub fn set_barcodes(&mut self, barcodes: Vec<String>) -> Result<(), MatrixError> {
        if barcodes.len() != self.num_barcodes() {
            return Err(MatrixError::Malformed(format!(
                "{} barcodes given for a matrix with {} columns",
                barcodes.len(),
                self.num_barcodes()
            )));
        }
        self.barcodes = barcodes;
        self.barcode_index = None;
        Ok(())
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    pub fn data(&self) -> &[CountType] {
        &self.data
    }

    pub fn indices(&self) -> &[IndexType] {
        &self.indices
    }

    pub fn indptr(&self) -> &[IndexType] {
        &self.indptr
    }

    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn num_barcodes(&self) -> usize {
        self.barcodes.len()
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn dimensions(&self) -> MatrixDimensions {
        MatrixDimensions {
            num_features: self.num_features(),
            num_barcodes: self.num_barcodes(),
            num_nonzeros: self.nnz(),
        }
    }

    /// Barcode labelling a column.
    pub fn barcode(&self, column: usize) -> Result<&str, MatrixError> {
        self.barcodes
            .get(column)
            .map(String::as_str)
            .ok_or(MatrixError::IndexOutOfRange {
                column,
                num_barcodes: self.num_barcodes(),
            })
    }

    /// Column labelled by a barcode.
    pub fn barcode_column(&self, barcode: &str) -> Result<usize, MatrixError> {
        self.barcode_index
            .as_ref()
            .ok_or(MatrixError::IndexNotBuilt)?
            .get(barcode)
            .copied()
            .ok_or_else(|| MatrixError::UnknownBarcode(barcode.to_string()))
    }

    fn column_range(&self, column: usize) -> Result<Range<usize>, MatrixError> {
        if column >= self.num_barcodes() {
            return Err(MatrixError::IndexOutOfRange {
                column,
                num_barcodes: self.num_barcodes(),
            });
        }
        Ok(self.indptr[column] as usize..self.indptr[column + 1] as usize)
    }

    /// Sparse view of one column.
    pub fn column(&self, column: usize) -> Result<BarcodeColumn<'_>, MatrixError> {
        let range = self.column_range(column)?;
        Ok(BarcodeColumn::new(
            column,
            &self.barcodes[column],
            &self.indices[range.clone()],
            &self.data[range],
        ))
    }

    /// Sparse views of every column, in column order.
    pub fn columns(&self) -> impl Iterator<Item = BarcodeColumn<'_>> + '_ {
        self.indptr
            .iter()
            .tuple_windows()
            .zip(&self.barcodes)
            .enumerate()
            .map(|(column, ((&start, &end), barcode))| {
                let range = start as usize..end as usize;
                BarcodeColumn::new(
                    column,
                    barcode,
                    &self.indices[range.clone()],
                    &self.data[range],
                )
            })
    }

    /// Dense counts of one barcode over all features. Features without a
    /// stored entry are zero.
    pub fn column_vector(&self, column: usize) -> Result<Array1<CountType>, MatrixError> {
        let range = self.column_range(column)?;
        let mut vector = Array1::zeros(self.num_features());
        for (&row, &count) in self.indices[range.clone()].iter().zip(&self.data[range]) {
            vector[row as usize] = count;
        }
        Ok(vector)
    }

    /// Dense counts of the barcode with the given name.
    pub fn column_vector_by_name(&self, barcode: &str) -> Result<Array1<CountType>, MatrixError> {
        self.column_vector(self.barcode_column(barcode)?)
    }

    /// Dense `num_features x barcodes.len()` block, one column per requested
    /// barcode in the order given.
    pub fn column_vectors_by_name<S: AsRef<str>>(
        &self,
        barcodes: &[S],
    ) -> Result<Array2<CountType>, MatrixError> {
        let columns: Vec<_> = barcodes
            .iter()
            .map(|barcode| self.barcode_column(barcode.as_ref()))
            .try_collect()?;
        let mut block = Array2::zeros((self.num_features(), columns.len()));
        for (out_col, &column) in columns.iter().enumerate() {
            let range = self.column_range(column)?;
            for (&row, &count) in self.indices[range.clone()].iter().zip(&self.data[range]) {
                block[[row as usize, out_col]] = count;
            }
        }
        Ok(block)
    }

    /// Every stored entry, column by column.
    pub fn raw_counts(&self) -> impl Iterator<Item = RawCount> + '_ {
        self.columns().flat_map(|column| {
            let barcode_idx = column.index();
            column
                .rows()
                .iter()
                .zip(column.counts())
                .map(move |(&row, &count)| RawCount {
                    count,
                    barcode_idx,
                    feature_idx: row as usize,
                })
        })
    }

    /// Sum of the counts of each barcode.
    pub fn barcode_totals(&self) -> Vec<i64> {
        self.columns().map(|column| column.total()).collect()
    }

    /// Number of features with a nonzero count in each barcode.
    pub fn features_per_barcode(&self) -> Vec<usize> {
        self.columns()
            .map(|column| column.num_features_detected())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{arb_matrix, matrix_from_columns, small_matrix};
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::cell::RefCell;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_small_matrix_layout() {
        let matrix = small_matrix();
        assert_eq!(matrix.data(), &[5, 2, 7]);
        assert_eq!(matrix.indices(), &[0, 1, 2]);
        assert_eq!(matrix.indptr(), &[0, 1, 3, 3]);
        assert_eq!(
            matrix.dimensions(),
            MatrixDimensions {
                num_features: 3,
                num_barcodes: 3,
                num_nonzeros: 3,
            }
        );
        assert!(matrix.has_index());
    }

    #[test]
    fn test_column_vector() {
        let matrix = small_matrix();
        assert_eq!(matrix.column_vector(0).unwrap(), array![5, 0, 0]);
        assert_eq!(matrix.column_vector(1).unwrap(), array![0, 2, 7]);
        assert_eq!(matrix.column_vector(2).unwrap(), array![0, 0, 0]);
        assert_eq!(
            matrix.column_vector(3),
            Err(MatrixError::IndexOutOfRange {
                column: 3,
                num_barcodes: 3
            })
        );
    }

    #[test]
    fn test_column_vector_by_name() {
        let matrix = small_matrix();
        assert_eq!(
            matrix.column_vector_by_name("bc-1").unwrap(),
            array![0, 2, 7]
        );
        assert_eq!(
            matrix.column_vector_by_name("AAACCTGAGAAACCAT-1"),
            Err(MatrixError::UnknownBarcode("AAACCTGAGAAACCAT-1".to_string()))
        );
    }

    #[test]
    fn test_column_vectors_by_name() {
        let matrix = small_matrix();
        let block = matrix.column_vectors_by_name(&["bc-1", "bc-0"]).unwrap();
        assert_eq!(block, array![[0, 5], [2, 0], [7, 0]]);
        assert!(matrix.column_vectors_by_name(&["bc-0", "bc-9"]).is_err());
    }

    #[test]
    fn test_reverse_lookup() {
        let matrix = small_matrix();
        assert_eq!(matrix.barcode(2).unwrap(), "bc-2");
        assert_eq!(matrix.barcode_column("bc-2").unwrap(), 2);
        assert!(matrix.barcode(3).is_err());
    }

    #[test]
    fn test_index_invalidated_by_new_barcodes() {
        let mut matrix = small_matrix();
        matrix.set_barcodes(names("cell", 3)).unwrap();
        assert!(!matrix.has_index());
        assert_eq!(
            matrix.column_vector_by_name("cell1"),
            Err(MatrixError::IndexNotBuilt)
        );
        // Positional access does not need the index.
        assert_eq!(matrix.column_vector(1).unwrap(), array![0, 2, 7]);

        matrix.build_index().unwrap();
        assert_eq!(
            matrix.column_vector_by_name("cell1").unwrap(),
            array![0, 2, 7]
        );
        assert!(matrix.column_vector_by_name("bc-1").is_err());

        assert!(matches!(
            matrix.set_barcodes(names("cell", 2)),
            Err(MatrixError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_barcodes() {
        let err = CountMatrix::new(
            vec![1, 1],
            vec![0, 0],
            vec![0, 1, 2],
            names("g", 1),
            vec!["AAAC-1".to_string(), "AAAC-1".to_string()],
        )
        .unwrap_err();
        assert_eq!(
            err,
            MatrixError::DuplicateBarcode {
                barcode: "AAAC-1".to_string(),
                first: 0,
                second: 1,
            }
        );

        let mut matrix = small_matrix();
        matrix
            .set_barcodes(vec!["a".into(), "b".into(), "a".into()])
            .unwrap();
        assert!(matches!(
            matrix.build_index(),
            Err(MatrixError::DuplicateBarcode { first: 0, second: 2, .. })
        ));
        assert!(!matrix.has_index());
    }

    #[test]
    fn test_malformed_layouts() {
        let check = |data: Vec<i32>, indices: Vec<i64>, indptr: Vec<i64>| {
            CountMatrix::new(data, indices, indptr, names("g", 3), names("bc", 2))
        };
        let is_malformed = |r: Result<CountMatrix, MatrixError>| {
            matches!(r, Err(MatrixError::Malformed(_)))
        };
        // indptr too short
        assert!(is_malformed(check(vec![1], vec![0], vec![0, 1])));
        // indptr does not start at zero
        assert!(is_malformed(check(vec![1], vec![0], vec![1, 1, 1])));
        // indptr decreasing
        assert!(is_malformed(check(vec![1, 2], vec![0, 1], vec![0, 2, 1])));
        // indptr does not end at nnz
        assert!(is_malformed(check(vec![1, 2], vec![0, 1], vec![0, 1, 1])));
        // data and indices disagree
        assert!(is_malformed(check(vec![1, 2], vec![0], vec![0, 1, 2])));
        // row out of range, both sides
        assert!(is_malformed(check(vec![1], vec![3], vec![0, 1, 1])));
        assert!(is_malformed(check(vec![1], vec![-1], vec![0, 1, 1])));
        // duplicate row within a column
        assert!(is_malformed(check(vec![1, 2], vec![2, 2], vec![0, 2, 2])));
        // the same row in two different columns is fine
        assert!(check(vec![1, 2], vec![2, 2], vec![0, 1, 2]).is_ok());
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = CountMatrix::default();
        assert_eq!(matrix.dimensions(), MatrixDimensions::default());
        assert_eq!(matrix.indptr(), &[0]);
        assert!(matrix.column_vector(0).is_err());
        assert_eq!(
            matrix.column_vector_by_name("x"),
            Err(MatrixError::IndexNotBuilt)
        );
        assert_eq!(
            CountMatrix::new(vec![], vec![], vec![0], vec![], vec![]).unwrap(),
            matrix
        );
    }

    #[test]
    fn test_raw_counts_and_stats() {
        let matrix = matrix_from_columns(4, &[vec![(3, 1), (0, 4)], vec![], vec![(2, 9), (1, 0)]]);
        let raw: Vec<_> = matrix
            .raw_counts()
            .map(|c| (c.barcode_idx, c.feature_idx, c.count))
            .collect();
        assert_eq!(raw, vec![(0, 3, 1), (0, 0, 4), (2, 2, 9), (2, 1, 0)]);
        assert_eq!(matrix.barcode_totals(), vec![5, 0, 9]);
        // An explicitly stored zero is not a detected feature.
        assert_eq!(matrix.features_per_barcode(), vec![2, 0, 1]);
    }

    #[test]
    fn test_estimate_mem() {
        let dims = MatrixDimensions {
            num_features: 0,
            num_barcodes: 0,
            num_nonzeros: 1 << 30,
        };
        assert!((dims.estimate_mem_gib() - 12.0).abs() < 1e-9);
        assert!(MatrixDimensions::default().estimate_mem_gib() == 0.0);
    }

    /// Container keeping a copy of the last saved matrix.
    #[derive(Default)]
    struct MemoryContainer(RefCell<Option<CountMatrix>>);

    impl MatrixContainer for MemoryContainer {
        type Error = MatrixError;

        fn load(&self) -> Result<CountMatrix, MatrixError> {
            let saved = self.0.borrow();
            let m = saved
                .as_ref()
                .ok_or_else(|| MatrixError::Malformed("nothing saved".into()))?;
            CountMatrix::new(
                m.data().to_vec(),
                m.indices().to_vec(),
                m.indptr().to_vec(),
                m.feature_names().to_vec(),
                m.barcodes().to_vec(),
            )?
            .with_feature_ids(m.feature_ids().to_vec())
        }

        fn save(&self, matrix: &CountMatrix) -> Result<(), MatrixError> {
            *self.0.borrow_mut() = Some(matrix.clone());
            Ok(())
        }
    }

    #[test]
    fn test_container_contract() {
        let container = MemoryContainer::default();
        assert!(container.load().is_err());
        let ids = names("ENSG0000", 3);
        let matrix = small_matrix().with_feature_ids(ids).unwrap();
        container.save(&matrix).unwrap();
        let loaded = container.load().unwrap();
        assert_eq!(loaded, matrix);
        assert_eq!(loaded.feature_ids(), &["ENSG00000", "ENSG00001", "ENSG00002"]);
        assert!(loaded.has_index());
    }

    #[test]
    fn test_feature_ids() {
        let matrix = small_matrix();
        assert_eq!(matrix.feature_ids(), matrix.feature_names());

        let ids = names("ENSG", 3);
        let with_ids = matrix.clone().with_feature_ids(ids).unwrap();
        assert_eq!(with_ids.feature_ids(), &["ENSG0", "ENSG1", "ENSG2"]);
        assert_eq!(with_ids.feature_names(), matrix.feature_names());
        assert_ne!(with_ids, matrix);

        assert!(matches!(
            matrix.with_feature_ids(names("ENSG", 2)),
            Err(MatrixError::Malformed(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_indptr_well_formed(matrix in arb_matrix()) {
            let indptr = matrix.indptr();
            prop_assert_eq!(indptr[0], 0);
            prop_assert_eq!(*indptr.last().unwrap() as usize, matrix.nnz());
            prop_assert!(indptr.iter().tuple_windows().all(|(a, b)| a <= b));
        }

        #[test]
        fn prop_column_vector_matches_slice(matrix in arb_matrix()) {
            for column in 0..matrix.num_barcodes() {
                let vector = matrix.column_vector(column).unwrap();
                let view = matrix.column(column).unwrap();
                let mut expected = vec![0; matrix.num_features()];
                for (&row, &count) in view.rows().iter().zip(view.counts()) {
                    expected[row as usize] = count;
                }
                prop_assert_eq!(vector.to_vec(), expected);
            }
        }

        #[test]
        fn prop_lookup_by_name_matches_position(matrix in arb_matrix()) {
            for (column, barcode) in matrix.barcodes().iter().enumerate() {
                prop_assert_eq!(
                    matrix.column_vector_by_name(barcode).unwrap(),
                    matrix.column_vector(column).unwrap()
                );
            }
        }
    }
}
