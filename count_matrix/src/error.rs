use thiserror::Error;

/// Failures of the in-memory count matrix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// A barcode labels more than one column.
    #[error("barcode {barcode} labels both column {first} and column {second}")]
    DuplicateBarcode {
        barcode: String,
        first: usize,
        second: usize,
    },

    /// A lookup by barcode was attempted while the barcode index is absent.
    #[error("the barcode index has not been built")]
    IndexNotBuilt,

    #[error("column {column} is out of range for a matrix with {num_barcodes} barcodes")]
    IndexOutOfRange { column: usize, num_barcodes: usize },

    #[error("barcode {0} is not present in the matrix")]
    UnknownBarcode(String),

    /// The compressed arrays or label lists are inconsistent with each other.
    #[error("malformed count matrix: {0}")]
    Malformed(String),
}
