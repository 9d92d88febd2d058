//! Read and write a feature-barcode count matrix as an HDF5 file.
//!
//! Files are written in the layout of a 10x feature-barcode matrix:
//!
//! ```text
//! /matrix/data                 int32   [nnz]
//! /matrix/indices              int64   [nnz]
//! /matrix/indptr               int64   [num_barcodes + 1]
//! /matrix/shape                int32   [2]
//! /matrix/barcodes             string  [num_barcodes]
//! /matrix/features/id          string  [num_features]
//! /matrix/features/name        string  [num_features]
//! /matrix/features/feature_type string [num_features]
//! ```
//!
//! Older single-genome files, with the arrays, `genes` and `gene_names` stored
//! in one group named after the genome, can be read as well.

use anyhow::Result;
use count_matrix::{CountMatrix, MatrixContainer, MatrixDimensions};
use hdf5::{Attribute, File, H5Type, Location};
use log::info;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod read;
mod write;

pub mod attribute_names {
    pub const FILETYPE: &str = "filetype";
    pub const VERSION: &str = "version";
}

pub mod attributes {
    pub const MATRIX_FILETYPE: &str = "matrix";
    pub const MATRIX_H5_VERSION: i64 = 2;
}

pub mod group_names {
    pub const MATRIX: &str = "matrix";
    pub const FEATURES: &str = "features";
}

pub mod dataset_names {
    pub const DATA: &str = "data";
    pub const INDICES: &str = "indices";
    pub const INDPTR: &str = "indptr";
    pub const SHAPE: &str = "shape";
    pub const BARCODES: &str = "barcodes";
    pub const FEATURE_ID: &str = "id";
    pub const FEATURE_NAME: &str = "name";
    pub const FEATURE_TYPE: &str = "feature_type";
    pub const LEGACY_GENE_NAMES: &str = "gene_names";
    pub const LEGACY_GENE_IDS: &str = "genes";
}

pub const GENE_EXPRESSION_FEATURE_TYPE: &str = "Gene Expression";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum MatrixH5Error {
    #[error("unable to open matrix h5 {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: hdf5::Error,
    },

    /// The file opened but its contents are not a valid count matrix.
    #[error("malformed matrix h5 {}", .path.display())]
    MalformedContainer {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to write matrix h5 {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// Write a scalar attribute on a file, group or dataset.
pub fn scalar_attribute<T: H5Type>(location: &Location, name: &str, value: T) -> Result<Attribute> {
    let attr = location.new_attr::<T>().shape(()).create(name)?;
    attr.write_scalar(&value)?;
    Ok(attr)
}

/// A count matrix stored in an HDF5 file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountMatrixFile(PathBuf);

impl AsRef<Path> for CountMatrixFile {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for CountMatrixFile {
    fn from(path: PathBuf) -> Self {
        CountMatrixFile(path)
    }
}

impl CountMatrixFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CountMatrixFile(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    fn open(&self) -> Result<File, MatrixH5Error> {
        File::open(&self.0).map_err(|source| MatrixH5Error::Open {
            path: self.0.clone(),
            source,
        })
    }

    fn malformed(&self, err: anyhow::Error) -> MatrixH5Error {
        MatrixH5Error::MalformedContainer {
            path: self.0.clone(),
            source: err.into(),
        }
    }

    /// Load the whole matrix. The barcode index of the result is built.
    pub fn read(&self) -> Result<CountMatrix, MatrixH5Error> {
        let file = self.open()?;
        let matrix = read::read_matrix(&file).map_err(|err| self.malformed(err))?;
        let MatrixDimensions {
            num_features,
            num_barcodes,
            num_nonzeros,
        } = matrix.dimensions();
        info!(
            "read {num_features} features x {num_barcodes} barcodes ({num_nonzeros} nonzero) from {}",
            self.0.display()
        );
        Ok(matrix)
    }

    /// Create or truncate the file and store the matrix in it.
    pub fn write(&self, matrix: &CountMatrix) -> Result<(), MatrixH5Error> {
        write::write_matrix(&self.0, matrix).map_err(|err| MatrixH5Error::Write {
            path: self.0.clone(),
            source: err.into(),
        })?;
        info!(
            "wrote {} features x {} barcodes to {}",
            matrix.num_features(),
            matrix.num_barcodes(),
            self.0.display()
        );
        Ok(())
    }

    /// Dimensions of the stored matrix, without loading its arrays.
    pub fn load_dimensions(&self) -> Result<MatrixDimensions, MatrixH5Error> {
        let file = self.open()?;
        read::read_dimensions(&file).map_err(|err| self.malformed(err))
    }

    pub fn read_barcodes(&self) -> Result<Vec<String>, MatrixH5Error> {
        let file = self.open()?;
        read::read_barcodes(&file).map_err(|err| self.malformed(err))
    }

    pub fn read_feature_names(&self) -> Result<Vec<String>, MatrixH5Error> {
        let file = self.open()?;
        read::read_feature_names(&file).map_err(|err| self.malformed(err))
    }

    /// Feature IDs, falling back to the names for files that store no IDs.
    pub fn read_feature_ids(&self) -> Result<Vec<String>, MatrixH5Error> {
        let file = self.open()?;
        read::read_feature_ids(&file).map_err(|err| self.malformed(err))
    }
}

impl MatrixContainer for CountMatrixFile {
    type Error = MatrixH5Error;

    fn load(&self) -> Result<CountMatrix, MatrixH5Error> {
        self.read()
    }

    fn save(&self, matrix: &CountMatrix) -> Result<(), MatrixH5Error> {
        self.write(matrix)
    }
}
