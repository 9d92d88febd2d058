use crate::attribute_names::{FILETYPE, VERSION};
use crate::attributes::{MATRIX_FILETYPE, MATRIX_H5_VERSION};
use crate::dataset_names::{
    BARCODES, DATA, FEATURE_ID, FEATURE_NAME, FEATURE_TYPE, INDICES, INDPTR, SHAPE,
};
use crate::group_names::{FEATURES, MATRIX};
use crate::{scalar_attribute, GENE_EXPRESSION_FEATURE_TYPE};
use anyhow::{ensure, Context, Result};
use count_matrix::CountMatrix;
use hdf5::types::{FixedAscii, VarLenUnicode};
use hdf5::{Extent, File, Group, H5Type};
use ndarray::ArrayView1;
use std::iter::repeat_n;
use std::path::Path;
use std::str::FromStr;

type FA256 = FixedAscii<256>;

/// Chunking and compression of the datasets written.
struct ColumnWriter {
    chunk_size: usize,
    deflate_level: u8,
}

impl ColumnWriter {
    fn from_parameters() -> Result<Self> {
        let chunk_size = *parameters_toml::h5_chunk_size()?;
        let deflate_level = *parameters_toml::h5_deflate_level()?;
        ensure!(chunk_size > 0, "h5_chunk_size must be positive");
        ensure!(deflate_level <= 9, "h5_deflate_level must be at most 9");
        Ok(ColumnWriter {
            chunk_size,
            deflate_level,
        })
    }

    fn write<T: H5Type>(&self, group: &Group, name: &str, values: &[T]) -> Result<()> {
        let dataset = group
            .new_dataset::<T>()
            .shuffle()
            .deflate(self.deflate_level)
            .shape(Extent::new(values.len(), None))
            .chunk(self.chunk_size)
            .create(name)
            .with_context(|| format!("While creating dataset {name}"))?;
        if !values.is_empty() {
            dataset
                .as_writer()
                .write(ArrayView1::from(values))
                .with_context(|| format!("While writing dataset {name}"))?;
        }
        Ok(())
    }
}

fn fixed_strings<S: AsRef<str>>(
    name: &str,
    values: impl IntoIterator<Item = S>,
) -> Result<Vec<FA256>> {
    values
        .into_iter()
        .map(|s| {
            let s = s.as_ref();
            FA256::from_ascii(s.as_bytes())
                .with_context(|| format!("'{s}' cannot be stored in dataset {name}"))
        })
        .collect()
}

/// String datasets of a matrix, encoded for storage.
struct Labels {
    barcodes: Vec<FA256>,
    feature_ids: Vec<FA256>,
    feature_names: Vec<FA256>,
    feature_types: Vec<FA256>,
}

impl Labels {
    fn encode(matrix: &CountMatrix) -> Result<Self> {
        Ok(Labels {
            barcodes: fixed_strings(BARCODES, matrix.barcodes())?,
            feature_ids: fixed_strings(FEATURE_ID, matrix.feature_ids())?,
            feature_names: fixed_strings(FEATURE_NAME, matrix.feature_names())?,
            feature_types: fixed_strings(
                FEATURE_TYPE,
                repeat_n(GENE_EXPRESSION_FEATURE_TYPE, matrix.num_features()),
            )?,
        })
    }
}

pub(crate) fn write_matrix(path: &Path, matrix: &CountMatrix) -> Result<()> {
    let writer = ColumnWriter::from_parameters()?;
    // Everything that can be rejected is checked before an existing file is truncated.
    let labels = Labels::encode(matrix)?;
    let shape = [
        i32::try_from(matrix.num_features()).context("too many features")?,
        i32::try_from(matrix.num_barcodes()).context("too many barcodes")?,
    ];
    let filetype = VarLenUnicode::from_str(MATRIX_FILETYPE)?;

    let file = File::create(path)?;

    scalar_attribute(&file, FILETYPE, filetype)?;
    scalar_attribute(&file, VERSION, MATRIX_H5_VERSION)?;

    let group = file.create_group(MATRIX)?;
    writer.write(&group, DATA, matrix.data())?;
    writer.write(&group, INDICES, matrix.indices())?;
    writer.write(&group, INDPTR, matrix.indptr())?;
    group
        .new_dataset::<i32>()
        .shape(shape.len())
        .create(SHAPE)?
        .as_writer()
        .write(ArrayView1::from(&shape[..]))?;
    writer.write(&group, BARCODES, &labels.barcodes)?;

    let features = group.create_group(FEATURES)?;
    writer.write(&features, FEATURE_ID, &labels.feature_ids)?;
    writer.write(&features, FEATURE_NAME, &labels.feature_names)?;
    writer.write(&features, FEATURE_TYPE, &labels.feature_types)?;

    file.flush()?;
    Ok(())
}
