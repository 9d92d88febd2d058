use crate::dataset_names::{
    BARCODES, DATA, FEATURE_ID, FEATURE_NAME, INDICES, INDPTR, LEGACY_GENE_IDS,
    LEGACY_GENE_NAMES, SHAPE,
};
use crate::group_names::{FEATURES, MATRIX};
use anyhow::{bail, ensure, Context, Result};
use count_matrix::{CountMatrix, MatrixDimensions};
use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group, H5Type};
use itertools::Itertools;
use log::debug;

/// Longest fixed-length string that is read without truncation.
const MAX_STRING_LEN: usize = 256;
type FA256 = FixedAscii<MAX_STRING_LEN>;
type FU256 = FixedUnicode<MAX_STRING_LEN>;

/// Where the arrays and the labels live inside the file.
struct MatrixGroup {
    group: Group,
    legacy: bool,
}

fn find_matrix_group(file: &File) -> Result<MatrixGroup> {
    if file.link_exists(MATRIX) {
        return Ok(MatrixGroup {
            group: file.group(MATRIX)?,
            legacy: false,
        });
    }
    // Older files keep the matrix in a group named after the genome.
    let candidates: Vec<_> = file
        .member_names()?
        .into_iter()
        .filter_map(|name| file.group(&name).ok())
        .filter(|group| group.link_exists(INDPTR))
        .collect();
    match <[Group; 1]>::try_from(candidates) {
        Ok([group]) => {
            debug!("reading legacy matrix group {}", group.name());
            Ok(MatrixGroup {
                group,
                legacy: true,
            })
        }
        Err(candidates) if candidates.is_empty() => {
            bail!("no '{MATRIX}' group and no group containing '{INDPTR}'")
        }
        Err(candidates) => bail!(
            "found several matrix groups: {}",
            candidates.iter().map(|group| group.name()).join(", ")
        ),
    }
}

fn read_column<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    let dataset = group
        .dataset(name)
        .with_context(|| format!("While opening dataset {name}"))?;
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    dataset
        .read_raw::<T>()
        .with_context(|| format!("While reading dataset {name}"))
}

/// Read a 1-D dataset of fixed or variable length strings.
fn read_strings(dataset: &Dataset) -> Result<Vec<String>> {
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    Ok(match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::FixedAscii(len) | TypeDescriptor::FixedUnicode(len)
            if len > MAX_STRING_LEN =>
        {
            bail!("strings of length {len} exceed the supported {MAX_STRING_LEN}")
        }
        TypeDescriptor::FixedAscii(_) => dataset
            .read_raw::<FA256>()?
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect(),
        TypeDescriptor::FixedUnicode(_) => dataset
            .read_raw::<FU256>()?
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect(),
        TypeDescriptor::VarLenAscii => dataset
            .read_raw::<VarLenAscii>()?
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect(),
        TypeDescriptor::VarLenUnicode => dataset
            .read_raw::<VarLenUnicode>()?
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect(),
        other => bail!("expected a string dataset, found {other:?}"),
    })
}

fn read_string_column(group: &Group, name: &str) -> Result<Vec<String>> {
    let dataset = group
        .dataset(name)
        .with_context(|| format!("While opening dataset {name}"))?;
    read_strings(&dataset).with_context(|| format!("While reading dataset {name}"))
}

fn read_shape(group: &Group) -> Result<(usize, usize)> {
    let shape = read_column::<i64>(group, SHAPE)?;
    let &[num_features, num_barcodes] = shape.as_slice() else {
        bail!("'{SHAPE}' has {} entries instead of 2", shape.len());
    };
    Ok((
        usize::try_from(num_features).context("negative number of features")?,
        usize::try_from(num_barcodes).context("negative number of barcodes")?,
    ))
}

fn read_feature_names_from(matrix_group: &MatrixGroup) -> Result<Vec<String>> {
    let group = &matrix_group.group;
    if !matrix_group.legacy {
        return read_string_column(&group.group(FEATURES)?, FEATURE_NAME);
    }
    if group.link_exists(LEGACY_GENE_NAMES) {
        read_string_column(group, LEGACY_GENE_NAMES)
    } else {
        read_string_column(group, LEGACY_GENE_IDS)
    }
}

/// Feature IDs, or `None` when the file stores names only.
fn read_feature_ids_from(matrix_group: &MatrixGroup) -> Result<Option<Vec<String>>> {
    let (group, name) = if matrix_group.legacy {
        (matrix_group.group.clone(), LEGACY_GENE_IDS)
    } else {
        (matrix_group.group.group(FEATURES)?, FEATURE_ID)
    };
    if !group.link_exists(name) {
        return Ok(None);
    }
    read_string_column(&group, name).map(Some)
}

pub(crate) fn read_feature_names(file: &File) -> Result<Vec<String>> {
    read_feature_names_from(&find_matrix_group(file)?)
}

pub(crate) fn read_feature_ids(file: &File) -> Result<Vec<String>> {
    let matrix_group = find_matrix_group(file)?;
    match read_feature_ids_from(&matrix_group)? {
        Some(ids) => Ok(ids),
        None => read_feature_names_from(&matrix_group),
    }
}

pub(crate) fn read_barcodes(file: &File) -> Result<Vec<String>> {
    read_string_column(&find_matrix_group(file)?.group, BARCODES)
}

pub(crate) fn read_dimensions(file: &File) -> Result<MatrixDimensions> {
    let MatrixGroup { group, .. } = find_matrix_group(file)?;
    let (num_features, num_barcodes) = read_shape(&group)?;
    let num_nonzeros = group
        .dataset(DATA)
        .with_context(|| format!("While opening dataset {DATA}"))?
        .size();
    Ok(MatrixDimensions {
        num_features,
        num_barcodes,
        num_nonzeros,
    })
}

pub(crate) fn read_matrix(file: &File) -> Result<CountMatrix> {
    let matrix_group = find_matrix_group(file)?;
    let group = &matrix_group.group;
    let (num_features, num_barcodes) = read_shape(group)?;

    let feature_names = read_feature_names_from(&matrix_group)?;
    ensure!(
        feature_names.len() == num_features,
        "shape has {num_features} features but {} feature names are stored",
        feature_names.len()
    );
    let feature_ids = read_feature_ids_from(&matrix_group)?;
    if let Some(ids) = &feature_ids {
        ensure!(
            ids.len() == num_features,
            "shape has {num_features} features but {} feature ids are stored",
            ids.len()
        );
    }
    let barcodes = read_string_column(group, BARCODES)?;
    ensure!(
        barcodes.len() == num_barcodes,
        "shape has {num_barcodes} barcodes but {} barcodes are stored",
        barcodes.len()
    );

    let matrix = CountMatrix::new(
        read_column(group, DATA)?,
        read_column(group, INDICES)?,
        read_column(group, INDPTR)?,
        feature_names,
        barcodes,
    )?;
    Ok(match feature_ids {
        Some(ids) => matrix.with_feature_ids(ids)?,
        None => matrix,
    })
}
