// ========================================================================================
//
//                        Volume interchange: detached header plus raw voxels
//
// ========================================================================================
//
// Image decoding is owned by an upstream converter. What reaches this crate is a small
// TOML header describing a raw, little-endian voxel payload that sits next to it:
//
//     shape = [91, 109, 91]
//     spacing = [2.0, 2.0, 2.0]
//     dtype = "f32"
//     layout = "fortran"
//     data_file = "ct.raw"
//     compression = "none"
//
// Uncompressed payloads are memory-mapped for decoding; gzip payloads are inflated into
// memory. Either way the decoded grid is owned by the returned `Volume` and the file
// handles are released before this module returns.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use memmap2::Mmap;
use ndarray::{Array3, ArrayView3, ShapeBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Element type of the raw payload. All multi-byte types are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelType {
    U8,
    I16,
    I32,
    U32,
    F32,
    F64,
}

impl VoxelType {
    pub fn byte_width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Memory order of the payload. `Fortran` (first axis fastest) is the on-disk order of
/// NIfTI and MGH images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Fortran,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub shape: [usize; 3],
    pub spacing: [f64; 3],
    pub dtype: VoxelType,
    #[serde(default)]
    pub layout: Layout,
    /// Resolved against the directory holding the header when relative.
    pub data_file: PathBuf,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("IO error on volume file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse volume header '{path}': {source}")]
    HeaderParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize volume header: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Volume '{path}' declares an empty or overflowing shape {shape:?}.")]
    InvalidShape { path: PathBuf, shape: [usize; 3] },
    #[error(
        "Volume payload '{path}' holds {found} bytes, but shape and dtype require {expected}."
    )]
    ByteLength {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error(
        "Label volume '{path}' holds value {value} at voxel {index:?}; labels must be non-negative integers."
    )]
    NonIntegralLabel {
        path: PathBuf,
        value: f64,
        index: [usize; 3],
    },
}

/// A dense scalar volume (e.g. cortical thickness) with its voxel spacing.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f64>,
    pub spacing: [f64; 3],
}

/// A segmentation volume whose voxels hold atlas label ids (0 = background).
#[derive(Debug, Clone)]
pub struct LabelVolume {
    pub ids: Array3<u32>,
    pub spacing: [f64; 3],
}

impl Volume {
    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    /// Reads a volume from its detached header.
    pub fn load(header_path: &Path) -> Result<Self, VolumeError> {
        let header = read_header(header_path)?;
        let data = read_payload(header_path, &header)?;
        Ok(Self {
            data,
            spacing: header.spacing,
        })
    }

    /// Writes the volume as an uncompressed f64 Fortran-order payload plus header.
    /// `data_file` is stored relative to the header.
    pub fn save(&self, header_path: &Path, data_file: &Path) -> Result<(), VolumeError> {
        self.write(header_path, data_file, Compression::None)
    }

    /// Same as [`Volume::save`] but gzip-compresses the payload.
    pub fn save_gzip(&self, header_path: &Path, data_file: &Path) -> Result<(), VolumeError> {
        self.write(header_path, data_file, Compression::Gzip)
    }

    fn write(
        &self,
        header_path: &Path,
        data_file: &Path,
        compression: Compression,
    ) -> Result<(), VolumeError> {
        let (nx, ny, nz) = self.data.dim();
        let header = VolumeHeader {
            shape: [nx, ny, nz],
            spacing: self.spacing,
            dtype: VoxelType::F64,
            layout: Layout::Fortran,
            data_file: data_file.to_path_buf(),
            compression,
        };
        let payload_path = resolve_data_path(header_path, &header.data_file);
        let to_volume_error = |source| VolumeError::Io {
            path: payload_path.clone(),
            source,
        };

        let file = BufWriter::new(File::create(&payload_path).map_err(to_volume_error)?);
        match compression {
            Compression::None => {
                let mut writer = file;
                write_fortran_order(&self.data, &mut writer).map_err(to_volume_error)?;
                writer.flush().map_err(to_volume_error)?;
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(file, flate2::Compression::default());
                write_fortran_order(&self.data, &mut encoder).map_err(to_volume_error)?;
                encoder
                    .finish()
                    .and_then(|mut inner| inner.flush())
                    .map_err(to_volume_error)?;
            }
        }

        let text = toml::to_string_pretty(&header)?;
        fs::write(header_path, text).map_err(|source| VolumeError::Io {
            path: header_path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn write_fortran_order(data: &Array3<f64>, sink: &mut impl Write) -> io::Result<()> {
    // The transposed view iterates with the first axis fastest.
    for &value in data.t().iter() {
        sink.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

impl LabelVolume {
    pub fn view(&self) -> ArrayView3<'_, u32> {
        self.ids.view()
    }

    /// Reads a segmentation volume. Any voxel that is not a non-negative integer is an
    /// error; label images are frequently stored as floats, so integral float values
    /// are accepted.
    pub fn load(header_path: &Path) -> Result<Self, VolumeError> {
        let header = read_header(header_path)?;
        let data = read_payload(header_path, &header)?;

        let mut ids = Array3::<u32>::zeros(data.dim());
        for ((index, &value), id) in data.indexed_iter().zip(ids.iter_mut()) {
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64
            {
                return Err(VolumeError::NonIntegralLabel {
                    path: header_path.to_path_buf(),
                    value,
                    index: [index.0, index.1, index.2],
                });
            }
            *id = value as u32;
        }

        Ok(Self {
            ids,
            spacing: header.spacing,
        })
    }
}

fn resolve_data_path(header_path: &Path, data_file: &Path) -> PathBuf {
    if data_file.is_absolute() {
        return data_file.to_path_buf();
    }
    match header_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(data_file),
        _ => data_file.to_path_buf(),
    }
}

fn read_header(header_path: &Path) -> Result<VolumeHeader, VolumeError> {
    let text = fs::read_to_string(header_path).map_err(|source| VolumeError::Io {
        path: header_path.to_path_buf(),
        source,
    })?;
    let header: VolumeHeader = toml::from_str(&text).map_err(|source| VolumeError::HeaderParse {
        path: header_path.to_path_buf(),
        source,
    })?;

    let voxel_count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
    if header.shape.contains(&0) || voxel_count.is_none() {
        return Err(VolumeError::InvalidShape {
            path: header_path.to_path_buf(),
            shape: header.shape,
        });
    }
    Ok(header)
}

fn read_payload(header_path: &Path, header: &VolumeHeader) -> Result<Array3<f64>, VolumeError> {
    let payload_path = resolve_data_path(header_path, &header.data_file);
    let to_volume_error = |source| VolumeError::Io {
        path: payload_path.clone(),
        source,
    };

    let file = File::open(&payload_path).map_err(to_volume_error)?;
    let values = match header.compression {
        Compression::None => {
            // The mapping only lives for the duration of decoding.
            let mmap = unsafe { Mmap::map(&file) }.map_err(to_volume_error)?;
            decode_voxels(&payload_path, header, &mmap)?
        }
        Compression::Gzip => {
            let mut bytes = Vec::new();
            GzDecoder::new(file)
                .read_to_end(&mut bytes)
                .map_err(to_volume_error)?;
            decode_voxels(&payload_path, header, &bytes)?
        }
    };

    let [nx, ny, nz] = header.shape;
    let shaped = match header.layout {
        Layout::Fortran => Array3::from_shape_vec((nx, ny, nz).f(), values),
        Layout::C => Array3::from_shape_vec((nx, ny, nz), values),
    };
    // The byte length was checked against the shape in `decode_voxels`.
    shaped.map_err(|_| VolumeError::InvalidShape {
        path: header_path.to_path_buf(),
        shape: header.shape,
    })
}

fn decode_voxels(
    payload_path: &Path,
    header: &VolumeHeader,
    bytes: &[u8],
) -> Result<Vec<f64>, VolumeError> {
    let voxel_count: usize = header.shape.iter().product();
    let expected = voxel_count * header.dtype.byte_width();
    if bytes.len() != expected {
        return Err(VolumeError::ByteLength {
            path: payload_path.to_path_buf(),
            expected,
            found: bytes.len(),
        });
    }

    let values = match header.dtype {
        VoxelType::U8 => bytes.iter().map(|&b| b as f64).collect(),
        VoxelType::I16 => decode_le::<2>(bytes, |b| i16::from_le_bytes(b) as f64),
        VoxelType::I32 => decode_le::<4>(bytes, |b| i32::from_le_bytes(b) as f64),
        VoxelType::U32 => decode_le::<4>(bytes, |b| u32::from_le_bytes(b) as f64),
        VoxelType::F32 => decode_le::<4>(bytes, |b| f32::from_le_bytes(b) as f64),
        VoxelType::F64 => decode_le::<8>(bytes, f64::from_le_bytes),
    };
    Ok(values)
}

fn decode_le<const N: usize>(bytes: &[u8], convert: impl Fn([u8; N]) -> f64) -> Vec<f64> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            convert(buf)
        })
        .collect()
}
