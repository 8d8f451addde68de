use std::{borrow::Cow, fmt, num::NonZeroU64};

use serde_json::{Map, Value};
use zarrs::{
    array::{
        ArrayMetadataV3, DataType, FillValueMetadata,
        chunk_grid::{RegularChunkGrid, RegularChunkGridConfiguration},
        data_type,
    },
    metadata::v3::MetadataV3,
    plugin::{ExtensionAliasesV3, ExtensionName},
};

use crate::config::{ArrayOrder, StorageOptions};

/// Attribute holding the names of an array's dimensions.
pub const DIMENSION_KEY: &str = "_ARRAY_DIMENSIONS";

/// The fixed-size numeric data types that can be rechunked.
///
/// Names and sizes come from the corresponding zarrs [`DataType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl ElementType {
    pub const ALL: [Self; 10] = [
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::UInt8,
        Self::UInt16,
        Self::UInt32,
        Self::UInt64,
        Self::Float32,
        Self::Float64,
    ];

    /// The zarrs data type.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int8 => data_type::int8(),
            Self::Int16 => data_type::int16(),
            Self::Int32 => data_type::int32(),
            Self::Int64 => data_type::int64(),
            Self::UInt8 => data_type::uint8(),
            Self::UInt16 => data_type::uint16(),
            Self::UInt32 => data_type::uint32(),
            Self::UInt64 => data_type::uint64(),
            Self::Float32 => data_type::float32(),
            Self::Float64 => data_type::float64(),
        }
    }

    /// Bytes per element.
    pub fn size(&self) -> usize {
        self.data_type().fixed_size().unwrap_or(1)
    }

    /// The Zarr V3 data type name.
    pub fn name(&self) -> Cow<'static, str> {
        self.data_type().name_v3().unwrap_or_default()
    }

    pub fn from_name(name: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| crate::Error::general(format!("unsupported data type: {name}")))
    }

    /// The element type of a zarrs data type.
    ///
    /// # Errors
    /// Returns [`crate::Error::General`] for data types that are not fixed-size numbers.
    pub fn from_data_type(data_type: &DataType) -> crate::Result<Self> {
        let name = data_type.name_v3().unwrap_or_default();
        Self::from_name(&name)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Read dimension names from the [`DIMENSION_KEY`] attribute.
pub fn dimension_names_from_attributes(attributes: &Map<String, Value>) -> Option<Vec<String>> {
    let names = attributes.get(DIMENSION_KEY)?.as_array()?;
    names
        .iter()
        .map(|n| n.as_str().map(str::to_string))
        .collect()
}

/// Attributes with the dimension names recorded under [`DIMENSION_KEY`].
pub fn with_dimension_names(
    mut attributes: Map<String, Value>,
    dimension_names: Option<&[String]>,
) -> Map<String, Value> {
    if let Some(names) = dimension_names {
        attributes.insert(
            DIMENSION_KEY.to_string(),
            Value::Array(names.iter().cloned().map(Value::String).collect()),
        );
    }
    attributes
}

/// Creates a regular chunk grid.
fn convert_chunk_grid(chunks: &[u64]) -> crate::Result<MetadataV3> {
    let chunk_shape: Vec<_> = chunks
        .iter()
        .map(|&n| NonZeroU64::new(n).ok_or_else(|| crate::Error::general("zero chunk size")))
        .collect::<crate::Result<Vec<_>>>()?;
    let out = MetadataV3::new_with_serializable_configuration(
        RegularChunkGrid::aliases_v3().default_name.clone().to_string(),
        &RegularChunkGridConfiguration {
            chunk_shape: chunk_shape.into(),
        },
    )?;

    Ok(out)
}

fn convert_data_type(element_type: ElementType) -> MetadataV3 {
    let data_type = element_type.data_type();
    let data_type_name = data_type
        .name_v3()
        .map_or_else(String::new, Cow::into_owned);
    let data_type_configuration = data_type.configuration_v3();
    if data_type_configuration.is_empty() {
        MetadataV3::new(data_type_name)
    } else {
        MetadataV3::new_with_configuration(data_type_name, data_type_configuration)
    }
}

fn convert_fill_value() -> FillValueMetadata {
    FillValueMetadata::Number(serde_json::Number::from(0))
}

fn codec_metadata(value: Value) -> crate::Result<MetadataV3> {
    Ok(serde_json::from_value(value)?)
}

/// The codec chain for an array of `ndim` dimensions: filters, an optional transpose, bytes, then the compressor.
fn convert_codecs(
    element_type: ElementType,
    ndim: usize,
    options: &StorageOptions,
) -> crate::Result<Vec<MetadataV3>> {
    let mut codecs = Vec::new();
    for filter in options.filters.iter().flatten() {
        codecs.push(codec_metadata(filter.clone())?);
    }
    if options.order == Some(ArrayOrder::F) && ndim > 1 {
        let order: Vec<usize> = (0..ndim).rev().collect();
        codecs.push(codec_metadata(serde_json::json!({
            "name": "transpose",
            "configuration": {"order": order},
        }))?);
    }
    let bytes = if element_type.size() > 1 {
        let endian = if cfg!(target_endian = "big") {
            "big"
        } else {
            "little"
        };
        serde_json::json!({"name": "bytes", "configuration": {"endian": endian}})
    } else {
        serde_json::json!({"name": "bytes"})
    };
    codecs.push(codec_metadata(bytes)?);
    if let Some(compressor) = options.compressor.as_ref().filter(|c| !c.is_null()) {
        codecs.push(codec_metadata(compressor.clone())?);
    }
    Ok(codecs)
}

/// Zarr V3 array metadata for a new array.
pub fn array_metadata(
    shape: &[u64],
    chunks: &[u64],
    element_type: ElementType,
    attributes: Map<String, Value>,
    options: &StorageOptions,
) -> crate::Result<ArrayMetadataV3> {
    let chunk_grid = convert_chunk_grid(chunks)?;
    let data_type = convert_data_type(element_type);
    let fill_value = convert_fill_value();
    let codecs = convert_codecs(element_type, shape.len(), options)?;
    let out = ArrayMetadataV3::new(shape.to_vec(), chunk_grid, data_type, fill_value, codecs)
        .with_attributes(attributes);
    Ok(out)
}
