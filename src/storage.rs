//! Chunked array storage.
//!
//! The rechunker reads from and writes to arrays through [`ChunkedArray`], and creates arrays through [`ArrayLocation`].
//! [`memory`] holds arrays in process memory, [`zarr`] stores them in any `zarrs` storage.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde_json::{Map, Value};
use zarrs::array::ArraySubset;

use crate::{Error, Result, config::StorageOptions, metadata::ElementType};

pub mod memory;
pub mod zarr;

/// A chunked N-dimensional array.
///
/// Implementations must support concurrent writes to disjoint chunk-aligned regions.
pub trait ChunkedArray: Send + Sync + fmt::Debug {
    /// A path or description of the array.
    fn path(&self) -> String;

    fn shape(&self) -> Vec<u64>;

    /// The stored chunk shape.
    fn chunks(&self) -> Vec<u64>;

    fn element_type(&self) -> ElementType;

    fn dimension_names(&self) -> Option<Vec<String>> {
        None
    }

    fn attributes(&self) -> Map<String, Value>;

    /// Merge `attributes` into the stored attributes.
    fn update_attributes(&self, attributes: Map<String, Value>) -> Result<()>;

    /// Whether reads may span several stored chunks.
    ///
    /// Virtual arrays whose chunking is fixed externally return false.
    fn supports_read_consolidation(&self) -> bool {
        true
    }

    /// Read a subset as C order bytes.
    fn read_region(&self, subset: &ArraySubset) -> Result<Bytes>;

    /// Overwrite a subset with C order bytes.
    ///
    /// The subset must be aligned to the stored chunks, except at the upper edge of the array.
    fn write_region(&self, subset: &ArraySubset, data: &[u8]) -> Result<()>;
}

/// A shared handle to a [`ChunkedArray`].
pub type ArrayHandle = Arc<dyn ChunkedArray>;

/// Everything needed to create an array, other than where and how it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayTemplate {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub element_type: ElementType,
    pub attributes: Map<String, Value>,
    pub dimension_names: Option<Vec<String>>,
}

impl ArrayTemplate {
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>, element_type: ElementType) -> Self {
        Self {
            shape,
            chunks,
            element_type,
            attributes: Map::new(),
            dimension_names: None,
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_dimension_names(mut self, dimension_names: Option<Vec<String>>) -> Self {
        self.dimension_names = dimension_names;
        self
    }
}

/// A place where arrays and groups can be created, such as a store root or a group.
pub trait ArrayLocation: Send + Sync + fmt::Debug {
    fn describe(&self) -> String;

    /// Whether creating an array at `name` would replace an existing node.
    fn exists(&self, name: Option<&str>) -> Result<bool>;

    /// The path of `name` within this location, as reported in errors.
    fn node_path(&self, name: Option<&str>) -> String {
        join_path(&self.describe(), name)
    }

    /// Fail with [`Error::NodeExists`] if `name` exists and `options` do not allow overwriting it.
    fn check_vacant(&self, name: Option<&str>, options: &StorageOptions) -> Result<()> {
        if !options.overwrite && self.exists(name)? {
            return Err(Error::NodeExists(self.node_path(name)));
        }
        Ok(())
    }

    /// Create an array at `name` within this location, or at the location itself if `name` is [`None`].
    fn create_array(
        &self,
        name: Option<&str>,
        template: &ArrayTemplate,
        options: &StorageOptions,
    ) -> Result<ArrayHandle>;

    /// Merge `attributes` into the attributes of this location.
    fn update_attributes(&self, attributes: &Map<String, Value>) -> Result<()>;

    /// Create a group at `path` relative to this location, with `attributes`.
    fn create_group(&self, path: &str, attributes: &Map<String, Value>) -> Result<()>;
}

/// A group of arrays to rechunk together.
pub trait SourceGroup: Send + Sync + fmt::Debug {
    fn path(&self) -> String;

    fn attributes(&self) -> Result<Map<String, Value>>;

    /// The member array `name`.
    fn array(&self, name: &str) -> Result<ArrayHandle>;

    /// All nested groups as `(relative path, attributes)`, parents before children.
    fn subgroups(&self) -> Result<Vec<(String, Map<String, Value>)>>;
}

/// Join a location path and a relative child path.
pub(crate) fn join_path(base: &str, name: Option<&str>) -> String {
    match name.map(|n| n.trim_matches('/')).filter(|n| !n.is_empty()) {
        None => base.to_string(),
        Some(name) if base.ends_with('/') => format!("{base}{name}"),
        Some(name) => format!("{base}/{name}"),
    }
}
