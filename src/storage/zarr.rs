//! Arrays and groups in a Zarr V3 hierarchy, stored with `zarrs`.

use std::{fmt, sync::RwLock};

use bytes::Bytes;
use serde_json::{Map, Value};
use zarrs::{
    array::{Array, ArrayBytes, ArrayMetadata, ArraySubset, ArraySubsetTraits},
    group::{Group, GroupBuilder},
    hierarchy::{NodeMetadata, NodePath, get_all_nodes_of},
    node::node_exists,
    storage::{ReadableWritableListableStorage, StorePrefix, WritableStorageTraits},
};

use super::{ArrayHandle, ArrayLocation, ArrayTemplate, ChunkedArray, SourceGroup, join_path};
use crate::{
    Error, Result,
    chunk::is_chunk_aligned,
    config::StorageOptions,
    error::lock_poisoned,
    metadata::{ElementType, array_metadata, dimension_names_from_attributes, with_dimension_names},
};

type ZarrStorageArray = Array<dyn zarrs::storage::ReadableWritableListableStorageTraits>;

/// A Zarr V3 array.
pub struct ZarrArray {
    path: String,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    element_type: ElementType,
    inner: RwLock<ZarrStorageArray>,
}

impl fmt::Debug for ZarrArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZarrArray")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("chunks", &self.chunks)
            .field("element_type", &self.element_type)
            .finish_non_exhaustive()
    }
}

impl ZarrArray {
    /// Open an existing array.
    pub fn open(storage: ReadableWritableListableStorage, path: &str) -> Result<Self> {
        let array = Array::open(storage, path).map_err(Error::wrap)?;
        Self::new(path, array)
    }

    fn new(path: &str, array: ZarrStorageArray) -> Result<Self> {
        if let ArrayMetadata::V2(_) = array.metadata() {
            return Err(Error::general(format!(
                "{path} is a Zarr V2 array, only V3 arrays are supported"
            )));
        }
        let element_type = ElementType::from_data_type(array.data_type())?;
        let shape = array.shape().to_vec();
        let chunks = array
            .chunk_shape(&vec![0; shape.len()])
            .map_err(Error::wrap)?
            .iter()
            .map(|c| c.get())
            .collect();
        Ok(Self {
            path: path.to_string(),
            shape,
            chunks,
            element_type,
            inner: RwLock::new(array),
        })
    }

    fn check_bounds(&self, subset: &ArraySubset) -> Result<()> {
        if subset.inbounds_shape(&self.shape) {
            Ok(())
        } else {
            Err(Error::RegionOutOfBounds {
                array: self.path.clone(),
                region: subset.clone(),
                shape: self.shape.clone(),
            })
        }
    }
}

impl ChunkedArray for ZarrArray {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn shape(&self) -> Vec<u64> {
        self.shape.clone()
    }

    fn chunks(&self) -> Vec<u64> {
        self.chunks.clone()
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn dimension_names(&self) -> Option<Vec<String>> {
        dimension_names_from_attributes(&self.attributes())
    }

    fn attributes(&self) -> Map<String, Value> {
        self.inner
            .read()
            .map(|a| a.attributes().clone())
            .unwrap_or_default()
    }

    fn update_attributes(&self, attributes: Map<String, Value>) -> Result<()> {
        let mut array = self.inner.write().map_err(lock_poisoned)?;
        array.attributes_mut().extend(attributes);
        array.store_metadata().map_err(Error::wrap)
    }

    fn read_region(&self, subset: &ArraySubset) -> Result<Bytes> {
        self.check_bounds(subset)?;
        let array = self.inner.read().map_err(lock_poisoned)?;
        let bytes = array
            .retrieve_array_subset::<ArrayBytes<'static>>(subset)
            .map_err(Error::wrap)?
            .into_fixed()
            .map_err(Error::wrap)?;
        Ok(Bytes::copy_from_slice(&bytes))
    }

    fn write_region(&self, subset: &ArraySubset, data: &[u8]) -> Result<()> {
        self.check_bounds(subset)?;
        if !is_chunk_aligned(subset, &self.shape, &self.chunks) {
            return Err(Error::RegionMisaligned {
                array: self.path.clone(),
                region: subset.clone(),
                chunks: self.chunks.clone(),
            });
        }
        let expected = subset.num_elements() as usize * self.element_type.size();
        if data.len() != expected {
            return Err(Error::BufferSizeMismatch {
                region: subset.clone(),
                expected,
                actual: data.len(),
            });
        }
        let array = self.inner.read().map_err(lock_poisoned)?;
        array
            .store_array_subset(subset, ArrayBytes::new_flen(data.to_vec()))
            .map_err(Error::wrap)
    }
}

fn to_node_path(path: &str) -> Result<NodePath> {
    NodePath::new(path).map_err(Error::wrap)
}

/// A group (or the root) of a Zarr V3 hierarchy in which arrays are created.
#[derive(Clone)]
pub struct ZarrLocation {
    storage: ReadableWritableListableStorage,
    path: String,
}

impl fmt::Debug for ZarrLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZarrLocation")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ZarrLocation {
    pub fn new(storage: ReadableWritableListableStorage, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
        }
    }

    pub fn storage(&self) -> &ReadableWritableListableStorage {
        &self.storage
    }

    /// Remove the node at `path`, if any.
    fn clear_node(&self, path: &str) -> Result<()> {
        let node = to_node_path(path)?;
        if !node_exists(&self.storage, &node).map_err(Error::wrap)? {
            return Ok(());
        }
        log::debug!("erasing existing node {path}");
        let prefix: StorePrefix = (&node).try_into().map_err(Error::wrap)?;
        self.storage.erase_prefix(&prefix).map_err(Error::wrap)
    }
}

impl ArrayLocation for ZarrLocation {
    fn describe(&self) -> String {
        format!("zarr:{}", self.path)
    }

    fn exists(&self, name: Option<&str>) -> Result<bool> {
        let node = to_node_path(&self.node_path(name))?;
        node_exists(&self.storage, &node).map_err(Error::wrap)
    }

    fn node_path(&self, name: Option<&str>) -> String {
        join_path(&self.path, name)
    }

    fn create_array(
        &self,
        name: Option<&str>,
        template: &ArrayTemplate,
        options: &StorageOptions,
    ) -> Result<ArrayHandle> {
        self.check_vacant(name, options)?;
        let path = self.node_path(name);
        self.clear_node(&path)?;

        let attributes = with_dimension_names(
            template.attributes.clone(),
            template.dimension_names.as_deref(),
        );
        let metadata = array_metadata(
            &template.shape,
            &template.chunks,
            template.element_type,
            attributes,
            options,
        )?;
        let mut array =
            Array::new_with_metadata(self.storage.clone(), &path, ArrayMetadata::V3(metadata))
                .map_err(Error::wrap)?;
        if let Some(store_empty_chunks) = options.write_empty_chunks {
            array = array.with_codec_options(
                zarrs_codec::CodecOptions::default().with_store_empty_chunks(store_empty_chunks),
            );
        }
        array.store_metadata().map_err(Error::wrap)?;
        log::debug!(
            "created zarr array {path} with shape {:?} and chunks {:?}",
            template.shape,
            template.chunks
        );
        Ok(std::sync::Arc::new(ZarrArray::new(&path, array)?))
    }

    fn update_attributes(&self, attributes: &Map<String, Value>) -> Result<()> {
        let node = to_node_path(&self.path)?;
        let mut group = if node_exists(&self.storage, &node).map_err(Error::wrap)? {
            Group::open(self.storage.clone(), &self.path).map_err(Error::wrap)?
        } else {
            GroupBuilder::new()
                .build(self.storage.clone(), &self.path)
                .map_err(Error::wrap)?
        };
        group.attributes_mut().extend(attributes.clone());
        group.store_metadata().map_err(Error::wrap)
    }

    fn create_group(&self, path: &str, attributes: &Map<String, Value>) -> Result<()> {
        let path = join_path(&self.path, Some(path));
        let mut group = GroupBuilder::new()
            .build(self.storage.clone(), &path)
            .map_err(Error::wrap)?;
        group.attributes_mut().extend(attributes.clone());
        group.store_metadata().map_err(Error::wrap)
    }
}

/// An existing group of a Zarr V3 hierarchy, read as a rechunking source.
#[derive(Clone)]
pub struct ZarrGroup {
    storage: ReadableWritableListableStorage,
    path: String,
}

impl fmt::Debug for ZarrGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZarrGroup")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ZarrGroup {
    /// Open the group at `path`.
    pub fn open(storage: ReadableWritableListableStorage, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        Group::open(storage.clone(), &path).map_err(Error::wrap)?;
        Ok(Self { storage, path })
    }
}

impl SourceGroup for ZarrGroup {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn attributes(&self) -> Result<Map<String, Value>> {
        let group = Group::open(self.storage.clone(), &self.path).map_err(Error::wrap)?;
        Ok(group.attributes().clone())
    }

    fn array(&self, name: &str) -> Result<ArrayHandle> {
        let path = join_path(&self.path, Some(name));
        if !node_exists(&self.storage, &to_node_path(&path)?).map_err(Error::wrap)? {
            return Err(Error::MissingMember {
                source_path: self.path.clone(),
                member: name.to_string(),
            });
        }
        Ok(std::sync::Arc::new(ZarrArray::open(
            self.storage.clone(),
            &path,
        )?))
    }

    fn subgroups(&self) -> Result<Vec<(String, Map<String, Value>)>> {
        let nodes =
            get_all_nodes_of(&self.storage, &to_node_path(&self.path)?).map_err(Error::wrap)?;
        let mut out = Vec::new();
        for node in nodes {
            if let NodeMetadata::Group(_) = node.metadata() {
                let path = node.path().as_str();
                let relative = path
                    .strip_prefix(self.path.as_str())
                    .unwrap_or(path)
                    .trim_start_matches('/')
                    .to_string();
                let group = Group::open(self.storage.clone(), path).map_err(Error::wrap)?;
                out.push((relative, group.attributes().clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
