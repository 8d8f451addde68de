//! Arrays held in process memory.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use bytes::Bytes;
use serde_json::{Map, Value};
use zarrs::array::{ArraySubset, ArraySubsetTraits, Indexer};

use super::{ArrayHandle, ArrayLocation, ArrayTemplate, ChunkedArray, SourceGroup, join_path};
use crate::{
    Error, Result,
    chunk::{BlockGrid, is_chunk_aligned, whole},
    config::StorageOptions,
    error::lock_poisoned,
    metadata::{ElementType, dimension_names_from_attributes, with_dimension_names},
};

/// A chunked array stored as one C order buffer.
///
/// Writes must be aligned to the chunk shape, as for a chunked store.
#[derive(Debug)]
pub struct MemoryArray {
    path: String,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    element_type: ElementType,
    read_consolidation: bool,
    attributes: RwLock<Map<String, Value>>,
    data: RwLock<Vec<u8>>,
}

impl MemoryArray {
    /// Create a zero-filled array.
    pub fn new(
        path: impl Into<String>,
        shape: Vec<u64>,
        chunks: Vec<u64>,
        element_type: ElementType,
    ) -> Result<Self> {
        let len = shape.iter().product::<u64>() as usize * element_type.size();
        Self::from_bytes(path, shape, chunks, element_type, vec![0; len])
    }

    /// Create an array from C order bytes.
    pub fn from_bytes(
        path: impl Into<String>,
        shape: Vec<u64>,
        chunks: Vec<u64>,
        element_type: ElementType,
        data: Vec<u8>,
    ) -> Result<Self> {
        BlockGrid::new(&shape, &chunks)?;
        let expected = shape.iter().product::<u64>() as usize * element_type.size();
        if data.len() != expected {
            return Err(Error::BufferSizeMismatch {
                region: whole(&shape),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            path: path.into(),
            shape,
            chunks,
            element_type,
            read_consolidation: true,
            attributes: RwLock::new(Map::new()),
            data: RwLock::new(data),
        })
    }

    #[must_use]
    pub fn with_attributes(self, attributes: Map<String, Value>) -> Self {
        Self {
            attributes: RwLock::new(attributes),
            ..self
        }
    }

    /// Record dimension names in the attributes.
    #[must_use]
    pub fn with_dimension_names(self, names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let attributes = self
            .attributes
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        Self {
            attributes: RwLock::new(with_dimension_names(attributes, Some(&names))),
            ..self
        }
    }

    /// Mark the array as virtual, with chunks that reads must not span.
    #[must_use]
    pub fn with_read_consolidation(self, read_consolidation: bool) -> Self {
        Self {
            read_consolidation,
            ..self
        }
    }

    /// A copy of the whole array as C order bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.read().map_err(lock_poisoned)?.clone())
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

    /// Contiguous runs of `subset` in the buffer, as byte ranges.
    fn byte_runs(&self, subset: &ArraySubset) -> Result<Vec<std::ops::Range<usize>>> {
        let size = self.element_type.size();
        Ok(subset
            .iter_contiguous_linearised_indices(&self.shape)
            .map_err(Error::wrap)?
            .map(|(index, len)| {
                let start = index as usize * size;
                start..start + len as usize * size
            })
            .collect())
    }
}

impl ChunkedArray for MemoryArray {
    fn path(&self) -> String {
        format!("memory://{}", self.path)
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
        let attributes = self.attributes.read().ok()?;
        dimension_names_from_attributes(&attributes)
    }

    fn attributes(&self) -> Map<String, Value> {
        self.attributes
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn update_attributes(&self, attributes: Map<String, Value>) -> Result<()> {
        self.attributes
            .write()
            .map_err(lock_poisoned)?
            .extend(attributes);
        Ok(())
    }

    fn supports_read_consolidation(&self) -> bool {
        self.read_consolidation
    }

    fn read_region(&self, subset: &ArraySubset) -> Result<Bytes> {
        self.check_bounds(subset)?;
        let runs = self.byte_runs(subset)?;
        let data = self.data.read().map_err(lock_poisoned)?;
        let mut out = Vec::with_capacity(subset.num_elements() as usize * self.element_type.size());
        for run in runs {
            out.extend_from_slice(&data[run]);
        }
        Ok(Bytes::from(out))
    }

    fn write_region(&self, subset: &ArraySubset, bytes: &[u8]) -> Result<()> {
        self.check_bounds(subset)?;
        if !is_chunk_aligned(subset, &self.shape, &self.chunks) {
            return Err(Error::RegionMisaligned {
                array: self.path.clone(),
                region: subset.clone(),
                chunks: self.chunks.clone(),
            });
        }
        let expected = subset.num_elements() as usize * self.element_type.size();
        if bytes.len() != expected {
            return Err(Error::BufferSizeMismatch {
                region: subset.clone(),
                expected,
                actual: bytes.len(),
            });
        }
        let runs = self.byte_runs(subset)?;
        let mut data = self.data.write().map_err(lock_poisoned)?;
        let mut offset = 0;
        for run in runs {
            let len = run.len();
            data[run].copy_from_slice(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }
}

/// An in-memory hierarchy of arrays and groups.
///
/// Paths are relative to the root, without leading slashes; the root itself is `""`.
/// Also usable as a [`SourceGroup`].
#[derive(Debug, Default)]
pub struct MemoryLocation {
    name: String,
    arrays: Mutex<BTreeMap<String, Arc<MemoryArray>>>,
    groups: Mutex<BTreeMap<String, Map<String, Value>>>,
}

fn normalize_path(path: &str) -> String {
    join_path("", Some(path)).trim_start_matches('/').to_string()
}

impl MemoryLocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Insert an existing array at `path`, replacing any array there.
    pub fn insert_array(&self, path: &str, array: MemoryArray) -> Result<Arc<MemoryArray>> {
        let array = Arc::new(array);
        self.arrays
            .lock()
            .map_err(lock_poisoned)?
            .insert(normalize_path(path), array.clone());
        Ok(array)
    }

    /// The array at `path`, if any.
    pub fn get(&self, path: &str) -> Option<Arc<MemoryArray>> {
        self.arrays.lock().ok()?.get(&normalize_path(path)).cloned()
    }

    /// The paths of all arrays.
    pub fn array_paths(&self) -> Vec<String> {
        self.arrays
            .lock()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The attributes of the group at `path`, if it exists.
    pub fn group_attributes(&self, path: &str) -> Option<Map<String, Value>> {
        self.groups.lock().ok()?.get(&normalize_path(path)).cloned()
    }
}

impl ArrayLocation for MemoryLocation {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn exists(&self, name: Option<&str>) -> Result<bool> {
        let path = normalize_path(name.unwrap_or_default());
        Ok(self.arrays.lock().map_err(lock_poisoned)?.contains_key(&path))
    }

    fn create_array(
        &self,
        name: Option<&str>,
        template: &ArrayTemplate,
        options: &StorageOptions,
    ) -> Result<ArrayHandle> {
        self.check_vacant(name, options)?;
        let path = normalize_path(name.unwrap_or_default());
        let mut arrays = self.arrays.lock().map_err(lock_poisoned)?;
        let attributes = with_dimension_names(
            template.attributes.clone(),
            template.dimension_names.as_deref(),
        );
        let array = MemoryArray::new(
            format!("{}/{path}", self.name),
            template.shape.clone(),
            template.chunks.clone(),
            template.element_type,
        )?
        .with_attributes(attributes);
        let array = Arc::new(array);
        arrays.insert(path, array.clone());
        log::debug!(
            "created memory array {} with shape {:?} and chunks {:?}",
            array.path(),
            template.shape,
            template.chunks
        );
        Ok(array)
    }

    fn update_attributes(&self, attributes: &Map<String, Value>) -> Result<()> {
        self.groups
            .lock()
            .map_err(lock_poisoned)?
            .entry(String::new())
            .or_default()
            .extend(attributes.clone());
        Ok(())
    }

    fn create_group(&self, path: &str, attributes: &Map<String, Value>) -> Result<()> {
        self.groups
            .lock()
            .map_err(lock_poisoned)?
            .entry(normalize_path(path))
            .or_default()
            .extend(attributes.clone());
        Ok(())
    }
}

impl SourceGroup for MemoryLocation {
    fn path(&self) -> String {
        self.describe()
    }

    fn attributes(&self) -> Result<Map<String, Value>> {
        Ok(self.group_attributes("").unwrap_or_default())
    }

    fn array(&self, name: &str) -> Result<ArrayHandle> {
        match self.get(name) {
            Some(array) => Ok(array),
            None => Err(Error::MissingMember {
                source_path: self.describe(),
                member: name.to_string(),
            }),
        }
    }

    fn subgroups(&self) -> Result<Vec<(String, Map<String, Value>)>> {
        Ok(self
            .groups
            .lock()
            .map_err(lock_poisoned)?
            .iter()
            .filter(|(path, _)| !path.is_empty())
            .map(|(path, attributes)| (path.clone(), attributes.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: Vec<u64>, chunks: Vec<u64>) -> MemoryArray {
        let data: Vec<u8> = (0..shape.iter().product::<u64>()).map(|i| i as u8).collect();
        MemoryArray::from_bytes("iota", shape, chunks, ElementType::UInt8, data).unwrap()
    }

    fn subset(ranges: &[std::ops::Range<u64>]) -> ArraySubset {
        ArraySubset::new_with_ranges(ranges)
    }

    #[test]
    fn read_region() {
        let array = iota(vec![4, 4], vec![2, 2]);
        let bytes = array.read_region(&subset(&[1..3, 2..4])).unwrap();
        assert_eq!(bytes.as_ref(), &[6, 7, 10, 11]);
    }

    #[test]
    fn write_must_be_aligned() {
        let array = iota(vec![5, 4], vec![2, 2]);
        assert!(matches!(
            array.write_region(&subset(&[1..3, 0..2]), &[0; 4]),
            Err(Error::RegionMisaligned { .. })
        ));
        array.write_region(&subset(&[4..5, 2..4]), &[99, 98]).unwrap();
        let bytes = array.read_region(&subset(&[4..5, 0..4])).unwrap();
        assert_eq!(bytes.as_ref(), &[16, 17, 99, 98]);
    }

    #[test]
    fn write_checks_bounds_and_size() {
        let array = iota(vec![4], vec![2]);
        assert!(matches!(
            array.write_region(&subset(&[2..6]), &[0; 4]),
            Err(Error::RegionOutOfBounds { .. })
        ));
        assert!(matches!(
            array.write_region(&subset(&[0..2]), &[0; 3]),
            Err(Error::BufferSizeMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn location_respects_overwrite() {
        let location = MemoryLocation::new("target");
        let template = ArrayTemplate::new(vec![4], vec![2], ElementType::Float64)
            .with_dimension_names(Some(vec!["x".to_string()]));
        let array = location
            .create_array(Some("a"), &template, &StorageOptions::default())
            .unwrap();
        assert_eq!(array.dimension_names(), Some(vec!["x".to_string()]));
        assert!(matches!(
            location.create_array(Some("a"), &template, &StorageOptions::default()),
            Err(Error::NodeExists(_))
        ));
        let options = StorageOptions {
            overwrite: true,
            ..Default::default()
        };
        location.create_array(Some("/a"), &template, &options).unwrap();
        assert_eq!(location.array_paths(), vec!["a".to_string()]);
    }

    #[test]
    fn location_as_source_group() {
        let location = MemoryLocation::new("source");
        location.create_group("g/h", &Map::new()).unwrap();
        location.create_group("g", &Map::new()).unwrap();
        let subgroups: Vec<_> = location
            .subgroups()
            .unwrap()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(subgroups, vec!["g", "g/h"]);
        assert!(matches!(
            SourceGroup::array(&location, "missing"),
            Err(Error::MissingMember { .. })
        ));
    }
}
