//! Arrays paired with the chunk shapes used to access them.

use std::fmt;

use crate::{Error, Result, storage::ArrayHandle};

/// An array together with the chunk shape at which it is read or written.
///
/// The access chunks may differ from the array's stored chunks.
#[derive(Clone)]
pub struct ArrayProxy {
    pub array: ArrayHandle,
    pub chunks: Vec<u64>,
}

impl ArrayProxy {
    pub fn new(array: ArrayHandle, chunks: Vec<u64>) -> Self {
        Self { array, chunks }
    }

    pub fn shape(&self) -> Vec<u64> {
        self.array.shape()
    }
}

impl fmt::Debug for ArrayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayProxy")
            .field("array", &self.array.path())
            .field("chunks", &self.chunks)
            .finish()
    }
}

/// The intermediate slot of a [`CopySpec`].
#[derive(Debug, Clone)]
pub enum Intermediate {
    /// Data is copied straight from the source to the target.
    Direct { chunks: Vec<u64> },
    /// Data is staged through a temporary array.
    Staged(ArrayProxy),
}

impl Intermediate {
    pub fn chunks(&self) -> &[u64] {
        match self {
            Self::Direct { chunks } => chunks,
            Self::Staged(proxy) => &proxy.chunks,
        }
    }

    pub fn array(&self) -> Option<&ArrayHandle> {
        match self {
            Self::Direct { .. } => None,
            Self::Staged(proxy) => Some(&proxy.array),
        }
    }
}

/// Everything needed to copy one array into its rechunked target.
#[derive(Debug, Clone)]
pub struct CopySpec {
    read: ArrayProxy,
    intermediate: Intermediate,
    write: ArrayProxy,
}

impl CopySpec {
    /// Create a copy spec.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCopySpec`] unless all arrays share the read array's shape and every chunk shape has its rank.
    pub fn new(read: ArrayProxy, intermediate: Intermediate, write: ArrayProxy) -> Result<Self> {
        let shape = read.shape();
        let mut shapes = vec![("write", write.shape())];
        if let Intermediate::Staged(proxy) = &intermediate {
            shapes.push(("intermediate", proxy.shape()));
        }
        for (what, other) in shapes {
            if other != shape {
                return Err(Error::InvalidCopySpec(format!(
                    "{what} array has shape {other:?}, expected {shape:?}"
                )));
            }
        }
        for (what, chunks) in [
            ("read", read.chunks.as_slice()),
            ("intermediate", intermediate.chunks()),
            ("write", write.chunks.as_slice()),
        ] {
            if chunks.len() != shape.len() {
                return Err(Error::InvalidCopySpec(format!(
                    "{what} chunks {chunks:?} do not match the rank of shape {shape:?}"
                )));
            }
            if chunks.contains(&0) {
                return Err(Error::InvalidCopySpec(format!(
                    "{what} chunks {chunks:?} contain a zero extent"
                )));
            }
        }
        Ok(Self {
            read,
            intermediate,
            write,
        })
    }

    pub fn read(&self) -> &ArrayProxy {
        &self.read
    }

    pub fn intermediate(&self) -> &Intermediate {
        &self.intermediate
    }

    pub fn write(&self) -> &ArrayProxy {
        &self.write
    }

    pub fn shape(&self) -> Vec<u64> {
        self.read.shape()
    }
}
