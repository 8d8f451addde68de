pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    // Configuration errors; always raised before anything is allocated.
    #[error("source must be an array, a group or a dataset (got {0})")]
    UnsupportedSource(String),
    #[error("target chunks must be given per member when rechunking a {0}")]
    TargetChunksRequired(&'static str),
    #[error("target chunks given per member, but the source is a single array")]
    UnexpectedMemberChunks,
    #[error("an array name cannot be specified when rechunking a {0}")]
    ArrayNameNotAllowed(&'static str),
    #[error(
        "target chunks were given by dimension name, but array {array} has no dimension names"
    )]
    MissingDimensionNames { array: String },
    #[error(
        "every dimension must be named in the target chunks: array {array} has dimensions {dimensions:?}, missing {missing}"
    )]
    MissingDimension {
        array: String,
        dimensions: Vec<String>,
        missing: String,
    },
    #[error("{member} is not a member of {source_path}")]
    MissingMember { source_path: String, member: String },
    #[error("storage options must not include {option}, only the following options are supported: {allowed:?}")]
    InvalidStorageOption {
        option: String,
        allowed: &'static [&'static str],
    },
    #[error("chunks must be provided in the target chunks rather than the storage options (variable={0})")]
    ChunksInOptions(String),
    #[error("a temporary store location must be provided{}", .0.as_ref().map(|name| format!(" (array={name})")).unwrap_or_default())]
    MissingTempStore(Option<String>),
    #[error("unrecognized executor {0}")]
    UnknownExecutor(String),
    #[error("invalid memory limit {0:?}")]
    InvalidMaxMem(String),
    #[error("{0} already exists, set the overwrite option to replace it")]
    NodeExists(String),

    // Planning errors.
    #[error("{what} has {actual} dimensions, expected {expected}")]
    RankMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} has a zero extent on axis {axis}")]
    ZeroChunk { what: &'static str, axis: usize },
    #[error("source chunk memory ({chunk_mem}) exceeds max_mem ({max_mem})")]
    SourceChunkExceedsMaxMem { chunk_mem: u128, max_mem: u64 },
    #[error("target chunk memory ({chunk_mem}) exceeds max_mem ({max_mem})")]
    TargetChunkExceedsMaxMem { chunk_mem: u128, max_mem: u64 },
    #[error("invalid copy spec: {0}")]
    InvalidCopySpec(String),

    // Execution errors.
    #[error("copying block {block:?} of {array} ({stage}) failed: {source}")]
    Task {
        array: String,
        stage: String,
        block: Vec<u64>,
        #[source]
        source: Box<Error>,
    },
    #[error("region {region} is not aligned to the chunks {chunks:?} of {array}")]
    RegionMisaligned {
        array: String,
        region: zarrs::array::ArraySubset,
        chunks: Vec<u64>,
    },
    #[error("region {region} is out of bounds of {array} with shape {shape:?}")]
    RegionOutOfBounds {
        array: String,
        region: zarrs::array::ArraySubset,
        shape: Vec<u64>,
    },
    #[error("expected {expected} bytes for region {region}, got {actual}")]
    BufferSizeMismatch {
        region: zarrs::array::ArraySubset,
        expected: usize,
        actual: usize,
    },
    #[error("plan was prepared by another executor (expected a {0} plan)")]
    PlanMismatch(&'static str),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    /// Whether this error was raised while configuring or planning, i.e. before any I/O.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            Self::Task { .. }
                | Self::RegionMisaligned { .. }
                | Self::RegionOutOfBounds { .. }
                | Self::BufferSizeMismatch { .. }
                | Self::PlanMismatch(_)
                | Self::ThreadPool(_)
                | Self::Wrapped(_)
                | Self::General(_)
        )
    }
}

pub(crate) fn lock_poisoned<T>(_: T) -> Error {
    Error::general("lock poisoned by a panicked writer")
}
