//! The user facing entry point, [`rechunk`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    Error, Result,
    algorithm::{RechunkPlan, normalize_chunks, rechunking_plan},
    config::{MaxMem, MemberOptions, StorageOptions, variable_options},
    executor::{CopySpecExecutor, ExecuteOptions, ExecutionPlan, ExecutorSelector},
    storage::{ArrayHandle, ArrayLocation, ArrayTemplate, SourceGroup},
    types::{ArrayProxy, CopySpec, Intermediate},
};

/// A variable of a [`Dataset`]: an array with named dimensions.
#[derive(Debug, Clone)]
pub struct Variable {
    pub array: ArrayHandle,
    pub dims: Vec<String>,
    pub attributes: Map<String, Value>,
}

impl Variable {
    pub fn new(array: ArrayHandle, dims: &[&str]) -> Self {
        Self {
            array,
            dims: dims.iter().map(|d| d.to_string()).collect(),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A collection of variables sharing named dimensions.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub attributes: Map<String, Value>,
    pub variables: BTreeMap<String, Variable>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, variable: Variable) -> Self {
        self.variables.insert(name.into(), variable);
        self
    }

    /// The length of every dimension used by a variable.
    pub fn dim_lengths(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for variable in self.variables.values() {
            for (dim, len) in variable.dims.iter().zip(variable.array.shape()) {
                out.entry(dim.clone()).or_insert(len);
            }
        }
        out
    }
}

/// What to rechunk.
#[derive(Debug, Clone)]
pub enum Source {
    Array(ArrayHandle),
    Group(Arc<dyn SourceGroup>),
    Dataset(Dataset),
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Group(_) => "group",
            Self::Dataset(_) => "dataset",
        }
    }
}

impl From<ArrayHandle> for Source {
    fn from(value: ArrayHandle) -> Self {
        Self::Array(value)
    }
}

impl From<Arc<dyn SourceGroup>> for Source {
    fn from(value: Arc<dyn SourceGroup>) -> Self {
        Self::Group(value)
    }
}

impl From<Dataset> for Source {
    fn from(value: Dataset) -> Self {
        Self::Dataset(value)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(array) => write_array(f, array),
            Self::Group(group) => write!(f, "<group {}>", group.path()),
            Self::Dataset(dataset) => write!(
                f,
                "<dataset with variables {:?}>",
                dataset.variables.keys().collect::<Vec<_>>()
            ),
        }
    }
}

fn write_array(f: &mut fmt::Formatter<'_>, array: &ArrayHandle) -> fmt::Result {
    write!(
        f,
        "<array {} {:?} {}>",
        array.path(),
        array.shape(),
        array.element_type()
    )
}

/// The target chunk shape of one array.
///
/// Negative extents, and extents larger than the axis, mean the full axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChunks {
    /// One extent per axis.
    Shape(Vec<i64>),
    /// One extent per dimension name; every dimension of the array must be present.
    Named(BTreeMap<String, i64>),
    /// A single extent, used for one dimension of a dataset.
    Extent(i64),
}

impl From<Vec<i64>> for TargetChunks {
    fn from(value: Vec<i64>) -> Self {
        Self::Shape(value)
    }
}

impl From<&[i64]> for TargetChunks {
    fn from(value: &[i64]) -> Self {
        Self::Shape(value.to_vec())
    }
}

impl From<i64> for TargetChunks {
    fn from(value: i64) -> Self {
        Self::Extent(value)
    }
}

/// Target chunks for a rechunking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetChunksSpec {
    /// Keep the source chunks.
    #[default]
    Unchanged,
    /// Target chunks of a single array.
    Array(TargetChunks),
    /// Target chunks keyed by group member, dataset variable or dataset dimension.
    ///
    /// Members mapped to [`None`] keep their chunks.
    Members(BTreeMap<String, Option<TargetChunks>>),
}

impl From<TargetChunks> for TargetChunksSpec {
    fn from(value: TargetChunks) -> Self {
        Self::Array(value)
    }
}

impl From<Vec<i64>> for TargetChunksSpec {
    fn from(value: Vec<i64>) -> Self {
        Self::Array(TargetChunks::Shape(value))
    }
}

impl From<BTreeMap<String, Option<TargetChunks>>> for TargetChunksSpec {
    fn from(value: BTreeMap<String, Option<TargetChunks>>) -> Self {
        Self::Members(value)
    }
}

/// Options for [`rechunk`].
#[derive(Debug, Clone, Default)]
pub struct RechunkOptions {
    /// Storage options for target arrays.
    pub target_options: MemberOptions,
    /// Where intermediate arrays are created, if needed.
    pub temp_store: Option<Arc<dyn ArrayLocation>>,
    /// Storage options for intermediate arrays; the target options if [`None`].
    pub temp_options: Option<MemberOptions>,
    pub executor: ExecutorSelector,
    /// The name of the target array within the target location, when rechunking a single array.
    pub array_name: Option<String>,
}

impl RechunkOptions {
    #[must_use]
    pub fn with_target_options(mut self, options: impl Into<MemberOptions>) -> Self {
        self.target_options = options.into();
        self
    }

    #[must_use]
    pub fn with_temp_store(mut self, temp_store: Arc<dyn ArrayLocation>) -> Self {
        self.temp_store = Some(temp_store);
        self
    }

    #[must_use]
    pub fn with_temp_options(mut self, options: impl Into<MemberOptions>) -> Self {
        self.temp_options = Some(options.into());
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<ExecutorSelector>) -> Self {
        self.executor = executor.into();
        self
    }

    #[must_use]
    pub fn with_array_name(mut self, array_name: impl Into<String>) -> Self {
        self.array_name = Some(array_name.into());
        self
    }
}

/// The result of a rechunking: a single array or a group of arrays.
#[derive(Debug, Clone)]
pub enum RechunkedTarget {
    Array(ArrayHandle),
    Group(Arc<dyn ArrayLocation>),
}

impl RechunkedTarget {
    pub fn as_array(&self) -> Option<&ArrayHandle> {
        match self {
            Self::Array(array) => Some(array),
            Self::Group(_) => None,
        }
    }
}

impl fmt::Display for RechunkedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(array) => write_array(f, array),
            Self::Group(location) => write!(f, "<group {}>", location.describe()),
        }
    }
}

/// A prepared rechunking, ready to execute.
#[derive(Debug)]
pub struct Rechunked {
    executor: Arc<dyn CopySpecExecutor>,
    plan: ExecutionPlan,
    source: Source,
    intermediate: Option<RechunkedTarget>,
    target: RechunkedTarget,
}

impl Rechunked {
    /// The executor specific plan.
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn executor(&self) -> &Arc<dyn CopySpecExecutor> {
        &self.executor
    }

    pub fn intermediate(&self) -> Option<&RechunkedTarget> {
        self.intermediate.as_ref()
    }

    pub fn target(&self) -> &RechunkedTarget {
        &self.target
    }

    /// Copy the data, returning the target.
    pub fn execute(&self, options: &ExecuteOptions) -> Result<RechunkedTarget> {
        self.executor.execute_plan(&self.plan, options)?;
        Ok(self.target.clone())
    }
}

impl fmt::Display for Rechunked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<Rechunked>")?;
        writeln!(f, "* Source      : {}", self.source)?;
        if let Some(intermediate) = &self.intermediate {
            writeln!(f, "* Intermediate: {intermediate}")?;
        }
        writeln!(f, "* Target      : {}", self.target)
    }
}

/// A fully validated and planned array, not yet allocated.
struct PlannedArray {
    name: Option<String>,
    source: ArrayHandle,
    plan: RechunkPlan,
    target_chunks: Vec<u64>,
    attributes: Map<String, Value>,
    dimension_names: Option<Vec<String>>,
    target_options: StorageOptions,
    temp_options: StorageOptions,
}

/// Extent for one axis of length `len`; negative or oversized extents mean the full axis.
fn resolve_extent(extent: i64, len: u64) -> u64 {
    match u64::try_from(extent) {
        Ok(e) if e <= len => e,
        _ => len.max(1),
    }
}

/// Resolve target chunks against an array, defaulting to its current chunks.
///
/// Named chunks are matched against `dims`, or the array's own dimension names if [`None`].
fn resolve_target_chunks(
    array: &ArrayHandle,
    dims: Option<&[String]>,
    target_chunks: Option<&TargetChunks>,
) -> Result<Vec<u64>> {
    let shape = array.shape();
    let extents = match target_chunks {
        None => return Ok(array.chunks()),
        Some(TargetChunks::Shape(extents)) => extents.clone(),
        Some(TargetChunks::Extent(extent)) => vec![*extent],
        Some(TargetChunks::Named(named)) => {
            let dims = dims
                .map(<[String]>::to_vec)
                .or_else(|| array.dimension_names())
                .ok_or_else(|| Error::MissingDimensionNames {
                    array: array.path(),
                })?;
            dims.iter()
                .map(|dim| {
                    named
                        .get(dim)
                        .copied()
                        .ok_or_else(|| Error::MissingDimension {
                            array: array.path(),
                            dimensions: dims.clone(),
                            missing: dim.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?
        }
    };
    if extents.len() != shape.len() {
        return Err(Error::RankMismatch {
            what: "target chunks",
            expected: shape.len(),
            actual: extents.len(),
        });
    }
    Ok(extents
        .iter()
        .zip(&shape)
        .map(|(&e, &len)| resolve_extent(e, len))
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn plan_array(
    name: Option<&str>,
    source: &ArrayHandle,
    target_chunks: &[u64],
    max_mem: u64,
    consolidate_reads: bool,
    target_options: &Map<String, Value>,
    temp_options: &Map<String, Value>,
    has_temp_store: bool,
) -> Result<PlannedArray> {
    let target_options = StorageOptions::from_map(target_options)?;
    let temp_options = StorageOptions::from_map(temp_options)?;
    let shape = source.shape();
    let plan = rechunking_plan(
        &shape,
        &source.chunks(),
        target_chunks,
        source.element_type().size(),
        max_mem,
        consolidate_reads && source.supports_read_consolidation(),
    )?;
    if plan.needs_staging() && !has_temp_store {
        return Err(Error::MissingTempStore(name.map(str::to_string)));
    }
    Ok(PlannedArray {
        name: name.map(str::to_string),
        source: source.clone(),
        target_chunks: normalize_chunks("target chunks", &shape, target_chunks)?,
        plan,
        attributes: source.attributes(),
        dimension_names: source.dimension_names(),
        target_options,
        temp_options,
    })
}

/// Create the target and intermediate arrays of a planned array.
fn allocate(
    planned: PlannedArray,
    target_store: &dyn ArrayLocation,
    temp_store: Option<&dyn ArrayLocation>,
) -> Result<CopySpec> {
    let shape = planned.source.shape();
    let element_type = planned.source.element_type();
    let name = planned.name.as_deref();

    let template = ArrayTemplate::new(shape.clone(), planned.target_chunks, element_type)
        .with_attributes(planned.attributes)
        .with_dimension_names(planned.dimension_names.clone());
    let target = target_store.create_array(name, &template, &planned.target_options)?;

    let intermediate = if planned.plan.needs_staging() {
        let temp_store = temp_store.ok_or_else(|| Error::MissingTempStore(planned.name.clone()))?;
        let template = ArrayTemplate::new(shape, planned.plan.int_chunks.clone(), element_type)
            .with_dimension_names(planned.dimension_names);
        let staging = temp_store.create_array(name, &template, &planned.temp_options)?;
        Intermediate::Staged(ArrayProxy::new(staging, planned.plan.int_chunks))
    } else {
        Intermediate::Direct {
            chunks: planned.plan.int_chunks,
        }
    };

    CopySpec::new(
        ArrayProxy::new(planned.source, planned.plan.read_chunks),
        intermediate,
        ArrayProxy::new(target, planned.plan.write_chunks),
    )
}

/// Target chunks of every dataset variable, from chunks keyed by dimension name.
///
/// A dimension without an entry keeps the full length, or the variable's own chunk if the variable cannot consolidate reads.
fn dataset_chunks_from_dims(
    dataset: &Dataset,
    dim_chunks: &BTreeMap<String, Option<TargetChunks>>,
) -> Result<BTreeMap<String, Option<TargetChunks>>> {
    let mut out = BTreeMap::new();
    for (name, variable) in &dataset.variables {
        let shape = variable.array.shape();
        let chunks = variable.array.chunks();
        let mut extents = Vec::with_capacity(shape.len());
        for (axis, (dim, &len)) in variable.dims.iter().zip(&shape).enumerate() {
            let extent = match dim_chunks.get(dim) {
                Some(Some(TargetChunks::Extent(e))) => resolve_extent(*e, len),
                Some(Some(TargetChunks::Shape(e))) if e.len() == 1 => resolve_extent(e[0], len),
                Some(Some(other)) => {
                    return Err(Error::general(format!(
                        "chunks of dimension {dim} must be a single extent, got {other:?}"
                    )));
                }
                Some(None) => len.max(1),
                None if variable.array.supports_read_consolidation() => len.max(1),
                None => chunks[axis],
            };
            extents.push(extent as i64);
        }
        out.insert(name.clone(), Some(TargetChunks::Shape(extents)));
    }
    Ok(out)
}

/// Plan a rechunking of `source` into `target_store` using at most `max_mem` bytes per task.
///
/// Everything is validated and planned before any array is created,
/// so configuration and planning errors leave the target untouched.
/// Nothing is copied until [`Rechunked::execute`] is called.
///
/// - A single array is created at `options.array_name` within `target_store`, or at its root.
/// - For a group, `target_chunks` must be given per member; nested groups and attributes are recreated and only the listed members are rechunked.
/// - For a dataset, `target_chunks` must be given per variable, or per dimension if every key is a dimension name.
///
/// An intermediate array is created in `options.temp_store` for arrays whose read and write chunks are incompatible.
///
/// # Errors
/// Returns a configuration or planning [`Error`] if the request is invalid, or a storage error if arrays cannot be created.
pub fn rechunk(
    source: impl Into<Source>,
    target_chunks: impl Into<TargetChunksSpec>,
    max_mem: impl Into<MaxMem>,
    target_store: Arc<dyn ArrayLocation>,
    options: RechunkOptions,
) -> Result<Rechunked> {
    let source = source.into();
    let target_chunks = target_chunks.into();
    let max_mem = max_mem.into().to_bytes()?;
    let executor = options.executor.resolve()?;
    let temp_options = options
        .temp_options
        .clone()
        .unwrap_or_else(|| options.target_options.clone());
    let has_temp_store = options.temp_store.is_some();

    if !matches!(source, Source::Array(_)) {
        if options.array_name.is_some() {
            return Err(Error::ArrayNameNotAllowed(source.kind()));
        }
        if !matches!(target_chunks, TargetChunksSpec::Members(_)) {
            return Err(Error::TargetChunksRequired(source.kind()));
        }
    }

    // Validate and plan everything before allocating.
    let mut subgroups = Vec::new();
    let mut root_attributes = Map::new();
    let planned: Vec<PlannedArray> = match (&source, &target_chunks) {
        (Source::Array(_), TargetChunksSpec::Members(_)) => {
            return Err(Error::UnexpectedMemberChunks);
        }
        (Source::Array(array), spec) => {
            let chunks = match spec {
                TargetChunksSpec::Array(chunks) => Some(chunks),
                _ => None,
            };
            let name = options.array_name.as_deref();
            vec![plan_array(
                name,
                array,
                &resolve_target_chunks(array, None, chunks)?,
                max_mem,
                true,
                &options.target_options.for_member(name),
                &temp_options.for_member(name),
                has_temp_store,
            )?]
        }
        (Source::Group(group), TargetChunksSpec::Members(members)) => {
            subgroups = group.subgroups()?;
            root_attributes = group.attributes()?;
            members
                .iter()
                .map(|(name, chunks)| {
                    let array = group.array(name)?;
                    plan_array(
                        Some(name.as_str()),
                        &array,
                        &resolve_target_chunks(&array, None, chunks.as_ref())?,
                        max_mem,
                        true,
                        &options.target_options.for_member(Some(name.as_str())),
                        &temp_options.for_member(Some(name.as_str())),
                        has_temp_store,
                    )
                })
                .collect::<Result<_>>()?
        }
        (Source::Dataset(dataset), TargetChunksSpec::Members(members)) => {
            root_attributes = dataset.attributes.clone();
            let dim_lengths = dataset.dim_lengths();
            let members = if members.keys().all(|k| dim_lengths.contains_key(k)) {
                dataset_chunks_from_dims(dataset, members)?
            } else {
                if let Some(missing) = members
                    .keys()
                    .find(|k| !dataset.variables.contains_key(*k))
                {
                    return Err(Error::MissingMember {
                        source_path: source.to_string(),
                        member: missing.clone(),
                    });
                }
                members.clone()
            };
            dataset
                .variables
                .iter()
                .map(|(name, variable)| {
                    if variable.dims.len() != variable.array.shape().len() {
                        return Err(Error::RankMismatch {
                            what: "dimension names",
                            expected: variable.array.shape().len(),
                            actual: variable.dims.len(),
                        });
                    }
                    let member_options = options.target_options.for_member(Some(name.as_str()));
                    let var_options = variable_options(name, &member_options)?;
                    let chunks = members.get(name).cloned().flatten();
                    let target_chunks = resolve_target_chunks(
                        &variable.array,
                        Some(variable.dims.as_slice()),
                        chunks.as_ref(),
                    )?;
                    let mut planned = plan_array(
                        Some(name.as_str()),
                        &variable.array,
                        &target_chunks,
                        max_mem,
                        false,
                        &var_options,
                        &var_options,
                        has_temp_store,
                    )?;
                    planned.attributes = variable.attributes.clone();
                    planned.dimension_names = Some(variable.dims.clone());
                    Ok(planned)
                })
                .collect::<Result<_>>()?
        }
        (_, _) => return Err(Error::TargetChunksRequired(source.kind())),
    };

    // Refuse to replace existing arrays before creating any.
    let temp_store = options.temp_store.as_deref();
    for planned in &planned {
        let name = planned.name.as_deref();
        target_store.check_vacant(name, &planned.target_options)?;
        if let (true, Some(temp_store)) = (planned.plan.needs_staging(), temp_store) {
            temp_store.check_vacant(name, &planned.temp_options)?;
        }
    }

    // Allocate.
    let is_array = matches!(source, Source::Array(_));
    if !is_array {
        for (path, attributes) in &subgroups {
            target_store.create_group(path, attributes)?;
        }
        target_store.update_attributes(&root_attributes)?;
    }
    let specs = planned
        .into_iter()
        .map(|p| allocate(p, target_store.as_ref(), temp_store))
        .collect::<Result<Vec<_>>>()?;

    let plan = executor.prepare_plan(&specs)?;
    log::info!(
        "planned rechunking of {} arrays into {} tasks with {}",
        specs.len(),
        plan.num_tasks(),
        executor.name()
    );

    let (intermediate, target) = if is_array {
        let spec = &specs[0];
        (
            spec.intermediate()
                .array()
                .map(|a| RechunkedTarget::Array(a.clone())),
            RechunkedTarget::Array(spec.write().array.clone()),
        )
    } else {
        (
            options.temp_store.clone().map(RechunkedTarget::Group),
            RechunkedTarget::Group(target_store),
        )
    };

    Ok(Rechunked {
        executor,
        plan,
        source,
        intermediate,
        target,
    })
}
