use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::Bytes;
use serde_json::{Map, Value, json};
use zarrs_rechunker::{
    Dataset, Error, ExecuteOptions, RechunkOptions, Result, Source, TargetChunks, Variable,
    metadata::{DIMENSION_KEY, ElementType},
    rechunk,
    storage::{
        ArrayHandle, ArrayLocation, ChunkedArray, SourceGroup,
        memory::{MemoryArray, MemoryLocation},
    },
    zarrs::array::ArraySubset,
};

fn init() {
    env_logger::try_init().ok();
}

/// An array whose bytes count up from zero, wrapping at 256.
fn iota(path: &str, shape: Vec<u64>, chunks: Vec<u64>, element_type: ElementType) -> MemoryArray {
    let len = shape.iter().product::<u64>() as usize * element_type.size();
    let data = (0..len).map(|i| (i % 251) as u8).collect();
    MemoryArray::from_bytes(path, shape, chunks, element_type, data).unwrap()
}

/// A zero-filled uint8 array of ten elements in chunks of five.
fn small_array() -> ArrayHandle {
    Arc::new(MemoryArray::new("source", vec![10], vec![5], ElementType::UInt8).unwrap())
}

fn location(name: &str) -> (Arc<MemoryLocation>, Arc<dyn ArrayLocation>) {
    let location = Arc::new(MemoryLocation::new(name));
    let dynamic: Arc<dyn ArrayLocation> = location.clone();
    (location, dynamic)
}

fn options(items: Value) -> Map<String, Value> {
    match items {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[test]
fn one_dimensional_rechunk() {
    init();
    let source = Arc::new(iota("source", vec![100], vec![10], ElementType::Float32));
    let (target, target_store) = location("target");
    let handle: ArrayHandle = source.clone();
    let rechunked =
        rechunk(handle, vec![7], 280u64, target_store, RechunkOptions::default()).unwrap();
    assert!(rechunked.intermediate().is_none());
    // Writes of 70 elements, so two tasks.
    assert_eq!(rechunked.plan().num_tasks(), 2);

    let result = rechunked.execute(&ExecuteOptions::default()).unwrap();
    let array = result.as_array().unwrap();
    assert_eq!(array.chunks(), vec![7]);
    assert_eq!(array.shape(), vec![100]);
    let written = target.get("").unwrap();
    assert_eq!(written.to_bytes().unwrap(), source.to_bytes().unwrap());
}

#[test]
fn transpose_chunks_through_intermediate() {
    init();
    let source = Arc::new(iota("source", vec![100, 100], vec![100, 1], ElementType::Float64));
    let (target, target_store) = location("target");
    let (temp, temp_store) = location("temp");
    let handle: ArrayHandle = source.clone();
    let rechunked = rechunk(
        handle,
        vec![1, 100],
        8000u64,
        target_store,
        RechunkOptions::default().with_temp_store(temp_store),
    )
    .unwrap();

    let staging = rechunked.intermediate().and_then(|i| i.as_array()).unwrap();
    assert_eq!(staging.chunks(), vec![10, 10]);
    // 100 staging blocks of 10x10, then 10 write blocks of 10x100.
    assert_eq!(rechunked.plan().num_tasks(), 110);

    rechunked.execute(&ExecuteOptions::default()).unwrap();
    assert_eq!(target.get("").unwrap().chunks(), vec![1, 100]);
    assert_eq!(
        target.get("").unwrap().to_bytes().unwrap(),
        source.to_bytes().unwrap()
    );
    assert_eq!(
        temp.get("").unwrap().to_bytes().unwrap(),
        source.to_bytes().unwrap()
    );
}

#[test]
fn missing_temp_store_allocates_nothing() {
    init();
    let source: ArrayHandle = Arc::new(iota(
        "source",
        vec![100, 100],
        vec![100, 1],
        ElementType::Float64,
    ));
    let (target, target_store) = location("target");
    let result = rechunk(
        source,
        vec![1, 100],
        8000u64,
        target_store,
        RechunkOptions::default(),
    );
    assert!(matches!(result, Err(Error::MissingTempStore(None))));
    assert!(target.array_paths().is_empty());
}

#[test]
fn unchanged_chunks_copy_directly() {
    init();
    let source = Arc::new(iota("source", vec![30, 40], vec![10, 10], ElementType::UInt16));
    let (target, target_store) = location("target");
    let handle: ArrayHandle = source.clone();
    let rechunked = rechunk(
        handle,
        zarrs_rechunker::TargetChunksSpec::Unchanged,
        "1MB",
        target_store,
        RechunkOptions::default(),
    )
    .unwrap();
    assert!(rechunked.intermediate().is_none());
    // The whole array fits in one block.
    assert_eq!(rechunked.plan().num_tasks(), 1);
    rechunked.execute(&ExecuteOptions::default()).unwrap();
    let written = target.get("").unwrap();
    assert_eq!(written.chunks(), vec![10, 10]);
    assert_eq!(written.to_bytes().unwrap(), source.to_bytes().unwrap());
}

#[test]
fn execution_is_repeatable() {
    init();
    let source = Arc::new(iota("source", vec![12, 12], vec![12, 1], ElementType::UInt8));
    let (target, target_store) = location("target");
    let (_, temp_store) = location("temp");
    let handle: ArrayHandle = source.clone();
    let rechunked = rechunk(
        handle,
        vec![1, 12],
        36u64,
        target_store,
        RechunkOptions::default().with_temp_store(temp_store),
    )
    .unwrap();
    rechunked.execute(&ExecuteOptions::default()).unwrap();
    rechunked.execute(&ExecuteOptions::default()).unwrap();
    assert_eq!(
        target.get("").unwrap().to_bytes().unwrap(),
        source.to_bytes().unwrap()
    );
}

#[test]
fn oversized_source_chunks_are_rejected_before_allocation() {
    init();
    let source: ArrayHandle = Arc::new(
        MemoryArray::new("source", vec![100, 100], vec![100, 100], ElementType::UInt8).unwrap(),
    );
    let (target, target_store) = location("target");
    let result = rechunk(
        source,
        vec![10, 10],
        1000u64,
        target_store,
        RechunkOptions::default(),
    );
    match result {
        Err(e @ Error::SourceChunkExceedsMaxMem { .. }) => assert!(e.is_configuration()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(target.array_paths().is_empty());
}

#[test]
fn invalid_max_mem() {
    init();
    let source = small_array();
    let (_, target_store) = location("target");
    let result = rechunk(source, vec![2], "lots", target_store, RechunkOptions::default());
    assert!(matches!(result, Err(Error::InvalidMaxMem(_))));
}

#[test]
fn named_array_in_target() {
    init();
    let source: ArrayHandle = Arc::new(iota("source", vec![20], vec![4], ElementType::Int32));
    let (target, target_store) = location("target");
    rechunk(
        source,
        vec![10],
        "1KB",
        target_store,
        RechunkOptions::default().with_array_name("renamed"),
    )
    .unwrap()
    .execute(&ExecuteOptions::default())
    .unwrap();
    assert_eq!(target.array_paths(), vec!["renamed".to_string()]);
}

#[test]
fn group_rechunk_recreates_hierarchy() {
    init();
    let source = Arc::new(MemoryLocation::new("source"));
    let a = source
        .insert_array("a", iota("a", vec![20, 20], vec![20, 1], ElementType::UInt8))
        .unwrap();
    let b = source
        .insert_array("sub/b", iota("b", vec![10], vec![5], ElementType::Int64))
        .unwrap();
    source
        .create_group("sub", &options(json!({"level": 1})))
        .unwrap();
    ArrayLocation::update_attributes(source.as_ref(), &options(json!({"title": "demo"})))
        .unwrap();

    let (target, target_store) = location("target");
    let members = BTreeMap::from([
        ("a".to_string(), Some(TargetChunks::Shape(vec![1, 20]))),
        ("sub/b".to_string(), None),
    ]);
    let group: Arc<dyn SourceGroup> = source.clone();
    let rechunked =
        rechunk(group, members, 400u64, target_store, RechunkOptions::default()).unwrap();
    assert!(rechunked.target().as_array().is_none());
    rechunked.execute(&ExecuteOptions::default()).unwrap();

    assert_eq!(target.array_paths(), vec!["a".to_string(), "sub/b".to_string()]);
    assert_eq!(target.get("a").unwrap().chunks(), vec![1, 20]);
    assert_eq!(target.get("sub/b").unwrap().chunks(), vec![5]);
    assert_eq!(
        target.get("a").unwrap().to_bytes().unwrap(),
        a.to_bytes().unwrap()
    );
    assert_eq!(
        target.get("sub/b").unwrap().to_bytes().unwrap(),
        b.to_bytes().unwrap()
    );
    assert_eq!(target.group_attributes("").unwrap()["title"], "demo");
    assert_eq!(target.group_attributes("sub").unwrap()["level"], 1);
}

#[test]
fn group_requires_member_chunks() {
    init();
    let source: Arc<dyn SourceGroup> = Arc::new(MemoryLocation::new("source"));
    let (_, target_store) = location("target");
    let result = rechunk(
        source.clone(),
        vec![1],
        400u64,
        target_store.clone(),
        RechunkOptions::default(),
    );
    assert!(matches!(result, Err(Error::TargetChunksRequired("group"))));

    let members = BTreeMap::from([("missing".to_string(), None)]);
    let result = rechunk(source, members, 400u64, target_store, RechunkOptions::default());
    assert!(matches!(
        result,
        Err(Error::MissingMember { member, .. }) if member == "missing"
    ));
}

#[test]
fn dataset_rechunk_by_dimension() {
    init();
    let temperature = Arc::new(iota(
        "temperature",
        vec![8, 6],
        vec![1, 6],
        ElementType::Float32,
    ));
    let time = Arc::new(iota("time", vec![8], vec![8], ElementType::Int64));
    let dataset = Dataset::new()
        .with_attributes(options(json!({"source": "model"})))
        .with_variable(
            "temperature",
            Variable::new(temperature.clone(), &["time", "x"])
                .with_attributes(options(json!({"units": "K"}))),
        )
        .with_variable("time", Variable::new(time.clone(), &["time"]));
    let dims = BTreeMap::from([
        ("time".to_string(), Some(TargetChunks::Extent(4))),
        ("x".to_string(), None),
    ]);
    let (target, target_store) = location("target");
    let source = Source::from(dataset);
    let rechunked =
        rechunk(source, dims, "1MB", target_store, RechunkOptions::default()).unwrap();
    assert!(rechunked.to_string().contains("<dataset with variables"));
    rechunked.execute(&ExecuteOptions::default()).unwrap();

    let written = target.get("temperature").unwrap();
    assert_eq!(written.chunks(), vec![4, 6]);
    assert_eq!(written.to_bytes().unwrap(), temperature.to_bytes().unwrap());
    assert_eq!(
        written.dimension_names(),
        Some(vec!["time".to_string(), "x".to_string()])
    );
    let attributes = written.attributes();
    assert_eq!(attributes["units"], "K");
    assert_eq!(attributes[DIMENSION_KEY], json!(["time", "x"]));
    assert_eq!(target.get("time").unwrap().chunks(), vec![4]);
    assert_eq!(target.group_attributes("").unwrap()["source"], "model");
}

#[test]
fn dataset_rejects_chunks_in_options() {
    init();
    let array = Arc::new(MemoryArray::new("v", vec![4], vec![2], ElementType::UInt8).unwrap());
    let dataset = Dataset::new().with_variable("v", Variable::new(array, &["x"]));
    let (target, target_store) = location("target");
    let members = BTreeMap::from([("v".to_string(), Some(TargetChunks::Shape(vec![4])))]);
    let result = rechunk(
        dataset,
        members,
        "1KB",
        target_store,
        RechunkOptions::default().with_target_options(options(json!({"chunks": [2]}))),
    );
    assert!(matches!(result, Err(Error::ChunksInOptions(v)) if v == "v"));
    assert!(target.array_paths().is_empty());
}

#[test]
fn dataset_named_chunks_use_variable_dims() {
    init();
    // No dimension names are stored on the array itself.
    let array = Arc::new(iota("v", vec![4, 6], vec![4, 1], ElementType::UInt8));
    let dataset = Dataset::new().with_variable("v", Variable::new(array.clone(), &["y", "x"]));
    let named = BTreeMap::from([("y".to_string(), 1), ("x".to_string(), 6)]);
    let members = BTreeMap::from([("v".to_string(), Some(TargetChunks::Named(named)))]);
    let (target, target_store) = location("target");
    let (_, temp_store) = location("temp");
    rechunk(
        dataset,
        members,
        "1KB",
        target_store,
        RechunkOptions::default().with_temp_store(temp_store),
    )
    .unwrap()
    .execute(&ExecuteOptions::default())
    .unwrap();
    let written = target.get("v").unwrap();
    assert_eq!(written.chunks(), vec![1, 6]);
    assert_eq!(written.to_bytes().unwrap(), array.to_bytes().unwrap());
}

#[test]
fn existing_member_blocks_every_allocation() {
    init();
    let source = Arc::new(MemoryLocation::new("source"));
    for name in ["a", "b"] {
        source
            .insert_array(name, iota(name, vec![8], vec![4], ElementType::UInt8))
            .unwrap();
    }
    let (target, target_store) = location("target");
    target
        .insert_array("b", MemoryArray::new("b", vec![2], vec![2], ElementType::UInt8).unwrap())
        .unwrap();
    let members = BTreeMap::from([
        ("a".to_string(), Some(TargetChunks::Shape(vec![8]))),
        ("b".to_string(), Some(TargetChunks::Shape(vec![8]))),
    ]);
    let group: Arc<dyn SourceGroup> = source.clone();
    let result = rechunk(
        group.clone(),
        members.clone(),
        "1KB",
        target_store.clone(),
        RechunkOptions::default(),
    );
    match result {
        Err(e @ Error::NodeExists(_)) => assert!(e.is_configuration()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(target.array_paths(), vec!["b".to_string()]);
    assert!(target.group_attributes("").is_none());

    let overwrite = options(json!({"overwrite": true}));
    rechunk(
        group,
        members,
        "1KB",
        target_store,
        RechunkOptions::default().with_target_options(overwrite),
    )
    .unwrap()
    .execute(&ExecuteOptions::default())
    .unwrap();
    assert_eq!(target.array_paths(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(target.get("b").unwrap().shape(), vec![8]);
}

#[test]
fn unknown_executor() {
    init();
    let source = small_array();
    let (target, target_store) = location("target");
    let result = rechunk(
        source,
        vec![2],
        "1KB",
        target_store,
        RechunkOptions::default().with_executor("dask"),
    );
    assert!(matches!(result, Err(Error::UnknownExecutor(name)) if name == "dask"));
    assert!(target.array_paths().is_empty());
}

#[test]
fn invalid_storage_option() {
    init();
    let source = small_array();
    let (target, target_store) = location("target");
    let result = rechunk(
        source,
        vec![2],
        "1KB",
        target_store,
        RechunkOptions::default().with_target_options(options(json!({"shards": 4}))),
    );
    assert!(matches!(
        result,
        Err(Error::InvalidStorageOption { option, .. }) if option == "shards"
    ));
    assert!(target.array_paths().is_empty());
}

#[test]
fn every_executor_gives_the_same_result() {
    init();
    for executor in zarrs_rechunker::executor::registered_executors() {
        let source = Arc::new(iota("source", vec![24, 24], vec![24, 1], ElementType::UInt8));
        let (target, target_store) = location("target");
        let (_, temp_store) = location("temp");
        let handle: ArrayHandle = source.clone();
        let rechunked = rechunk(
            handle,
            vec![1, 24],
            96u64,
            target_store,
            RechunkOptions::default()
                .with_temp_store(temp_store)
                .with_executor(executor),
        )
        .unwrap();
        assert_eq!(rechunked.executor().name(), executor);
        rechunked.execute(&ExecuteOptions::default()).unwrap();
        assert_eq!(
            target.get("").unwrap().to_bytes().unwrap(),
            source.to_bytes().unwrap(),
            "executor {executor}"
        );
    }
}

/// Fails the first `failures` reads, then delegates.
#[derive(Debug)]
struct FlakyArray {
    inner: Arc<MemoryArray>,
    failures: AtomicU32,
}

impl ChunkedArray for FlakyArray {
    fn path(&self) -> String {
        self.inner.path()
    }

    fn shape(&self) -> Vec<u64> {
        self.inner.shape()
    }

    fn chunks(&self) -> Vec<u64> {
        self.inner.chunks()
    }

    fn element_type(&self) -> ElementType {
        self.inner.element_type()
    }

    fn attributes(&self) -> Map<String, Value> {
        self.inner.attributes()
    }

    fn update_attributes(&self, attributes: Map<String, Value>) -> Result<()> {
        self.inner.update_attributes(attributes)
    }

    fn read_region(&self, subset: &ArraySubset) -> Result<Bytes> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::general("transient read failure"));
        }
        self.inner.read_region(subset)
    }

    fn write_region(&self, subset: &ArraySubset, data: &[u8]) -> Result<()> {
        self.inner.write_region(subset, data)
    }
}

#[test]
fn failed_blocks_are_retried() {
    init();
    let inner = Arc::new(iota("source", vec![16], vec![4], ElementType::UInt8));
    let flaky = |failures| -> ArrayHandle {
        Arc::new(FlakyArray {
            inner: inner.clone(),
            failures: AtomicU32::new(failures),
        })
    };

    let (target, target_store) = location("target");
    let rechunked = rechunk(
        flaky(2),
        vec![8],
        "1KB",
        target_store,
        RechunkOptions::default().with_executor("sequential"),
    )
    .unwrap();
    rechunked
        .execute(&ExecuteOptions::default().with_retries(2))
        .unwrap();
    assert_eq!(
        target.get("").unwrap().to_bytes().unwrap(),
        inner.to_bytes().unwrap()
    );

    let (_, target_store) = location("target");
    let rechunked = rechunk(
        flaky(1),
        vec![8],
        "1KB",
        target_store,
        RechunkOptions::default().with_executor("sequential"),
    )
    .unwrap();
    let error = rechunked.execute(&ExecuteOptions::default()).unwrap_err();
    assert!(matches!(error, Error::Task { .. }));
    assert!(!error.is_configuration());
}

#[test]
fn display() {
    init();
    let source = small_array();
    let (_, target_store) = location("target");
    let rechunked =
        rechunk(source, vec![2], "1KB", target_store, RechunkOptions::default()).unwrap();
    let text = rechunked.to_string();
    assert!(text.starts_with("<Rechunked>\n"));
    assert!(text.contains("* Source      : <array memory://source [10] uint8>"));
    assert!(!text.contains("Intermediate"));
    assert!(text.contains("* Target      : <array memory://target/"));
}
