//! Rechunk a Zarr V3 array or group on the filesystem.

use std::{collections::BTreeMap, sync::Arc};

use clap::Parser;
use zarrs::{
    filesystem::FilesystemStore,
    hierarchy::NodePath,
    node::node_exists,
    storage::ReadableWritableListableStorage,
};
use zarrs_rechunker::{
    Error, ExecuteOptions, RechunkOptions, Result, Source, TargetChunks, TargetChunksSpec,
    executor::get_executor_with_threads,
    rechunk,
    storage::{
        ArrayLocation,
        zarr::{ZarrArray, ZarrGroup, ZarrLocation},
    },
};

#[derive(Parser, Debug)]
#[command(name = "zarrs_rechunk")]
#[command(about = "Rechunk a Zarr V3 array or group with bounded memory")]
struct Args {
    /// Path to the source Zarr hierarchy
    source: String,
    /// Path to the target Zarr hierarchy
    target: String,
    /// Node within the source hierarchy
    #[arg(long, default_value = "/")]
    source_node: String,
    /// Target chunks of an array source, e.g. 100,-1,10 (-1 for the full axis)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    chunks: Option<Vec<i64>>,
    /// Target chunks of a group member, e.g. temperature=1,-1,-1; repeat for each member
    #[arg(long = "member", value_parser = parse_member)]
    members: Vec<(String, Vec<i64>)>,
    /// Maximum memory per task, e.g. 100MB
    #[arg(long, default_value = "256MB")]
    max_mem: String,
    /// Path to a Zarr hierarchy for intermediate arrays
    #[arg(long)]
    temp: Option<String>,
    /// Name of the target array within the target hierarchy
    #[arg(long)]
    array: Option<String>,
    /// Executor name
    #[arg(long, default_value = "rayon")]
    executor: String,
    /// Number of threads for the rayon executor
    #[arg(long)]
    threads: Option<usize>,
    /// Number of retries for each failed block copy
    #[arg(long, default_value_t = 0)]
    retries: u32,
    /// Replace existing target arrays
    #[arg(long)]
    overwrite: bool,
}

fn parse_member(text: &str) -> std::result::Result<(String, Vec<i64>), String> {
    let (name, chunks) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=CHUNKS, got {text}"))?;
    let chunks = chunks
        .split(',')
        .map(|c| c.trim().parse::<i64>().map_err(|e| format!("{c}: {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((name.to_string(), chunks))
}

fn open_store(path: &str) -> Result<ReadableWritableListableStorage> {
    Ok(Arc::new(FilesystemStore::new(path).map_err(Error::wrap)?))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let source_store = open_store(&args.source)?;
    let source_node = NodePath::new(&args.source_node).map_err(Error::wrap)?;
    if !node_exists(&source_store, &source_node).map_err(Error::wrap)? {
        return Err(Error::general(format!(
            "no Zarr node at {} in {}",
            args.source_node, args.source
        )));
    }
    let (source, target_chunks) = if args.members.is_empty() {
        let array = ZarrArray::open(source_store, &args.source_node)?;
        let chunks = match args.chunks {
            Some(chunks) => TargetChunksSpec::Array(TargetChunks::Shape(chunks)),
            None => TargetChunksSpec::Unchanged,
        };
        (Source::Array(Arc::new(array)), chunks)
    } else {
        let group = ZarrGroup::open(source_store, &args.source_node)?;
        let members: BTreeMap<_, _> = args
            .members
            .into_iter()
            .map(|(name, chunks)| (name, Some(TargetChunks::Shape(chunks))))
            .collect();
        (
            Source::Group(Arc::new(group)),
            TargetChunksSpec::Members(members),
        )
    };

    let mut target_options = serde_json::Map::new();
    if args.overwrite {
        target_options.insert("overwrite".to_string(), true.into());
    }
    let mut options = RechunkOptions::default().with_target_options(target_options);
    options = options.with_executor(get_executor_with_threads(&args.executor, args.threads)?);
    if let Some(temp) = &args.temp {
        let temp: Arc<dyn ArrayLocation> = Arc::new(ZarrLocation::new(open_store(temp)?, "/"));
        options = options.with_temp_store(temp);
    }
    if let Some(array) = args.array {
        options = options.with_array_name(array);
    }

    let target: Arc<dyn ArrayLocation> =
        Arc::new(ZarrLocation::new(open_store(&args.target)?, "/"));
    let rechunked = rechunk(source, target_chunks, args.max_mem, target, options)?;
    println!("{rechunked}");
    rechunked.execute(&ExecuteOptions::default().with_retries(args.retries))?;
    Ok(())
}
