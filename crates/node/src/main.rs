use exploder_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod rpc_client;
pub mod sync;
pub mod views;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use exploder_chainstate::{
    acquire_sync_lock, rederive_unspent, release_sync_lock, ChainGraph, ChainQuery, LockError,
};
use exploder_consensus::{chain_params, ChainParams, Network};
use exploder_primitives::hex::hash256_from_hex;
use exploder_storage::fjall::{FjallOptions, FjallStore};
use exploder_storage::memory::MemoryStore;
use exploder_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use fs2::FileExt;
use serde::Serialize;
use tokio::sync::Notify;

use crate::rpc_client::{HttpRpcClient, RpcConfig};
use crate::sync::{
    SyncError, SyncOptions, Syncer, DEFAULT_FLUSH_EVERY, DEFAULT_LOCK_TIMEOUT_SECS,
    DEFAULT_MAX_REWIND_DEPTH, DEFAULT_RPC_SYNC_PERCENT,
};
use crate::views::{
    AddressSetView, AddressView, BlockView, HashrateView, OutputView, StatsView,
    SyncHistoryView, SyncReportView, TransactionJson,
};

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "exploder.conf";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DB_DIR_NAME: &str = "db";
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_QUERY_LIMIT: usize = 10;
const DEFAULT_REDERIVE_BATCH: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum QueryCommand {
    Block(String),
    Height(u32),
    Tx(String),
    /// One address or a comma-separated set.
    Address(String),
    Unspent(String),
    Stats,
    LatestBlocks,
    LatestTxs,
    SyncHistory,
    Hashrate,
}

impl QueryCommand {
    fn parse(kind: &str, arg: Option<String>) -> Result<Self, String> {
        let require = |arg: Option<String>| {
            arg.ok_or_else(|| format!("query {kind} needs an argument\n{}", usage()))
        };
        match kind {
            "block" => Ok(Self::Block(require(arg)?)),
            "height" => {
                let raw = require(arg)?;
                raw.parse::<u32>()
                    .map(Self::Height)
                    .map_err(|_| format!("invalid height '{raw}'"))
            }
            "tx" => Ok(Self::Tx(require(arg)?)),
            "address" => Ok(Self::Address(require(arg)?)),
            "unspent" => Ok(Self::Unspent(require(arg)?)),
            "stats" => Ok(Self::Stats),
            "latest-blocks" => Ok(Self::LatestBlocks),
            "latest-txs" => Ok(Self::LatestTxs),
            "sync-history" => Ok(Self::SyncHistory),
            "hashrate" => Ok(Self::Hashrate),
            other => Err(format!("unknown query '{other}'\n{}", usage())),
        }
    }

    fn takes_argument(kind: &str) -> bool {
        matches!(kind, "block" | "height" | "tx" | "address" | "unspent")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Command {
    Sync,
    RederiveUnspent,
    Query(QueryCommand),
}

#[derive(Clone, Debug)]
struct Config {
    command: Command,
    backend: Backend,
    data_dir: PathBuf,
    conf_path: PathBuf,
    network: Network,
    blocks_dir: Option<PathBuf>,
    rpc_url: String,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    rpc_timeout_secs: u64,
    rpc_sync_percent: f64,
    stream_min_height: u32,
    flush_every: usize,
    track_unspent: bool,
    max_rewind_depth: u32,
    lock_timeout_secs: u64,
    daemon: bool,
    sync_interval_secs: u64,
    sync_limit: usize,
    db_cache_bytes: Option<u64>,
    query_limit: usize,
    query_offset: usize,
    log: logging::LogConfig,
}

impl Config {
    fn params(&self) -> ChainParams {
        chain_params(self.network)
    }

    fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            blocks_dir: self.blocks_dir.clone(),
            rpc_sync_percent: self.rpc_sync_percent,
            stream_min_height: self.stream_min_height,
            flush_every: self.flush_every,
            max_rewind_depth: self.max_rewind_depth,
            lock_timeout_secs: self.lock_timeout_secs,
            ..SyncOptions::default()
        }
    }
}

#[derive(Debug)]
enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another exploder instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another exploder instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    let config = match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("exploder {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliAction::Run(config) => *config,
    };

    logging::init(&config.log).map_err(|err| format!("failed to open log file: {err}"))?;
    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!("failed to create data dir {}: {err}", config.data_dir.display())
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;
    let store = Arc::new(open_store(&config)?);
    log_debug!(
        "opened {:?} store under {} ({} network, config {})",
        config.backend,
        config.data_dir.display(),
        config.network,
        config.conf_path.display()
    );

    let result = match config.command.clone() {
        Command::Sync => run_sync(&config, Arc::clone(&store)).await,
        Command::RederiveUnspent => run_rederive(&config, Arc::clone(&store)),
        Command::Query(query) => run_query(&config, Arc::clone(&store), &query),
    };
    if let Err(err) = store.persist() {
        log_warn!("failed to persist store: {err}");
    }
    if let Store::Fjall(fjall) = store.as_ref() {
        log_debug!("index occupies {} bytes on disk", fjall.disk_space());
    }
    result
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let db_path = config.data_dir.join(DB_DIR_NAME);
            let options = FjallOptions {
                cache_bytes: config.db_cache_bytes,
                ..FjallOptions::default()
            };
            FjallStore::open_with_options(&db_path, options)
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))
        }
    }
}

async fn run_sync(config: &Config, store: Arc<Store>) -> Result<(), String> {
    let graph = ChainGraph::open(store, config.params(), config.track_unspent)
        .map_err(|err| err.to_string())?;
    let rpc = HttpRpcClient::new(RpcConfig::new(
        config.rpc_url.clone(),
        config.rpc_user.clone(),
        config.rpc_password.clone(),
        config.rpc_timeout_secs,
    ));
    let mut syncer = Syncer::new(graph, rpc, config.sync_options());
    log_info!(
        "syncing {} from {}{}",
        config.network,
        config.rpc_url,
        config
            .blocks_dir
            .as_ref()
            .map(|dir| format!(" and {}", dir.display()))
            .unwrap_or_default()
    );

    let stop = syncer.stop_flag();
    let shutdown = Arc::new(Notify::new());
    {
        let stop = Arc::clone(&stop);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_info!("shutdown requested; finishing the current block");
                stop.store(true, Ordering::Relaxed);
                shutdown.notify_one();
            }
        });
    }

    let limit = config.sync_limit;
    loop {
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = syncer.sync_cycle(limit);
            (syncer, result)
        })
        .await
        .map_err(|err| format!("sync task failed: {err}"))?;
        syncer = returned;

        match result {
            Ok(report) if !config.daemon => {
                print_json(&SyncReportView::from(&report))?;
            }
            Ok(_) => {}
            Err(err @ (SyncError::Rpc(_) | SyncError::Lock(LockError::Busy { .. })))
                if config.daemon =>
            {
                log_warn!("sync cycle skipped: {err}");
            }
            Err(err) => return Err(err.to_string()),
        }

        if !config.daemon || stop.load(Ordering::Relaxed) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.sync_interval_secs)) => {}
            _ = shutdown.notified() => {}
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }
    log_info!("sync stopped");
    Ok(())
}

fn run_rederive(config: &Config, store: Arc<Store>) -> Result<(), String> {
    let owner = format!("exploder-rederive-{}", std::process::id());
    acquire_sync_lock(&store, &owner, config.lock_timeout_secs, sync::unix_now())
        .map_err(|err| err.to_string())?;
    let result = ChainGraph::open(Arc::clone(&store), config.params(), true)
        .and_then(|mut graph| rederive_unspent(&mut graph, DEFAULT_REDERIVE_BATCH))
        .map_err(|err| err.to_string());
    if let Err(err) = release_sync_lock(&store, &owner) {
        log_warn!("failed to release sync lock: {err}");
    }
    let report = result?;
    print_json(&serde_json::json!({
        "outputs": report.outputs,
        "spent": report.spent,
    }))
}

fn run_query(config: &Config, store: Arc<Store>, query: &QueryCommand) -> Result<(), String> {
    let queries = ChainQuery::new(store, config.params());
    let (limit, offset) = (config.query_limit, config.query_offset);
    match query {
        QueryCommand::Block(raw) => {
            let hash = hash256_from_hex(raw).map_err(|err| format!("invalid block hash: {err}"))?;
            let block = queries
                .block_by_hash(&hash)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("block {raw} not found"))?;
            let confirmations = queries
                .block_confirmations(&block)
                .map_err(|err| err.to_string())?;
            print_json(&BlockView::new(&block, confirmations))
        }
        QueryCommand::Height(height) => {
            let block = queries
                .block_by_height(*height)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("no main chain block at height {height}"))?;
            let confirmations = queries
                .block_confirmations(&block)
                .map_err(|err| err.to_string())?;
            print_json(&BlockView::new(&block, confirmations))
        }
        QueryCommand::Tx(raw) => {
            let txid = hash256_from_hex(raw).map_err(|err| format!("invalid txid: {err}"))?;
            let view = queries
                .transaction(&txid)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("transaction {raw} not found"))?;
            print_json(&TransactionJson::from(&view))
        }
        QueryCommand::Address(raw) => {
            let addresses = split_addresses(raw);
            if let [address] = addresses.as_slice() {
                let balance = queries.address_balance(address).map_err(|err| err.to_string())?;
                let volume = queries.address_volume(address).map_err(|err| err.to_string())?;
                let tx_count = queries.address_tx_count(address).map_err(|err| err.to_string())?;
                let transactions = queries
                    .address_transactions(address, limit, offset)
                    .map_err(|err| err.to_string())?;
                print_json(&AddressView::new(address, balance, volume, tx_count, &transactions))
            } else {
                let balance = queries
                    .addresses_balance(&addresses)
                    .map_err(|err| err.to_string())?;
                let volume = queries
                    .addresses_volume(&addresses)
                    .map_err(|err| err.to_string())?;
                let tx_count = queries
                    .addresses_tx_count(&addresses)
                    .map_err(|err| err.to_string())?;
                print_json(&AddressSetView::new(&addresses, balance, volume, tx_count))
            }
        }
        QueryCommand::Unspent(raw) => {
            let addresses = split_addresses(raw);
            let outputs = match addresses.as_slice() {
                [address] => queries.address_unspent(address),
                _ => queries.addresses_unspent(&addresses),
            }
            .map_err(|err| err.to_string())?;
            print_json(&outputs.iter().map(OutputView::from).collect::<Vec<_>>())
        }
        QueryCommand::Stats => {
            let stats = queries.chain_stats().map_err(|err| err.to_string())?;
            print_json(&StatsView::from(&stats))
        }
        QueryCommand::LatestBlocks => {
            let blocks = queries
                .latest_blocks(limit, offset)
                .map_err(|err| err.to_string())?;
            let mut views = Vec::with_capacity(blocks.len());
            for block in &blocks {
                let confirmations = queries
                    .block_confirmations(block)
                    .map_err(|err| err.to_string())?;
                views.push(BlockView::new(block, confirmations));
            }
            print_json(&views)
        }
        QueryCommand::LatestTxs => {
            let txs = queries
                .latest_transactions(limit)
                .map_err(|err| err.to_string())?;
            print_json(&txs.iter().map(TransactionJson::from).collect::<Vec<_>>())
        }
        QueryCommand::SyncHistory => {
            let entries = queries
                .latest_sync_history(limit)
                .map_err(|err| err.to_string())?;
            print_json(&entries.iter().map(SyncHistoryView::from).collect::<Vec<_>>())
        }
        QueryCommand::Hashrate => {
            let samples = queries
                .latest_hashrates(limit)
                .map_err(|err| err.to_string())?;
            print_json(&samples.iter().map(HashrateView::from).collect::<Vec<_>>())
        }
    }
}

fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_flag_number<T: FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {flag} '{value}'\n{}", usage()))
}

fn conf_last<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn conf_number<T: FromStr>(
    conf: &HashMap<String, Vec<String>>,
    key: &str,
    conf_file: &Path,
) -> Result<Option<T>, String> {
    match conf_last(conf, key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid {key} '{raw}' in {}", conf_file.display())),
        None => Ok(None),
    }
}

fn conf_bool(
    conf: &HashMap<String, Vec<String>>,
    key: &str,
    conf_file: &Path,
) -> Result<Option<bool>, String> {
    match conf_last(conf, key) {
        Some(raw) => parse_conf_bool(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {key} value '{raw}' in {}", conf_file.display())),
        None => Ok(None),
    }
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command: Option<Command> = None;
    let mut backend: Option<Backend> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network: Option<Network> = None;
    let mut blocks_dir: Option<PathBuf> = None;
    let mut rpc_connect: Option<String> = None;
    let mut rpc_port: Option<u16> = None;
    let mut rpc_user: Option<String> = None;
    let mut rpc_password: Option<String> = None;
    let mut rpc_timeout_secs: Option<u64> = None;
    let mut rpc_sync_percent: Option<f64> = None;
    let mut stream_min_height: Option<u32> = None;
    let mut flush_every: Option<usize> = None;
    let mut track_unspent: Option<bool> = None;
    let mut max_rewind_depth: Option<u32> = None;
    let mut lock_timeout_secs: Option<u64> = None;
    let mut daemon: Option<bool> = None;
    let mut sync_interval_secs: Option<u64> = None;
    let mut db_cache_mb: Option<u64> = None;
    let mut log_level: Option<logging::Level> = None;
    let mut log_format: Option<logging::Format> = None;
    let mut log_timestamps: Option<bool> = None;
    let mut log_file: Option<PathBuf> = None;
    let mut limit: Option<usize> = None;
    let mut offset: usize = 0;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.to_string()) {
        match first.as_str() {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            "sync" => {
                command = Some(Command::Sync);
                let _ = args.next();
            }
            "rederive-unspent" => {
                command = Some(Command::RederiveUnspent);
                let _ = args.next();
            }
            "query" => {
                let _ = args.next();
                let kind = args
                    .next()
                    .ok_or_else(|| format!("missing query kind\n{}", usage()))?;
                let arg = if QueryCommand::takes_argument(&kind) {
                    args.next_if(|value| !value.starts_with("--"))
                } else {
                    None
                };
                command = Some(Command::Query(QueryCommand::parse(&kind, arg)?));
            }
            _ => {}
        }
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Some(
                    Backend::parse(&value)
                        .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?,
                );
            }
            "--data-dir" => data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?)),
            "--conf" => conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?)),
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Some(
                    Network::parse(&value)
                        .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?,
                );
            }
            "--blocks-dir" => {
                blocks_dir = Some(PathBuf::from(next_value(&mut args, "--blocks-dir")?))
            }
            "--rpc-connect" => rpc_connect = Some(next_value(&mut args, "--rpc-connect")?),
            "--rpc-port" => {
                let value = next_value(&mut args, "--rpc-port")?;
                rpc_port = Some(parse_flag_number("--rpc-port", &value)?);
            }
            "--rpc-user" => rpc_user = Some(next_value(&mut args, "--rpc-user")?),
            "--rpc-password" => rpc_password = Some(next_value(&mut args, "--rpc-password")?),
            "--rpc-timeout" => {
                let value = next_value(&mut args, "--rpc-timeout")?;
                rpc_timeout_secs = Some(parse_flag_number("--rpc-timeout", &value)?);
            }
            "--rpc-sync-percent" => {
                let value = next_value(&mut args, "--rpc-sync-percent")?;
                rpc_sync_percent = Some(parse_flag_number("--rpc-sync-percent", &value)?);
            }
            "--stream-min-height" => {
                let value = next_value(&mut args, "--stream-min-height")?;
                stream_min_height = Some(parse_flag_number("--stream-min-height", &value)?);
            }
            "--flush-every" => {
                let value = next_value(&mut args, "--flush-every")?;
                flush_every = Some(parse_flag_number("--flush-every", &value)?);
            }
            "--track-unspent" => track_unspent = Some(true),
            "--no-track-unspent" => track_unspent = Some(false),
            "--max-rewind-depth" => {
                let value = next_value(&mut args, "--max-rewind-depth")?;
                max_rewind_depth = Some(parse_flag_number("--max-rewind-depth", &value)?);
            }
            "--lock-timeout" => {
                let value = next_value(&mut args, "--lock-timeout")?;
                lock_timeout_secs = Some(parse_flag_number("--lock-timeout", &value)?);
            }
            "--daemon" => daemon = Some(true),
            "--sync-interval" => {
                let value = next_value(&mut args, "--sync-interval")?;
                sync_interval_secs = Some(parse_flag_number("--sync-interval", &value)?);
            }
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = Some(parse_flag_number("--db-cache-mb", &value)?);
            }
            "--limit" => {
                let value = next_value(&mut args, "--limit")?;
                limit = Some(parse_flag_number("--limit", &value)?);
            }
            "--offset" => {
                let value = next_value(&mut args, "--offset")?;
                offset = parse_flag_number("--offset", &value)?;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = Some(
                    logging::Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = Some(
                    logging::Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" => log_timestamps = Some(true),
            "--no-log-timestamps" => log_timestamps = Some(false),
            "--log-file" => log_file = Some(PathBuf::from(next_value(&mut args, "--log-file")?)),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let mut data_dir_resolved = data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path
        .clone()
        .unwrap_or_else(|| data_dir_resolved.join(CONF_FILE_NAME));
    let conf = match load_conf(&conf_file)? {
        Some(conf) => conf,
        None if conf_path.is_some() => {
            return Err(format!("config file {} not found", conf_file.display()));
        }
        None => HashMap::new(),
    };

    if data_dir.is_none() {
        if let Some(raw) = conf_last(&conf, "datadir") {
            data_dir_resolved = PathBuf::from(raw);
        }
    }
    if backend.is_none() {
        if let Some(raw) = conf_last(&conf, "backend") {
            backend = Some(Backend::parse(raw).ok_or_else(|| {
                format!("invalid backend '{raw}' in {}", conf_file.display())
            })?);
        }
    }
    if network.is_none() {
        if let Some(raw) = conf_last(&conf, "network") {
            network = Some(Network::parse(raw).ok_or_else(|| {
                format!("invalid network '{raw}' in {}", conf_file.display())
            })?);
        }
    }
    let network = network.unwrap_or(Network::Mainnet);
    let blocks_dir = blocks_dir.or_else(|| conf_last(&conf, "blocksdir").map(PathBuf::from));
    let rpc_connect = rpc_connect
        .or_else(|| conf_last(&conf, "rpcconnect").map(str::to_string))
        .unwrap_or_else(|| DEFAULT_RPC_HOST.to_string());
    let rpc_port = match rpc_port {
        Some(port) => port,
        None => conf_number(&conf, "rpcport", &conf_file)?
            .unwrap_or_else(|| chain_params(network).default_rpc_port),
    };
    let rpc_user = rpc_user.or_else(|| conf_last(&conf, "rpcuser").map(str::to_string));
    let rpc_password =
        rpc_password.or_else(|| conf_last(&conf, "rpcpassword").map(str::to_string));
    let rpc_timeout_secs = match rpc_timeout_secs {
        Some(value) => value,
        None => conf_number(&conf, "rpctimeout", &conf_file)?.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
    };
    let rpc_sync_percent = match rpc_sync_percent {
        Some(value) => value,
        None => conf_number(&conf, "rpcsyncpercent", &conf_file)?
            .unwrap_or(DEFAULT_RPC_SYNC_PERCENT),
    };
    if !(0.0..=100.0).contains(&rpc_sync_percent) {
        return Err(format!(
            "rpc sync percent must be within 0..=100, got {rpc_sync_percent}"
        ));
    }
    let stream_min_height = match stream_min_height {
        Some(value) => value,
        None => conf_number(&conf, "streamminheight", &conf_file)?.unwrap_or(0),
    };
    let flush_every = match flush_every {
        Some(value) => value,
        None => conf_number(&conf, "flushevery", &conf_file)?.unwrap_or(DEFAULT_FLUSH_EVERY),
    };
    if flush_every == 0 {
        return Err("flush interval must be at least 1 block".to_string());
    }
    let track_unspent = match track_unspent {
        Some(value) => value,
        None => conf_bool(&conf, "trackunspent", &conf_file)?.unwrap_or(true),
    };
    let max_rewind_depth = match max_rewind_depth {
        Some(value) => value,
        None => conf_number(&conf, "maxrewinddepth", &conf_file)?
            .unwrap_or(DEFAULT_MAX_REWIND_DEPTH),
    };
    let lock_timeout_secs = match lock_timeout_secs {
        Some(value) => value,
        None => conf_number(&conf, "locktimeout", &conf_file)?
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
    };
    let daemon = match daemon {
        Some(value) => value,
        None => conf_bool(&conf, "daemon", &conf_file)?.unwrap_or(false),
    };
    let sync_interval_secs = match sync_interval_secs {
        Some(value) => value,
        None => conf_number(&conf, "syncinterval", &conf_file)?
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
    };
    let db_cache_mb = match db_cache_mb {
        Some(value) => Some(value),
        None => conf_number::<u64>(&conf, "dbcache", &conf_file)?,
    };
    if log_level.is_none() {
        if let Some(raw) = conf_last(&conf, "loglevel") {
            log_level = Some(logging::Level::parse(raw).ok_or_else(|| {
                format!("invalid loglevel '{raw}' in {}", conf_file.display())
            })?);
        }
    }
    if log_format.is_none() {
        if let Some(raw) = conf_last(&conf, "logformat") {
            log_format = Some(logging::Format::parse(raw).ok_or_else(|| {
                format!("invalid logformat '{raw}' in {}", conf_file.display())
            })?);
        }
    }
    let log_timestamps = match log_timestamps {
        Some(value) => value,
        None => conf_bool(&conf, "logtimestamps", &conf_file)?.unwrap_or(true),
    };
    let log_file = log_file.or_else(|| conf_last(&conf, "logfile").map(PathBuf::from));

    let command = command.unwrap_or(Command::Sync);
    let query_limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT);
    let sync_limit = match command {
        Command::Sync => limit.unwrap_or(0),
        _ => 0,
    };

    Ok(CliAction::Run(Box::new(Config {
        command,
        backend: backend.unwrap_or(Backend::Fjall),
        data_dir: data_dir_resolved,
        conf_path: conf_file,
        network,
        blocks_dir,
        rpc_url: rpc_url(&rpc_connect, rpc_port),
        rpc_user,
        rpc_password,
        rpc_timeout_secs,
        rpc_sync_percent,
        stream_min_height,
        flush_every,
        track_unspent,
        max_rewind_depth,
        lock_timeout_secs,
        daemon,
        sync_interval_secs,
        sync_limit,
        db_cache_bytes: db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        query_limit,
        query_offset: offset,
        log: logging::LogConfig {
            level: log_level.unwrap_or(logging::Level::Info),
            format: log_format.unwrap_or(logging::Format::Text),
            timestamps: log_timestamps,
            file: log_file,
        },
    })))
}

/// `host` may already be a URL; a bare host gets `http://` and `port`.
fn rpc_url(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{host}:{port}")
    }
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn usage() -> String {
    [
        "Usage:",
        "  exploder [sync] [options]",
        "  exploder rederive-unspent [options]",
        "  exploder query <kind> [arg] [options]",
        "",
        "Commands:",
        "  help              Print this help and exit",
        "  version           Print version and exit",
        "  sync              Index new blocks from block files and RPC (default)",
        "  rederive-unspent  Rebuild output spent flags from the main chain",
        "  query block <hash> | height <n> | tx <txid> | address <addr[,addr..]>",
        "        unspent <addr[,addr..]> | stats | latest-blocks | latest-txs",
        "        sync-history | hashrate",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend (fjall|memory) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/exploder.conf)",
        "  --network  Chain parameters (mainnet|testnet|regtest) (default: mainnet)",
        "  --blocks-dir  Directory with blk*.dat files; enables block file sync",
        "  --rpc-connect  Node RPC host or URL (default: 127.0.0.1)",
        "  --rpc-port  Node RPC port (default: network RPC port)",
        "  --rpc-user  Node RPC user",
        "  --rpc-password  Node RPC password",
        "  --rpc-timeout  RPC request timeout in seconds (default: 30)",
        "  --rpc-sync-percent  Switch from block files to RPC at this progress (default: 97)",
        "  --stream-min-height  Read block files at least up to this height (default: 0, off)",
        "  --flush-every  Commit to the store every N blocks (default: 1000)",
        "  --track-unspent  Maintain output spent flags while indexing (default)",
        "  --no-track-unspent  Bulk mode; run rederive-unspent afterwards",
        "  --max-rewind-depth  Deepest node reorg followed over RPC (default: 1000)",
        "  --lock-timeout  Seconds before a stale sync lock is taken over (default: 600)",
        "  --daemon  Keep syncing every --sync-interval seconds until Ctrl-C",
        "  --sync-interval  Seconds between daemon cycles (default: 60)",
        "  --db-cache-mb  Fjall block cache size in MiB",
        "  --limit  Blocks per sync cycle (default: unlimited) or query result count (default: 10)",
        "  --offset  Query results to skip (default: 0)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --log-file  Append logs to this file as well",
        "",
        "Config file keys mirror the long options without dashes, e.g. rpcuser=, blocksdir=,",
        "trackunspent=0, loglevel=debug.",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(raw: &[&str]) -> Config {
        match parse_args_from(args(raw)).expect("parse") {
            CliAction::Run(config) => *config,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn defaults_without_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8");
        let config = run_config(&["--data-dir", data_dir]);
        assert_eq!(config.command, Command::Sync);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.rpc_url, "http://127.0.0.1:8332");
        assert_eq!(config.rpc_sync_percent, DEFAULT_RPC_SYNC_PERCENT);
        assert_eq!(config.flush_every, DEFAULT_FLUSH_EVERY);
        assert!(config.track_unspent);
        assert!(!config.daemon);
        assert_eq!(config.sync_limit, 0);
        assert_eq!(config.conf_path, dir.path().join(CONF_FILE_NAME));
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["sync", "-V"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn conf_file_fills_unset_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# indexer\nnetwork=regtest\nrpcuser = alice ; inline\nrpcpassword=secret\n\
             trackunspent=0\ndaemon\nflushevery=250\nrpcsyncpercent=90.5\nblocksdir=/srv/blocks\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_str().expect("utf8");
        let config = run_config(&["--data-dir", data_dir, "--flush-every", "10"]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.rpc_url, "http://127.0.0.1:18443");
        assert_eq!(config.rpc_user.as_deref(), Some("alice"));
        assert_eq!(config.rpc_password.as_deref(), Some("secret"));
        assert!(!config.track_unspent);
        assert!(config.daemon);
        // Flags win over the file.
        assert_eq!(config.flush_every, 10);
        assert_eq!(config.rpc_sync_percent, 90.5);
        assert_eq!(config.blocks_dir, Some(PathBuf::from("/srv/blocks")));
    }

    #[test]
    fn invalid_conf_values_name_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("custom.conf");
        fs::write(&conf, "flushevery=lots\n").expect("write conf");
        let err = parse_args_from(args(&["--conf", conf.to_str().expect("utf8")]))
            .expect_err("invalid");
        assert!(err.contains("flushevery"));
        assert!(err.contains("custom.conf"));

        let missing = dir.path().join("missing.conf");
        assert!(parse_args_from(args(&["--conf", missing.to_str().expect("utf8")])).is_err());
    }

    #[test]
    fn query_subcommands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8");
        let config = run_config(&["query", "height", "42", "--data-dir", data_dir]);
        assert_eq!(config.command, Command::Query(QueryCommand::Height(42)));

        let config = run_config(&[
            "query",
            "latest-blocks",
            "--limit",
            "5",
            "--offset",
            "10",
            "--data-dir",
            data_dir,
        ]);
        assert_eq!(config.command, Command::Query(QueryCommand::LatestBlocks));
        assert_eq!(config.query_limit, 5);
        assert_eq!(config.query_offset, 10);
        assert_eq!(config.sync_limit, 0);

        assert!(parse_args_from(args(&["query", "block", "--data-dir", data_dir])).is_err());
        assert!(parse_args_from(args(&["query", "mempool"])).is_err());
    }

    #[test]
    fn rpc_connect_accepts_urls() {
        assert_eq!(rpc_url("node.local", 8332), "http://node.local:8332");
        assert_eq!(
            rpc_url("https://rpc.example:9000/", 8332),
            "https://rpc.example:9000"
        );
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let err = parse_args_from(args(&["--frobnicate"])).expect_err("unknown");
        assert!(err.starts_with("unknown argument '--frobnicate'"));
        assert!(parse_args_from(args(&["--backend", "rocksdb"])).is_err());
        assert!(parse_args_from(args(&["--rpc-sync-percent", "120"])).is_err());
    }

    #[test]
    fn split_address_sets() {
        assert_eq!(
            split_addresses("a, b,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn second_lock_on_the_data_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = lock_data_dir(dir.path()).expect("first lock");
        let err = lock_data_dir(dir.path()).err().expect("second lock fails");
        assert!(err.contains("already locked"));
        assert!(err.contains("pid="));
        drop(first);
        lock_data_dir(dir.path()).expect("lock after release");
    }
}
