//! SlotStore operator tool
//!
//! Attaches to a store directory like any other process would and runs one
//! command against it.
//!
//! ## Usage
//!
//! ```bash
//! # Show the persisted header without joining the store
//! slotstore --dir /var/lib/quotes --name equities inspect
//!
//! # Insert and read back a record keyed by code and ISIN
//! slotstore --dir /var/lib/quotes --name equities --secondary-len 16 \
//!     put 7203.T 'last=2841.5' --skey JP3633400001
//! slotstore --dir /var/lib/quotes --name equities --secondary-len 16 \
//!     get JP3633400001 --secondary
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slotstore_core::{Config, Field, ReopenPolicy, SlotStore};

/// SlotStore operator tool
#[derive(Parser, Debug)]
#[command(name = "slotstore")]
#[command(about = "Inspect, verify and edit a process-shared SlotStore")]
#[command(version)]
#[command(args_override_self = true)]
struct Args {
    /// Directory containing the store's data/ subdirectory
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Base name of the store files
    #[arg(long, default_value = "store")]
    name: String,

    /// Number of record slots (used when creating)
    #[arg(long, default_value_t = 10_000)]
    max_records: u32,

    /// Value capacity of each slot in bytes (used when creating)
    #[arg(long, default_value_t = 1024)]
    record_size: u32,

    /// Hash buckets per index (used when creating)
    #[arg(long, default_value_t = 16_384)]
    buckets: u32,

    /// Primary key field width; keys must be strictly shorter
    #[arg(long, default_value_t = 64)]
    primary_len: u32,

    /// Secondary key field width; 0 disables the secondary index
    #[arg(long, default_value_t = 0)]
    secondary_len: u32,

    /// Skip the cross-process file lock
    #[arg(long)]
    no_lock: bool,

    /// Zero value bytes when a record is deleted
    #[arg(long)]
    scrub: bool,

    /// Adopt the geometry stored in an existing file instead of rejecting a mismatch
    #[arg(long)]
    trust_file: bool,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted header of the records file
    Inspect,
    /// Print record and index statistics
    Stats,
    /// Check the free list and both indexes
    Verify,
    /// Insert a record
    Put {
        key: String,
        value: String,
        /// Secondary key, required when the secondary index is enabled
        #[arg(long)]
        skey: Option<String>,
    },
    /// Print the value bound to a key
    Get {
        key: String,
        /// Look the key up in the secondary index
        #[arg(long)]
        secondary: bool,
    },
    /// Print the raw contents of slot SEQ (1-based)
    GetSeq { seq: u32 },
    /// Delete the record bound to a primary key
    Del { key: String },
    /// Delete every record
    Clear,
    /// Print every live record as seq, key and value
    Dump,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            max_record_count: self.max_records,
            max_record_size: self.record_size,
            hash_bucket_count: self.buckets,
            primary_field_len: self.primary_len,
            secondary_field_len: self.secondary_len,
            lock_enabled: !self.no_lock,
            scrub_on_free: self.scrub,
            reopen_policy: if self.trust_file { ReopenPolicy::TrustFile } else { ReopenPolicy::Verify },
            log_level: self.log_level.clone(),
            ..Config::new(&self.dir, &self.name)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = args.config();

    if let Command::Inspect = args.command {
        print!("{}", SlotStore::inspect(&config.records_path())?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut store = SlotStore::new(config);
    store.initialize()?;
    tracing::debug!(?store, command = ?args.command, "attached");

    match &args.command {
        Command::Inspect => {
            print!("{}", SlotStore::inspect(&store.records_path())?);
        }
        Command::Stats => {
            print!("{}", store.get_statistics()?);
        }
        Command::Verify => {
            store.verify_arena()?;
            if !store.validate_integrity() {
                eprintln!("index integrity check failed");
                return Ok(ExitCode::FAILURE);
            }
            println!("ok: {} live records", store.len()?);
        }
        Command::Put { key, value, skey } => {
            store.put(key.as_bytes(), skey.as_deref().map(str::as_bytes), value.as_bytes())?;
            store.sync()?;
        }
        Command::Get { key, secondary } => {
            let field = Field::try_from(usize::from(*secondary))?;
            match store.get_copy(field, key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => {
                    eprintln!("{} key not found: {}", field, key);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::GetSeq { seq } => {
            let record = store.get_by_seq(*seq)?;
            let state = if record.is_occupied() { "occupied" } else { "free" };
            println!("{}\t{}\t{}", record.seq(), state, String::from_utf8_lossy(record.bytes()));
        }
        Command::Del { key } => {
            store.del(key.as_bytes())?;
            store.sync()?;
        }
        Command::Clear => {
            store.clear()?;
            store.sync()?;
        }
        Command::Dump => {
            store.for_each_record(|seq, key, value| {
                println!("{}\t{}\t{}", seq, String::from_utf8_lossy(key), String::from_utf8_lossy(value));
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
