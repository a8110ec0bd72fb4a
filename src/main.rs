use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

mod codec;
mod db;
mod dbdir;
mod hexutil;
mod import;
mod jsonio;
mod logging;
mod records;
mod scan;
mod scan_stream;
mod schema;
mod settings;
mod setops;

use settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "hashdb")]
#[command(version, about = "Content-addressed block-hash database for forensic block matching")]
struct Cli {
    /// Increase logging verbosity (use together with RUST_LOG for fine control).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Create a new database. The path must not exist yet.
    Create {
        db: PathBuf,

        /// Required alignment of file offsets, in bytes
        #[arg(long, default_value_t = 512)]
        byte_alignment: u32,

        /// Size of the hashed data blocks, in bytes (informational)
        #[arg(long, default_value_t = 512)]
        block_size: u32,

        /// Cap on retained (source, offset) pairs per block hash
        #[arg(long, default_value_t = 100_000)]
        max_source_offset_pairs: u32,

        /// Leading bits of a block hash used as the hash store bucket key
        #[arg(long, default_value_t = 28)]
        hash_prefix_bits: u32,

        /// Trailing bytes of a block hash kept inside each bucket
        #[arg(long, default_value_t = 3)]
        hash_suffix_bytes: u32,
    },

    /// Import JSON records from a file (lines starting with # are skipped)
    Import { db: PathBuf, json_file: PathBuf },

    /// Import a tab file of <file hash>\t<block hash>\t<index> lines
    ImportTab {
        db: PathBuf,
        tab_file: PathBuf,

        /// Repository name for the imported sources (defaults to the tab file name)
        #[arg(short, long)]
        repository: Option<String>,
    },

    /// Export all records to a JSON file
    Export { db: PathBuf, json_file: PathBuf },

    /// Look up one block hash and print its expansion
    ScanHash { db: PathBuf, hex_hash: String },

    /// Scan a list file of <feature>\t<hex hash> lines
    ScanList { db: PathBuf, list_file: PathBuf },

    /// Scan fixed-width binary records from stdin, writing results to stdout
    ScanStream {
        db: PathBuf,

        /// Width of each block hash, in bytes
        hash_size: usize,

        /// Bytes of caller metadata following each hash, echoed verbatim
        metadata_size: usize,

        /// Query per record: expanded, count, or approximate
        #[arg(short, long, default_value = "expanded")]
        mode: String,

        /// Result framing: text or binary
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print store sizes
    Size { db: PathBuf },

    /// Copy database A into the output
    Add { a: PathBuf, output: PathBuf },

    /// Copy databases A and B into the output, sub_counts summed
    AddMultiple { a: PathBuf, b: PathBuf, output: PathBuf },

    /// Copy blocks of A attributed to the repository
    AddRepository {
        a: PathBuf,
        output: PathBuf,
        repository: String,
    },

    /// Copy blocks of A whose count falls in lo:hi
    AddRange {
        a: PathBuf,
        output: PathBuf,
        range: String,
    },

    /// Copy blocks present in A and B that share a source
    Intersect { a: PathBuf, b: PathBuf, output: PathBuf },

    /// Copy blocks whose hash is present in both A and B
    IntersectHash { a: PathBuf, b: PathBuf, output: PathBuf },

    /// Copy A minus the sources B lists for the same blocks
    Subtract { a: PathBuf, b: PathBuf, output: PathBuf },

    /// Copy blocks of A whose hash is absent from B
    SubtractHash { a: PathBuf, b: PathBuf, output: PathBuf },

    /// Copy blocks of A not attributed to the repository
    SubtractRepository {
        a: PathBuf,
        output: PathBuf,
        repository: String,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;
    let command = std::env::args().collect::<Vec<_>>().join(" ");

    match cli.cmd {
        Command::Create {
            db,
            byte_alignment,
            block_size,
            max_source_offset_pairs,
            hash_prefix_bits,
            hash_suffix_bytes,
        } => {
            let settings = Settings {
                byte_alignment,
                block_size,
                max_source_offset_pairs,
                hash_prefix_bits,
                hash_suffix_bytes,
                ..Settings::default()
            };
            db::create(&db, &settings, &command)?;
            tracing::info!(db = %db.display(), "database created");
            Ok(())
        }

        Command::Import { db, json_file } => jsonio::import(&db, &json_file, &command),

        Command::ImportTab {
            db,
            tab_file,
            repository,
        } => jsonio::import_tab(&db, &tab_file, repository.as_deref(), &command),

        Command::Export { db, json_file } => jsonio::export(&db, &json_file, &command),

        Command::ScanHash { db, hex_hash } => {
            let block_hash = hexutil::hex_to_bin(&hex_hash);
            if block_hash.is_empty() {
                return Err(anyhow!("invalid block hash hex: '{}'", hex_hash));
            }
            let manager = scan::ScanManager::open(&db)?;
            let expanded = manager.find_expanded_hash_json(&block_hash)?;
            if expanded.is_empty() {
                println!("Hash not found for '{}'", hex_hash);
            } else {
                println!("{}", expanded);
            }
            Ok(())
        }

        Command::ScanStream {
            db,
            hash_size,
            metadata_size,
            mode,
            format,
        } => {
            let mode = match mode.as_str() {
                "expanded" => scan_stream::ScanMode::ExpandedHash,
                "count" => scan_stream::ScanMode::HashCount,
                "approximate" => scan_stream::ScanMode::ApproximateHashCount,
                other => return Err(anyhow!("unknown scan mode '{}'", other)),
            };
            let format = match format.as_str() {
                "text" => scan_stream::OutputFormat::TextOutput,
                "binary" => scan_stream::OutputFormat::BinaryOutput,
                other => return Err(anyhow!("unknown output format '{}'", other)),
            };
            let manager = scan::ScanManager::open(&db)?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            let mut input = stdin.lock();
            let mut output = stdout.lock();
            manager.scan_stream(&mut input, &mut output, hash_size, metadata_size, mode, format)
        }

        Command::ScanList { db, list_file } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            jsonio::scan_list(&db, &list_file, &mut out, &command)?;
            out.flush()?;
            Ok(())
        }

        Command::Size { db } => {
            let manager = scan::ScanManager::open(&db)?;
            println!("{}", manager.size()?);
            Ok(())
        }

        Command::Add { a, output } => setops::add(&a, &output, &command),

        Command::AddMultiple { a, b, output } => {
            setops::add_multiple(&a, &b, &output, &command)
        }

        Command::AddRepository {
            a,
            output,
            repository,
        } => setops::add_repository(&a, &output, &repository, &command),

        Command::AddRange { a, output, range } => {
            setops::add_range(&a, &output, &range, &command)
        }

        Command::Intersect { a, b, output } => setops::intersect(&a, &b, &output, &command),

        Command::IntersectHash { a, b, output } => {
            setops::intersect_hash(&a, &b, &output, &command)
        }

        Command::Subtract { a, b, output } => setops::subtract(&a, &b, &output, &command),

        Command::SubtractHash { a, b, output } => {
            setops::subtract_hash(&a, &b, &output, &command)
        }

        Command::SubtractRepository {
            a,
            output,
            repository,
        } => setops::subtract_repository(&a, &output, &repository, &command),
    }
}
