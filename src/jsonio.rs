use crate::hexutil;
use crate::import::ImportManager;
use crate::scan::ScanManager;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The two comment lines heading every exported file and scan listing.
pub fn write_header(out: &mut dyn Write, command: &str) -> Result<()> {
    writeln!(out, "# command: {}", command)?;
    writeln!(out, "# hashdb-Version: {}", VERSION)?;
    Ok(())
}

/// Block records in hash order, then source records in source order.
pub fn export_lines(scan: &ScanManager, out: &mut dyn Write) -> Result<u64> {
    let mut written = 0u64;

    let mut block_hash = scan.first_hash()?;
    while !block_hash.is_empty() {
        writeln!(out, "{}", scan.export_hash_json(&block_hash)?)?;
        written += 1;
        block_hash = scan.next_hash(&block_hash)?;
    }

    let mut file_hash = scan.first_source()?;
    while !file_hash.is_empty() {
        writeln!(out, "{}", scan.export_source_json(&file_hash)?)?;
        written += 1;
        file_hash = scan.next_source(&file_hash)?;
    }
    Ok(written)
}

/// Export a database to a JSON lines file with the two-line header.
pub fn export(db_dir: &Path, json_path: &Path, command: &str) -> Result<()> {
    let scan = ScanManager::open(db_dir)?;
    let file = File::create(json_path)
        .with_context(|| format!("Failed to create {}", json_path.display()))?;
    let mut out = BufWriter::new(file);
    write_header(&mut out, command)?;
    let written = export_lines(&scan, &mut out)?;
    out.flush()?;
    tracing::info!(
        records = written,
        hashes = scan.size_hashes()?,
        sources = scan.size_sources()?,
        "export finished"
    );
    Ok(())
}

/// Import a JSON lines file. Comment lines are skipped; a bad line is
/// reported and the batch continues.
pub fn import(db_dir: &Path, json_path: &Path, command: &str) -> Result<()> {
    let manager = ImportManager::open(db_dir, command)?;
    let file = File::open(json_path)
        .with_context(|| format!("Failed to open {}", json_path.display()))?;

    let mut imported = 0u64;
    let mut rejected = 0u64;
    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", json_path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match manager.import_json(trimmed) {
            Ok(()) => imported += 1,
            Err(e) => {
                rejected += 1;
                tracing::warn!(line = line_number + 1, error = %e, "skipping bad record");
            }
        }
    }
    tracing::info!(imported, rejected, sizes = %manager.size()?, "import finished");
    Ok(())
}

/// Import a tab file of `<file hash>\t<block hash>\t<index>` lines, the
/// hand-off format of block hashing tools. Block `index` counts from 1;
/// the recorded offset is `(index - 1) * block_size`. Every source is
/// named `(repository, tab file name)`, with the repository defaulting to
/// the tab file name itself.
pub fn import_tab(
    db_dir: &Path,
    tab_path: &Path,
    repository: Option<&str>,
    command: &str,
) -> Result<()> {
    let manager = ImportManager::open(db_dir, command)?;
    let file = File::open(tab_path)
        .with_context(|| format!("Failed to open {}", tab_path.display()))?;
    let file_name = tab_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let repository = repository.unwrap_or(&file_name);
    let block_size = u64::from(manager.settings().block_size);

    let mut imported = 0u64;
    let mut rejected = 0u64;
    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", tab_path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match import_tab_line(&manager, trimmed, repository, &file_name, block_size) {
            Ok(()) => imported += 1,
            Err(e) => {
                rejected += 1;
                tracing::warn!(line = line_number + 1, error = %e, "skipping bad tab line");
            }
        }
    }
    tracing::info!(imported, rejected, "tab import finished");
    Ok(())
}

fn import_tab_line(
    manager: &ImportManager,
    line: &str,
    repository: &str,
    file_name: &str,
    block_size: u64,
) -> Result<()> {
    let mut fields = line.split('\t');
    let (Some(file_hex), Some(block_hex), Some(index)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(anyhow::anyhow!("expected three tab-separated fields"));
    };
    let file_hash = hexutil::hex_to_bin(file_hex);
    let block_hash = hexutil::hex_to_bin(block_hex);
    if file_hash.is_empty() || block_hash.is_empty() {
        return Err(anyhow::anyhow!("invalid hash hex"));
    }
    let index: u64 = index
        .trim()
        .parse()
        .with_context(|| format!("invalid block index '{}'", index))?;
    if index == 0 {
        return Err(anyhow::anyhow!("block index counts from 1"));
    }
    manager.insert_source_name(&file_hash, repository, file_name)?;
    manager.insert_hash(&block_hash, &file_hash, (index - 1) * block_size, 0, "")
}

/// Scan a hash list file. Comment lines are echoed; `<prefix>\t<hex>` data
/// lines gain a third column holding the expansion, or the bare
/// `{"block_hash":"<hex>"}` when the hash is absent. Undecodable hex drops
/// the line with a warning.
pub fn scan_list(db_dir: &Path, list_path: &Path, out: &mut dyn Write, command: &str) -> Result<()> {
    let scan = ScanManager::open(db_dir)?;
    let file = File::open(list_path)
        .with_context(|| format!("Failed to open {}", list_path.display()))?;

    write_header(out, command)?;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", list_path.display()))?;
        if line.starts_with('#') {
            writeln!(out, "{}", line)?;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some((feature, hex_hash)) = line.split_once('\t') else {
            tracing::warn!(line = %line, "skipping malformed scan list line");
            continue;
        };
        let block_hash = hexutil::hex_to_bin(hex_hash.trim());
        if block_hash.is_empty() {
            continue;
        }
        let expanded = scan.find_expanded_hash_json(&block_hash)?;
        if expanded.is_empty() {
            writeln!(out, "{}\t{}\t{{\"block_hash\":\"{}\"}}", feature, hex_hash, hex_hash)?;
        } else {
            writeln!(out, "{}\t{}\t{}", feature, hex_hash, expanded)?;
        }
    }
    writeln!(out, "# scan_list completed.")?;
    Ok(())
}
