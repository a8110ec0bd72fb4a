use crate::db;
use crate::import::ImportManager;
use crate::scan::{BlockEntry, ScanManager};
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Which name pairs a copied source keeps in the output.
#[derive(Debug, Clone, Copy)]
enum NameFilter<'a> {
    All,
    OnlyRepository(&'a str),
    ExceptRepository(&'a str),
}

/// Copies blocks and their sources from one input into the output under a
/// per-operation rule. Inputs are never written.
///
/// Sources already present in the output before the run are skipped
/// entirely, which keeps repeated runs of the same operation idempotent.
struct Copier<'a> {
    input: &'a ScanManager,
    fallback: Option<&'a ScanManager>,
    out: &'a ImportManager,
    preexisting_sources: HashSet<Vec<u8>>,
    processed_sources: HashSet<Vec<u8>>,
    repository_sources: HashSet<Vec<u8>>,
    non_repository_sources: HashSet<Vec<u8>>,
    classified_sources: HashSet<Vec<u8>>,
}

impl<'a> Copier<'a> {
    fn new(
        input: &'a ScanManager,
        fallback: Option<&'a ScanManager>,
        out: &'a ImportManager,
        preexisting_sources: HashSet<Vec<u8>>,
    ) -> Copier<'a> {
        Copier {
            input,
            fallback,
            out,
            preexisting_sources,
            processed_sources: HashSet::new(),
            repository_sources: HashSet::new(),
            non_repository_sources: HashSet::new(),
            classified_sources: HashSet::new(),
        }
    }

    /// Merge the given (source hash, sub_count) pairs of one block and copy
    /// the source records they reference.
    fn copy_block(
        &mut self,
        block_hash: &[u8],
        entry: &BlockEntry,
        pairs: &[(Vec<u8>, u64)],
        names: NameFilter,
    ) -> Result<()> {
        for (file_hash, sub_count) in pairs {
            if self.preexisting_sources.contains(file_hash) {
                continue;
            }
            self.out.merge_hash(
                block_hash,
                entry.k_entropy,
                &entry.block_label,
                file_hash,
                *sub_count,
            )?;
            self.copy_source(file_hash, names)?;
        }
        Ok(())
    }

    fn copy_source(&mut self, file_hash: &[u8], names: NameFilter) -> Result<()> {
        if !self.processed_sources.insert(file_hash.to_vec()) {
            return Ok(());
        }

        // source data from the input, else from the other input
        let data = match self.input.find_source_data(file_hash)? {
            Some(data) => Some(data),
            None => match self.fallback {
                Some(other) => other.find_source_data(file_hash)?,
                None => None,
            },
        };
        let data = data.ok_or_else(|| {
            anyhow!(
                "source {} has no source data in any input",
                crate::hexutil::bin_to_hex(file_hash)
            )
        })?;
        self.out.insert_source_data(
            file_hash,
            data.filesize,
            &data.file_type,
            data.zero_count,
            data.nonprobative_count,
        )?;

        // name pairs from every input, subject to the repository filter
        let mut pairs = self.input.find_source_names(file_hash)?;
        if let Some(other) = self.fallback {
            pairs.extend(other.find_source_names(file_hash)?);
        }
        for (repository_name, file_name) in pairs {
            let keep = match names {
                NameFilter::All => true,
                NameFilter::OnlyRepository(repo) => repository_name == repo,
                NameFilter::ExceptRepository(repo) => repository_name != repo,
            };
            if keep {
                self.out
                    .insert_source_name(file_hash, &repository_name, &file_name)?;
            }
        }
        Ok(())
    }

    /// Classify a source by whether any of its name pairs carries the
    /// repository, and whether any does not. A source can be both.
    fn classify(&mut self, file_hash: &[u8], repository_name: &str) -> Result<()> {
        if !self.classified_sources.insert(file_hash.to_vec()) {
            return Ok(());
        }
        for (repo, _) in self.input.find_source_names(file_hash)? {
            if repo == repository_name {
                self.repository_sources.insert(file_hash.to_vec());
            } else {
                self.non_repository_sources.insert(file_hash.to_vec());
            }
        }
        Ok(())
    }
}

/// Copy every block of A into the output.
pub fn add(a_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, None, &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        copier.copy_block(block_hash, entry, &entry.source_sub_counts, NameFilter::All)
    })
}

/// Copy every block of A and of B into the output, sub_counts summed per
/// source.
pub fn add_multiple(a_dir: &Path, b_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let b = ScanManager::open(b_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;

    for input in [&a, &b] {
        let mut copier = Copier::new(input, None, &out, preexisting.clone());
        for_each_hash(input, |block_hash, entry| {
            copier.copy_block(block_hash, entry, &entry.source_sub_counts, NameFilter::All)
        })?;
    }
    Ok(())
}

/// Copy the blocks of A whose sources carry the repository name; only the
/// matching sub_counts and name pairs reach the output.
pub fn add_repository(
    a_dir: &Path,
    out_dir: &Path,
    repository_name: &str,
    command: &str,
) -> Result<()> {
    copy_by_repository(a_dir, out_dir, repository_name, command, true)
}

/// The complement of `add_repository`.
pub fn subtract_repository(
    a_dir: &Path,
    out_dir: &Path,
    repository_name: &str,
    command: &str,
) -> Result<()> {
    copy_by_repository(a_dir, out_dir, repository_name, command, false)
}

fn copy_by_repository(
    a_dir: &Path,
    out_dir: &Path,
    repository_name: &str,
    command: &str,
    include: bool,
) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, None, &out, preexisting);
    let names = if include {
        NameFilter::OnlyRepository(repository_name)
    } else {
        NameFilter::ExceptRepository(repository_name)
    };

    for_each_hash(&a, |block_hash, entry| {
        let mut pairs = Vec::new();
        for (file_hash, sub_count) in &entry.source_sub_counts {
            copier.classify(file_hash, repository_name)?;
            let qualifies = if include {
                copier.repository_sources.contains(file_hash)
            } else {
                copier.non_repository_sources.contains(file_hash)
            };
            if qualifies {
                pairs.push((file_hash.clone(), *sub_count));
            }
        }
        copier.copy_block(block_hash, entry, &pairs, names)
    })
}

/// Copy the blocks of A whose exact count falls inside `lo:hi`.
pub fn add_range(a_dir: &Path, out_dir: &Path, range: &str, command: &str) -> Result<()> {
    let (lo, hi) = parse_range(range)?;
    let a = ScanManager::open(a_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, None, &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        let count: u64 = entry.source_sub_counts.iter().map(|&(_, c)| c).sum();
        if count < lo || hi.map_or(false, |h| count > h) {
            return Ok(());
        }
        copier.copy_block(block_hash, entry, &entry.source_sub_counts, NameFilter::All)
    })
}

/// Copy blocks present in both inputs that share at least one source;
/// sub_count is the per-source minimum.
pub fn intersect(a_dir: &Path, b_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let b = ScanManager::open(b_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, Some(&b), &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        let Some(entry_b) = b.find_hash_sources(block_hash)? else {
            return Ok(());
        };
        let mut pairs = Vec::new();
        for (file_hash, sub_a) in &entry.source_sub_counts {
            let matching = entry_b
                .source_sub_counts
                .iter()
                .find(|(h, _)| h == file_hash);
            if let Some((_, sub_b)) = matching {
                pairs.push((file_hash.clone(), (*sub_a).min(*sub_b)));
            }
        }
        copier.copy_block(block_hash, entry, &pairs, NameFilter::All)
    })
}

/// Copy blocks whose hash is present in both inputs; sub_counts are the
/// union of the two source lists, distinct pairs merged per source.
pub fn intersect_hash(a_dir: &Path, b_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let b = ScanManager::open(b_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, Some(&b), &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        let Some(entry_b) = b.find_hash_sources(block_hash)? else {
            return Ok(());
        };
        let mut pairs = entry.source_sub_counts.clone();
        for pair in &entry_b.source_sub_counts {
            if !pairs.contains(pair) {
                pairs.push(pair.clone());
            }
        }
        copier.copy_block(block_hash, entry, &pairs, NameFilter::All)
    })
}

/// Copy the parts of A's blocks whose sources B does not list for the same
/// block; a block wholly covered by B drops out.
pub fn subtract(a_dir: &Path, b_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let b = ScanManager::open(b_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, None, &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        let entry_b = b.find_hash_sources(block_hash)?;
        let mut pairs = Vec::new();
        for (file_hash, sub_count) in &entry.source_sub_counts {
            let in_b = entry_b
                .as_ref()
                .map_or(false, |eb| {
                    eb.source_sub_counts.iter().any(|(h, _)| h == file_hash)
                });
            if !in_b {
                pairs.push((file_hash.clone(), *sub_count));
            }
        }
        copier.copy_block(block_hash, entry, &pairs, NameFilter::All)
    })
}

/// Copy the blocks of A whose hash B does not know at all.
pub fn subtract_hash(a_dir: &Path, b_dir: &Path, out_dir: &Path, command: &str) -> Result<()> {
    let a = ScanManager::open(a_dir)?;
    let b = ScanManager::open(b_dir)?;
    let out = open_output(&a, out_dir, command)?;
    let preexisting = output_sources(&out)?;
    let mut copier = Copier::new(&a, None, &out, preexisting);

    for_each_hash(&a, |block_hash, entry| {
        if b.find_hash(block_hash)?.is_some() {
            return Ok(());
        }
        copier.copy_block(block_hash, entry, &entry.source_sub_counts, NameFilter::All)
    })
}

/// `lo:hi` with lo defaulting to 1 and hi to unbounded.
fn parse_range(range: &str) -> Result<(u64, Option<u64>)> {
    let Some((lo, hi)) = range.split_once(':') else {
        return Err(anyhow!("invalid range '{}', expected lo:hi", range));
    };
    let lo = if lo.is_empty() {
        1
    } else {
        lo.parse()
            .with_context(|| format!("invalid range lower bound '{}'", lo))?
    };
    let hi = if hi.is_empty() {
        None
    } else {
        Some(
            hi.parse()
                .with_context(|| format!("invalid range upper bound '{}'", hi))?,
        )
    };
    if let Some(h) = hi {
        if h < lo {
            return Err(anyhow!("empty range '{}'", range));
        }
    }
    Ok((lo, hi))
}

/// Create the output with A's settings when it does not exist yet.
fn open_output(a: &ScanManager, out_dir: &Path, command: &str) -> Result<ImportManager> {
    if !out_dir.exists() {
        db::create(out_dir, a.settings(), command)?;
    }
    ImportManager::open(out_dir, command)
}

fn output_sources(out: &ImportManager) -> Result<HashSet<Vec<u8>>> {
    let mut sources = HashSet::new();
    let mut file_hash = out.first_source()?;
    while !file_hash.is_empty() {
        sources.insert(file_hash.clone());
        file_hash = out.next_source(&file_hash)?;
    }
    Ok(sources)
}

fn for_each_hash<F>(input: &ScanManager, mut f: F) -> Result<()>
where
    F: FnMut(&[u8], &BlockEntry) -> Result<()>,
{
    let mut block_hash = input.first_hash()?;
    while !block_hash.is_empty() {
        let entry = input
            .find_hash_sources(&block_hash)?
            .ok_or_else(|| anyhow!("hash iteration returned an unknown hash"))?;
        f(&block_hash, &entry)?;
        block_hash = input.next_hash(&block_hash)?;
    }
    Ok(())
}
