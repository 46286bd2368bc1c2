// src/batch.rs

//! Batch helpers around the subject universe: sharding a run list into
//! disjoint list files, and finding subjects that were never preprocessed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::fs::FileSystem;
use crate::subject::{read_list, scan_subject_dirs, SubjectId};

/// Sizes of consecutive shards of at most `size` items.
pub fn shard_sizes(n: usize, size: usize) -> Vec<usize> {
    if size == 0 {
        return Vec::new();
    }
    (0..n).step_by(size).map(|start| size.min(n - start)).collect()
}

/// Split `items` into consecutive shards of at most `size`, keeping order.
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return Vec::new();
    }
    items.chunks(size).map(<[T]>::to_vec).collect()
}

/// `<prefix><offset>.csv`, where `offset` is the index of the shard's first
/// subject in the full list.
pub fn shard_file_name(prefix: &str, offset: usize) -> String {
    format!("{prefix}{offset}.csv")
}

/// Canonical subject ids from a list file, or from the `sub-*` directories
/// of `input` when it is a directory. Later repeats of a subject are
/// dropped, so no subject can land in two shards.
pub fn load_split_input(fs: &dyn FileSystem, input: &Path) -> Result<Vec<String>> {
    if fs.is_dir(input) {
        let subjects = scan_subject_dirs(fs, input)?;
        return Ok(subjects.into_iter().map(|s| s.to_string()).collect());
    }

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for raw in read_list(fs, input)? {
        let (id, _) = SubjectId::normalize(&raw)?;
        if seen.insert(id.clone()) {
            ids.push(id.to_string());
        } else {
            warn!(input = %input.display(), "subject {raw} is listed more than once, dropped");
        }
    }
    Ok(ids)
}

/// Write one list file per shard into `outdir` and return their paths.
pub fn write_shards(
    fs: &dyn FileSystem,
    ids: &[String],
    size: usize,
    prefix: &str,
    outdir: &Path,
) -> Result<Vec<PathBuf>> {
    if size == 0 {
        bail!("shard size must be >= 1");
    }
    fs.create_dir_all(outdir)
        .with_context(|| format!("creating shard directory {:?}", outdir))?;

    let mut written = Vec::new();
    for (i, shard) in partition(ids, size).into_iter().enumerate() {
        let path = outdir.join(shard_file_name(prefix, i * size));
        let mut body = shard.join("\n");
        body.push('\n');
        fs.write(&path, body.as_bytes())?;
        written.push(path);
    }
    Ok(written)
}

/// Subjects with a `sub-*` directory in `rawdir` but none in `preprocdir`,
/// sorted.
pub fn missing_subjects(
    fs: &dyn FileSystem,
    rawdir: &Path,
    preprocdir: &Path,
) -> Result<Vec<SubjectId>> {
    let raw = scan_subject_dirs(fs, rawdir)
        .with_context(|| format!("scanning raw directory {:?}", rawdir))?;
    let done: HashSet<SubjectId> = scan_subject_dirs(fs, preprocdir)
        .with_context(|| format!("scanning preprocessed directory {:?}", preprocdir))?
        .into_iter()
        .collect();

    let mut missing: Vec<SubjectId> = raw.into_iter().filter(|s| !done.contains(s)).collect();
    missing.sort();
    missing.dedup();
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn last_shard_takes_the_remainder() {
        assert_eq!(shard_sizes(10, 4), vec![4, 4, 2]);
        assert_eq!(shard_sizes(8, 4), vec![4, 4]);
        assert!(shard_sizes(0, 4).is_empty());
        assert!(shard_sizes(3, 0).is_empty());
    }

    #[test]
    fn shards_are_named_by_offset() {
        let fs = MockFileSystem::new();
        let ids: Vec<String> = (1..=5).map(|i| format!("sub-{i}")).collect();
        let paths = write_shards(&fs, &ids, 2, "batch", Path::new("lists")).unwrap();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("lists/batch0.csv"),
                PathBuf::from("lists/batch2.csv"),
                PathBuf::from("lists/batch4.csv"),
            ]
        );
        assert_eq!(fs.read_to_string(&paths[1]).unwrap(), "sub-3\nsub-4\n");
        assert_eq!(fs.read_to_string(&paths[2]).unwrap(), "sub-5\n");
    }

    #[test]
    fn split_input_may_be_a_directory() {
        let fs = MockFileSystem::new();
        fs.add_dir("raw/sub-b");
        fs.add_dir("raw/sub-a");
        fs.add_file("raw/sub-c", b"not a dir");
        fs.add_dir("raw/derivatives");
        assert_eq!(
            load_split_input(&fs, Path::new("raw")).unwrap(),
            vec!["sub-b", "sub-a"]
        );
    }

    #[test]
    fn split_list_is_normalized_and_deduplicated() {
        let fs = MockFileSystem::new();
        fs.add_file("all.csv", "7\nsub-2\nsub-7\n2\nsub-9\n");
        assert_eq!(
            load_split_input(&fs, Path::new("all.csv")).unwrap(),
            vec!["sub-7", "sub-2", "sub-9"]
        );

        fs.add_file("bad.csv", "sub-1\n../etc\n");
        let err = load_split_input(&fs, Path::new("bad.csv")).unwrap_err();
        assert!(err.to_string().contains("../etc"), "{err}");
    }

    #[test]
    fn missing_is_raw_minus_preprocessed() {
        let fs = MockFileSystem::new();
        for s in ["sub-3", "sub-1", "sub-2"] {
            fs.add_dir(format!("raw/{s}"));
        }
        fs.add_dir("prep/sub-2");
        fs.add_dir("prep/sub-9");

        let missing = missing_subjects(&fs, Path::new("raw"), Path::new("prep")).unwrap();
        assert_eq!(missing, vec![SubjectId::new("1"), SubjectId::new("3")]);
    }
}
