// src/fs/mock.rs

use super::FileSystem;
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub enum MockEntry {
    File(Vec<u8>),
    Dir(Vec<String>), // List of child names
}

/// In-memory filesystem used by tests.
///
/// Paths are stored verbatim; a relative path's implicit root is `"."`.
/// Copy and remove failures can be injected by path substring to simulate
/// broken mounts.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, MockEntry>>>,
    failing_copies: Arc<Mutex<Vec<String>>>,
    failing_removes: Arc<Mutex<Vec<String>>>,
    mtimes: Arc<Mutex<HashMap<PathBuf, SystemTime>>>,
    create_hooks: Arc<Mutex<Vec<CreateHook>>>,
}

/// Files to add just before an exclusive create whose path contains `needle`.
#[derive(Debug, Clone)]
struct CreateHook {
    needle: String,
    files: Vec<(PathBuf, Vec<u8>)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parent_of(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    if parent.as_os_str().is_empty() {
        if path == Path::new(".") {
            None
        } else {
            Some(PathBuf::from("."))
        }
    } else {
        Some(parent.to_path_buf())
    }
}

fn child_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

impl MockFileSystem {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        // Ensure root exists
        files.insert(PathBuf::from("."), MockEntry::Dir(Vec::new()));

        Self {
            files: Arc::new(Mutex::new(files)),
            failing_copies: Arc::new(Mutex::new(Vec::new())),
            failing_removes: Arc::new(Mutex::new(Vec::new())),
            mtimes: Arc::new(Mutex::new(HashMap::new())),
            create_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut files = lock(&self.files);
        Self::insert_file(&mut files, path.as_ref(), content.into());
        self.touch(path.as_ref());
    }

    /// Backdate (or postdate) the modification time of `path`.
    pub fn set_modified(&self, path: impl AsRef<Path>, when: SystemTime) {
        lock(&self.mtimes).insert(path.as_ref().to_path_buf(), when);
    }

    fn touch(&self, path: &Path) {
        lock(&self.mtimes).insert(path.to_path_buf(), SystemTime::now());
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut files = lock(&self.files);
        Self::ensure_dir_entry(&mut files, path.as_ref());
    }

    /// Make every `copy` whose source path contains `needle` fail.
    pub fn fail_copies_matching(&self, needle: impl Into<String>) {
        lock(&self.failing_copies).push(needle.into());
    }

    /// Make every `remove_dir_all` whose path contains `needle` fail.
    pub fn fail_removes_matching(&self, needle: impl Into<String>) {
        lock(&self.failing_removes).push(needle.into());
    }

    /// Before the next `write_new` whose path contains `needle`, add `files`.
    /// Simulates another process finishing work while this one waits.
    pub fn on_exclusive_create(
        &self,
        needle: impl Into<String>,
        files: impl IntoIterator<Item = (PathBuf, Vec<u8>)>,
    ) {
        lock(&self.create_hooks).push(CreateHook {
            needle: needle.into(),
            files: files.into_iter().collect(),
        });
    }

    fn run_create_hooks(&self, path: &Path) {
        let text = path.to_string_lossy().to_string();
        let fired: Vec<CreateHook> = {
            let mut hooks = lock(&self.create_hooks);
            let (fired, kept) = hooks.drain(..).partition(|h| text.contains(h.needle.as_str()));
            *hooks = kept;
            fired
        };
        for (file, content) in fired.into_iter().flat_map(|h| h.files) {
            self.add_file(file, content);
        }
    }

    /// Snapshot of every file at or below `prefix`, keyed by path.
    pub fn files_under(&self, prefix: impl AsRef<Path>) -> BTreeMap<PathBuf, Vec<u8>> {
        let prefix = prefix.as_ref();
        lock(&self.files)
            .iter()
            .filter_map(|(path, entry)| match entry {
                MockEntry::File(content) if path.starts_with(prefix) => {
                    Some((path.clone(), content.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn insert_file(files: &mut HashMap<PathBuf, MockEntry>, path: &Path, content: Vec<u8>) {
        files.insert(path.to_path_buf(), MockEntry::File(content));

        // Ensure parent directories exist implicitly for simplicity in this mock
        if let Some(parent) = parent_of(path) {
            Self::ensure_dir_entry(files, &parent);
            Self::link_child(files, &parent, path);
        }
    }

    fn link_child(files: &mut HashMap<PathBuf, MockEntry>, parent: &Path, path: &Path) {
        if let (Some(MockEntry::Dir(children)), Some(name)) =
            (files.get_mut(parent), child_name(path))
        {
            if !children.contains(&name) {
                children.push(name);
            }
        }
    }

    fn ensure_dir_entry(files: &mut HashMap<PathBuf, MockEntry>, path: &Path) {
        if files.contains_key(path) {
            return;
        }
        files.insert(path.to_path_buf(), MockEntry::Dir(Vec::new()));
        if let Some(parent) = parent_of(path) {
            if parent != path {
                // Avoid infinite loop at root
                Self::ensure_dir_entry(files, &parent);
                Self::link_child(files, &parent, path);
            }
        }
    }

    fn remove_entry(files: &mut HashMap<PathBuf, MockEntry>, path: &Path) {
        if let Some(MockEntry::Dir(children)) = files.remove(path) {
            for child in children {
                Self::remove_entry(files, &path.join(child));
            }
        }
    }

    fn unlink_child(files: &mut HashMap<PathBuf, MockEntry>, path: &Path) {
        if let (Some(parent), Some(name)) = (parent_of(path), child_name(path)) {
            if let Some(MockEntry::Dir(children)) = files.get_mut(&parent) {
                children.retain(|c| c != &name);
            }
        }
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let files = lock(&self.files);
        match files.get(path) {
            Some(MockEntry::File(content)) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let files = lock(&self.files);
        match files.get(path) {
            Some(MockEntry::File(content)) => Ok(Box::new(Cursor::new(content.clone()))),
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.is_dir(path) {
            return Err(anyhow!("Is a directory: {:?}", path));
        }
        self.add_file(path, contents);
        Ok(())
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut files = lock(&self.files);
        match files.get_mut(path) {
            Some(MockEntry::File(existing)) => {
                existing.extend_from_slice(contents);
                Ok(())
            }
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => {
                Self::insert_file(&mut files, path, contents.to_vec());
                drop(files);
                self.touch(path);
                Ok(())
            }
        }
    }

    fn write_new(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        self.run_create_hooks(path);
        let mut files = lock(&self.files);
        if files.contains_key(path) {
            return Ok(false);
        }
        Self::insert_file(&mut files, path, contents.to_vec());
        drop(files);
        self.touch(path);
        Ok(true)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        if !self.exists(path) {
            return Err(anyhow!("File not found: {:?}", path));
        }
        Ok(lock(&self.mtimes)
            .get(path)
            .copied()
            .unwrap_or(SystemTime::UNIX_EPOCH))
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(lock(&self.files).get(path), Some(MockEntry::File(_)))
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(lock(&self.files).get(path), Some(MockEntry::Dir(_)))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        match lock(&self.files).get(path) {
            Some(MockEntry::File(content)) => Ok(content.len() as u64),
            Some(MockEntry::Dir(_)) => Ok(0),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let files = lock(&self.files);
        match files.get(path) {
            Some(MockEntry::Dir(children)) => {
                Ok(children.iter().map(|name| path.join(name)).collect())
            }
            _ => Err(anyhow!("Not a directory or not found: {:?}", path)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        if self.is_file(path) {
            return Err(anyhow!("File exists: {:?}", path));
        }
        self.add_dir(path);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut files = lock(&self.files);
        match files.get(path) {
            Some(MockEntry::File(_)) => {
                files.remove(path);
                Self::unlink_child(&mut files, path);
                Ok(())
            }
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let text = path.to_string_lossy().to_string();
        if lock(&self.failing_removes).iter().any(|n| text.contains(n.as_str())) {
            return Err(anyhow!("Permission denied (injected): {:?}", path));
        }

        let mut files = lock(&self.files);
        match files.get(path) {
            Some(MockEntry::Dir(_)) => {
                Self::remove_entry(&mut files, path);
                Self::unlink_child(&mut files, path);
                Ok(())
            }
            Some(MockEntry::File(_)) => Err(anyhow!("Not a directory: {:?}", path)),
            None => Err(anyhow!("Directory not found: {:?}", path)),
        }
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let text = from.to_string_lossy().to_string();
        if lock(&self.failing_copies).iter().any(|n| text.contains(n.as_str())) {
            return Err(anyhow!("Input/output error (injected): {:?}", from));
        }

        let mut files = lock(&self.files);
        let content = match files.get(from) {
            Some(MockEntry::File(content)) => content.clone(),
            Some(MockEntry::Dir(_)) => return Err(anyhow!("Is a directory: {:?}", from)),
            None => return Err(anyhow!("File not found: {:?}", from)),
        };
        let len = content.len() as u64;
        Self::insert_file(&mut files, to, content);
        drop(files);
        self.touch(to);
        Ok(len)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = lock(&self.files);
        let content = match files.get(from) {
            Some(MockEntry::File(content)) => content.clone(),
            Some(MockEntry::Dir(_)) => {
                return Err(anyhow!("Renaming directories is not supported: {:?}", from));
            }
            None => return Err(anyhow!("File not found: {:?}", from)),
        };
        files.remove(from);
        Self::unlink_child(&mut files, from);
        Self::insert_file(&mut files, to, content);
        drop(files);
        let mut mtimes = lock(&self.mtimes);
        let when = mtimes.remove(from).unwrap_or_else(SystemTime::now);
        mtimes.insert(to.to_path_buf(), when);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_dir_all_drops_descendants_and_unlinks_parent() {
        let fs = MockFileSystem::new();
        fs.add_file("tmp/sub-1/a.txt", b"a");
        fs.add_file("tmp/sub-1/imgs/gibbs/b.png", b"b");
        fs.add_file("tmp/sub-2/c.txt", b"c");

        fs.remove_dir_all(Path::new("tmp/sub-1")).unwrap();

        assert!(!fs.exists(Path::new("tmp/sub-1/imgs/gibbs/b.png")));
        assert!(!fs.exists(Path::new("tmp/sub-1")));
        assert_eq!(
            fs.read_dir(Path::new("tmp")).unwrap(),
            vec![PathBuf::from("tmp/sub-2")]
        );
    }

    #[test]
    fn write_new_refuses_existing_file() {
        let fs = MockFileSystem::new();
        assert!(fs.write_new(Path::new("locks/a.lease"), b"1").unwrap());
        assert!(!fs.write_new(Path::new("locks/a.lease"), b"2").unwrap());
        assert_eq!(fs.read_to_string(Path::new("locks/a.lease")).unwrap(), "1");
    }

    #[test]
    fn rename_keeps_modification_time() {
        let fs = MockFileSystem::new();
        fs.add_file("d/a", b"x");
        fs.set_modified("d/a", SystemTime::UNIX_EPOCH);
        fs.rename(Path::new("d/a"), Path::new("d/b")).unwrap();
        assert_eq!(fs.modified(Path::new("d/b")).unwrap(), SystemTime::UNIX_EPOCH);
        assert!(fs.modified(Path::new("d/a")).is_err());
    }

    #[test]
    fn create_hook_fires_once() {
        let fs = MockFileSystem::new();
        fs.on_exclusive_create("a.lease", [(PathBuf::from("out/done"), b"1".to_vec())]);

        assert!(fs.write_new(Path::new("locks/b.lease"), b"").unwrap());
        assert!(!fs.exists(Path::new("out/done")));
        assert!(fs.write_new(Path::new("locks/a.lease"), b"").unwrap());
        assert!(fs.exists(Path::new("out/done")));

        fs.remove_file(Path::new("out/done")).unwrap();
        fs.remove_file(Path::new("locks/a.lease")).unwrap();
        assert!(fs.write_new(Path::new("locks/a.lease"), b"").unwrap());
        assert!(!fs.exists(Path::new("out/done")));
    }

    #[test]
    fn injected_copy_failure() {
        let fs = MockFileSystem::new();
        fs.add_file("data/sub-3/x.nii", b"x");
        fs.fail_copies_matching("sub-3");
        assert!(fs.copy(Path::new("data/sub-3/x.nii"), Path::new("tmp/x.nii")).is_err());
        assert!(!fs.exists(Path::new("tmp/x.nii")));
    }

    #[test]
    fn rename_moves_content() {
        let fs = MockFileSystem::new();
        fs.add_file("d/.a.tmp", b"hello");
        fs.rename(Path::new("d/.a.tmp"), Path::new("d/a.json")).unwrap();
        assert!(!fs.exists(Path::new("d/.a.tmp")));
        assert_eq!(fs.read_to_string(Path::new("d/a.json")).unwrap(), "hello");
        assert_eq!(fs.read_dir(Path::new("d")).unwrap(), vec![PathBuf::from("d/a.json")]);
    }
}
