//! The directory tree.
//!
//! Directories own their children; files are leaves that refer to a [`FileRecord`] by id, so
//! moving an entry never touches the block bookkeeping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BlockId, RecordStreamOptions};
use crate::error::{DfsError, Result};

pub(crate) type FileId = u64;

/// A committed block of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub id: BlockId,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfsFile {
    pub path: String,
    pub name: String,
    pub date_created: DateTime<Utc>,
    pub block_size: u64,
    pub replication_factor: u32,
    pub record_options: RecordStreamOptions,
    pub is_open_for_writing: bool,
    /// Committed blocks in file order.
    pub blocks: Vec<FileBlock>,
    /// Sum of the committed block sizes.
    pub size: u64,
}

impl DfsFile {
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfsDirectory {
    pub path: String,
    pub name: String,
    pub date_created: DateTime<Utc>,
    /// Direct children. Child directories are listed without their own children.
    pub children: Vec<FileSystemEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileSystemEntry {
    File(DfsFile),
    Directory(DfsDirectory),
}

impl FileSystemEntry {
    pub fn name(&self) -> &str {
        match self {
            FileSystemEntry::File(file) => &file.name,
            FileSystemEntry::Directory(dir) => &dir.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileSystemEntry::File(file) => &file.path,
            FileSystemEntry::Directory(dir) => &dir.path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub date_created: DateTime<Utc>,
    pub block_size: u64,
    pub replication_factor: u32,
    pub record_options: RecordStreamOptions,
    pub blocks: Vec<FileBlock>,
    pub size: u64,
    pub open_for_writing: bool,
    /// The one block being written, not yet committed.
    pub pending_block: Option<BlockId>,
    /// The client closed the file while `pending_block` was still uncommitted.
    pub close_requested: bool,
}

impl FileRecord {
    pub fn new(block_size: u64, replication_factor: u32, record_options: RecordStreamOptions) -> Self {
        FileRecord {
            date_created: Utc::now(),
            block_size,
            replication_factor,
            record_options,
            blocks: Vec::new(),
            size: 0,
            open_for_writing: true,
            pending_block: None,
            close_requested: false,
        }
    }

    pub fn accepts_new_block(&self) -> bool {
        self.open_for_writing && !self.close_requested
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DirectoryNode {
    pub date_created: DateTime<Utc>,
    pub children: BTreeMap<String, Node>,
}

impl DirectoryNode {
    fn new() -> Self {
        DirectoryNode {
            date_created: Utc::now(),
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Node {
    Directory(DirectoryNode),
    File(FileId),
}

/// Split an absolute path into its components. The root is the empty list.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(DfsError::InvalidPath(format!("{path} is not an absolute path")));
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let components: Vec<&str> = rest.split('/').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(DfsError::InvalidPath(format!("{path} contains an empty path component")));
    }
    Ok(components)
}

fn join(components: &[&str]) -> String {
    format!("/{}", components.join("/"))
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Namespace {
    root: DirectoryNode,
    files: HashMap<FileId, FileRecord>,
    next_file_id: FileId,
}

impl Namespace {
    pub fn new() -> Self {
        Namespace {
            root: DirectoryNode::new(),
            files: HashMap::new(),
            next_file_id: 1,
        }
    }

    pub fn file(&self, id: FileId) -> Option<&FileRecord> {
        self.files.get(&id)
    }

    pub fn file_mut(&mut self, id: FileId) -> Option<&mut FileRecord> {
        self.files.get_mut(&id)
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &FileRecord)> {
        self.files.iter().map(|(id, record)| (*id, record))
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.files.values_mut()
    }

    /// Look up an entry. Walking through a file is an error; a missing entry is `None`.
    fn lookup(&self, components: &[&str]) -> Result<Option<&Node>> {
        let mut dir = &self.root;
        for (i, name) in components.iter().enumerate() {
            match dir.children.get(*name) {
                None => return Ok(None),
                Some(node) if i + 1 == components.len() => return Ok(Some(node)),
                Some(Node::Directory(child)) => dir = child,
                Some(Node::File(_)) => return Err(DfsError::NotADirectory(join(&components[..=i]))),
            }
        }
        // Only the root has no components.
        Ok(None)
    }

    fn directory(&self, components: &[&str]) -> Result<&DirectoryNode> {
        let mut dir = &self.root;
        for (i, name) in components.iter().enumerate() {
            match dir.children.get(*name) {
                Some(Node::Directory(child)) => dir = child,
                Some(Node::File(_)) => return Err(DfsError::NotADirectory(join(&components[..=i]))),
                None => return Err(DfsError::NotFound(join(&components[..=i]))),
            }
        }
        Ok(dir)
    }

    fn directory_mut(&mut self, components: &[&str]) -> Result<&mut DirectoryNode> {
        let mut dir = &mut self.root;
        for (i, name) in components.iter().enumerate() {
            match dir.children.get_mut(*name) {
                Some(Node::Directory(child)) => dir = child,
                Some(Node::File(_)) => return Err(DfsError::NotADirectory(join(&components[..=i]))),
                None => return Err(DfsError::NotFound(join(&components[..=i]))),
            }
        }
        Ok(dir)
    }

    /// Create a directory and any missing parents. Creating an existing directory succeeds.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let components = split_path(path)?;
        let mut dir = &mut self.root;
        for (i, name) in components.iter().enumerate() {
            let node = dir
                .children
                .entry(name.to_string())
                .or_insert_with(|| Node::Directory(DirectoryNode::new()));
            match node {
                Node::Directory(child) => dir = child,
                Node::File(_) if i + 1 == components.len() => return Err(DfsError::AlreadyExists(path.to_string())),
                Node::File(_) => return Err(DfsError::NotADirectory(join(&components[..=i]))),
            }
        }
        Ok(())
    }

    /// Add a file entry. The parent directory must exist.
    pub fn create_file(&mut self, path: &str, record: FileRecord) -> Result<FileId> {
        let components = split_path(path)?;
        let Some((name, parent)) = components.split_last() else {
            return Err(DfsError::AlreadyExists(path.to_string()));
        };
        let id = self.next_file_id;
        let dir = self.directory_mut(parent)?;
        if dir.children.contains_key(*name) {
            return Err(DfsError::AlreadyExists(path.to_string()));
        }
        dir.children.insert(name.to_string(), Node::File(id));
        self.files.insert(id, record);
        self.next_file_id += 1;
        Ok(id)
    }

    /// Resolve a path that must name a file.
    pub fn file_id(&self, path: &str) -> Result<FileId> {
        let components = split_path(path)?;
        match self.lookup(&components)? {
            Some(Node::File(id)) => Ok(*id),
            Some(Node::Directory(_)) => Err(DfsError::InvalidOperation(format!("{path} is a directory"))),
            None if components.is_empty() => Err(DfsError::InvalidOperation("/ is a directory".into())),
            None => Err(DfsError::NotFound(path.to_string())),
        }
    }

    /// Remove an entry and return the records of every file under it, or `None` if nothing
    /// exists at `path`.
    pub fn delete(&mut self, path: &str, recursive: bool) -> Result<Option<Vec<FileRecord>>> {
        let components = split_path(path)?;
        let Some((name, parent)) = components.split_last() else {
            return Err(DfsError::InvalidPath("the root directory cannot be deleted".into()));
        };
        let dir = match self.directory_mut(parent) {
            Ok(dir) => dir,
            Err(DfsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match dir.children.get(*name) {
            None => return Ok(None),
            Some(Node::Directory(child)) if !recursive && !child.children.is_empty() => {
                return Err(DfsError::InvalidOperation(format!("directory {path} is not empty")));
            }
            Some(_) => {}
        }
        let Some(node) = dir.children.remove(*name) else {
            return Ok(None);
        };

        let mut ids = Vec::new();
        collect_files(&node, &mut ids);
        let removed = ids.iter().filter_map(|id| self.files.remove(id)).collect();
        Ok(Some(removed))
    }

    /// Move `from` to `to`. If `to` is an existing directory the entry moves into it.
    pub fn move_entry(&mut self, from: &str, to: &str) -> Result<()> {
        let source = split_path(from)?;
        let Some((source_name, source_parent)) = source.split_last() else {
            return Err(DfsError::InvalidPath("the root directory cannot be moved".into()));
        };
        if self.lookup(&source)?.is_none() {
            return Err(DfsError::NotFound(from.to_string()));
        }

        let destination = split_path(to)?;
        let mut target = destination.clone();
        match self.lookup(&destination)? {
            Some(Node::Directory(_)) => target.push(*source_name),
            None if destination.is_empty() => target.push(*source_name),
            Some(Node::File(_)) => return Err(DfsError::AlreadyExists(to.to_string())),
            None => {}
        }
        if target.len() >= source.len() && target[..source.len()] == source[..] {
            return Err(DfsError::InvalidOperation(format!("cannot move {from} into itself")));
        }
        let Some((target_name, target_parent)) = target.split_last() else {
            return Err(DfsError::InvalidPath(format!("cannot move {from} to {to}")));
        };
        let target_dir = self.directory(target_parent)?;
        if target_dir.children.contains_key(*target_name) {
            return Err(DfsError::AlreadyExists(join(&target)));
        }

        let node = self
            .directory_mut(source_parent)?
            .children
            .remove(*source_name)
            .ok_or_else(|| DfsError::NotFound(from.to_string()))?;
        self.directory_mut(target_parent)?
            .children
            .insert(target_name.to_string(), node);
        Ok(())
    }

    pub fn file_info(&self, path: &str) -> Result<Option<DfsFile>> {
        let components = split_path(path)?;
        match self.lookup(&components)? {
            Some(Node::File(id)) => Ok(self.describe_file(&components, *id)),
            _ => Ok(None),
        }
    }

    pub fn directory_info(&self, path: &str) -> Result<Option<DfsDirectory>> {
        let components = split_path(path)?;
        if components.is_empty() {
            return Ok(Some(self.describe_directory(&components, &self.root, true)));
        }
        match self.lookup(&components)? {
            Some(Node::Directory(dir)) => Ok(Some(self.describe_directory(&components, dir, true))),
            _ => Ok(None),
        }
    }

    pub fn entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>> {
        let components = split_path(path)?;
        if components.is_empty() {
            return Ok(Some(FileSystemEntry::Directory(self.describe_directory(&components, &self.root, true))));
        }
        Ok(match self.lookup(&components)? {
            Some(Node::File(id)) => self.describe_file(&components, *id).map(FileSystemEntry::File),
            Some(Node::Directory(dir)) => Some(FileSystemEntry::Directory(self.describe_directory(&components, dir, true))),
            None => None,
        })
    }

    fn describe_file(&self, components: &[&str], id: FileId) -> Option<DfsFile> {
        let record = self.files.get(&id)?;
        Some(DfsFile {
            path: join(components),
            name: components.last().map(|s| s.to_string()).unwrap_or_default(),
            date_created: record.date_created,
            block_size: record.block_size,
            replication_factor: record.replication_factor,
            record_options: record.record_options,
            is_open_for_writing: record.open_for_writing,
            blocks: record.blocks.clone(),
            size: record.size,
        })
    }

    fn describe_directory(&self, components: &[&str], dir: &DirectoryNode, with_children: bool) -> DfsDirectory {
        let path = join(components);
        let mut children = Vec::new();
        if with_children {
            for (name, node) in &dir.children {
                let mut child = components.to_vec();
                child.push(name);
                match node {
                    Node::File(id) => {
                        if let Some(file) = self.describe_file(&child, *id) {
                            children.push(FileSystemEntry::File(file));
                        }
                    }
                    Node::Directory(sub) => {
                        children.push(FileSystemEntry::Directory(self.describe_directory(&child, sub, false)));
                    }
                }
            }
        }
        DfsDirectory {
            name: components.last().map(|s| s.to_string()).unwrap_or_default(),
            path,
            date_created: dir.date_created,
            children,
        }
    }

    /// Path of a file, found by walking the tree. Only used for log messages.
    pub fn path_of(&self, id: FileId) -> Option<String> {
        fn walk(dir: &DirectoryNode, prefix: &str, id: FileId) -> Option<String> {
            for (name, node) in &dir.children {
                let path = child_path(prefix, name);
                match node {
                    Node::File(file) if *file == id => return Some(path),
                    Node::Directory(sub) => {
                        if let Some(found) = walk(sub, &path, id) {
                            return Some(found);
                        }
                    }
                    Node::File(_) => {}
                }
            }
            None
        }
        walk(&self.root, "/", id)
    }
}

fn collect_files(node: &Node, ids: &mut Vec<FileId>) {
    match node {
        Node::File(id) => ids.push(*id),
        Node::Directory(dir) => dir.children.values().for_each(|child| collect_files(child, ids)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        FileRecord::new(crate::common::DEFAULT_BLOCK_SIZE, 1, RecordStreamOptions::default())
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(split_path("relative/path"), Err(DfsError::InvalidPath(_))));
        assert!(matches!(split_path("/a//b"), Err(DfsError::InvalidPath(_))));
        assert!(matches!(split_path("/a/"), Err(DfsError::InvalidPath(_))));
        assert!(matches!(split_path(""), Err(DfsError::InvalidPath(_))));
        assert_eq!(split_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_path("/a/b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn creates_directories_and_files() {
        let mut ns = Namespace::new();
        ns.create_directory("/a/b/c").unwrap();
        ns.create_directory("/a/b").unwrap();
        ns.create_file("/a/b/file", record()).unwrap();

        let dir = ns.directory_info("/a/b").unwrap().unwrap();
        let names: Vec<&str> = dir.children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["c", "file"]);
        assert_eq!(dir.children[1].path(), "/a/b/file");

        assert!(matches!(ns.create_file("/a/b/file", record()), Err(DfsError::AlreadyExists(_))));
        assert!(matches!(ns.create_file("/missing/file", record()), Err(DfsError::NotFound(_))));
        assert!(matches!(ns.create_directory("/a/b/file"), Err(DfsError::AlreadyExists(_))));
        assert!(matches!(ns.create_directory("/a/b/file/x"), Err(DfsError::NotADirectory(_))));
        assert!(matches!(ns.file_info("/a/b/file/x"), Err(DfsError::NotADirectory(_))));
        assert!(ns.file_info("/a/b").unwrap().is_none());
        assert!(ns.file_info("/a/b/nothing").unwrap().is_none());
    }

    #[test]
    fn deletes_entries() {
        let mut ns = Namespace::new();
        ns.create_directory("/a/b").unwrap();
        ns.create_file("/a/b/f1", record()).unwrap();
        ns.create_file("/a/f2", record()).unwrap();

        assert!(matches!(ns.delete("/a", false), Err(DfsError::InvalidOperation(_))));
        assert!(ns.delete("/nothing", false).unwrap().is_none());
        assert!(ns.delete("/nothing/deeper", true).unwrap().is_none());
        assert!(matches!(ns.delete("/", true), Err(DfsError::InvalidPath(_))));

        let removed = ns.delete("/a", true).unwrap().unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(ns.files().count(), 0);
        assert!(ns.entry_info("/a").unwrap().is_none());
    }

    #[test]
    fn moves_entries() {
        let mut ns = Namespace::new();
        ns.create_directory("/src/inner").unwrap();
        ns.create_directory("/dst").unwrap();
        let id = ns.create_file("/src/inner/file", record()).unwrap();

        ns.move_entry("/src/inner/file", "/dst/renamed").unwrap();
        assert_eq!(ns.file_id("/dst/renamed").unwrap(), id);
        assert!(matches!(ns.file_id("/src/inner/file"), Err(DfsError::NotFound(_))));

        // Onto an existing directory: moves inside it.
        ns.move_entry("/src", "/dst").unwrap();
        assert!(ns.directory_info("/dst/src/inner").unwrap().is_some());

        assert!(matches!(ns.move_entry("/dst", "/dst/src/inner"), Err(DfsError::InvalidOperation(_))));
        assert!(matches!(ns.move_entry("/nothing", "/x"), Err(DfsError::NotFound(_))));
        assert!(matches!(ns.move_entry("/dst/src", "/dst/renamed"), Err(DfsError::AlreadyExists(_))));
        assert!(matches!(ns.move_entry("/dst/src", "/missing/x"), Err(DfsError::NotFound(_))));
        assert_eq!(ns.path_of(id).as_deref(), Some("/dst/renamed"));
    }
}
