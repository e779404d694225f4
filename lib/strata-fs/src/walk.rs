//! Generic depth-first traversal over any [`FileSystem`].
//!
//! The walker stats every child through the filesystem it was given, so when
//! that filesystem is a [`RecursiveFileSystem`](crate::RecursiveFileSystem)
//! the directory-transparency rule makes it descend into ZIP archives and
//! disk images as if they were ordinary directories.

use std::path::{Path, PathBuf};

use crate::{FileSystem, Metadata, Result};

/// One visited entry.
#[derive(Clone, Debug)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub metadata: Metadata,
    /// 0 for the walk root, 1 for its children, and so on.
    pub depth: usize,
}

pub struct Walker<'a> {
    fs: &'a dyn FileSystem,
    max_depth: Option<usize>,
}

impl<'a> Walker<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self {
            fs,
            max_depth: None,
        }
    }

    /// Stops descending below the given depth; the root is depth 0.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Visits `root` and everything below it, depth-first, children in
    /// name order. The visitor's error aborts the walk.
    pub fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&WalkEntry) -> Result<()>,
    ) -> Result<()> {
        let metadata = self.fs.metadata(root)?;
        let entry = WalkEntry {
            path: root.to_path_buf(),
            metadata,
            depth: 0,
        };
        visit(&entry)?;
        self.walk_below(&entry, visit)
    }

    fn walk_below(
        &self,
        parent: &WalkEntry,
        visit: &mut dyn FnMut(&WalkEntry) -> Result<()>,
    ) -> Result<()> {
        if !parent.metadata.is_dir() {
            return Ok(());
        }
        if self.max_depth.is_some_and(|max| parent.depth >= max) {
            return Ok(());
        }

        let mut children = self.fs.read_dir(&parent.path, None)?;
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children {
            let path = parent.path.join(&child.name);
            // Stat through the composed filesystem rather than trusting the
            // listing: this is where a container file turns into a
            // traversable directory.
            let metadata = self.fs.metadata(&path)?;
            let entry = WalkEntry {
                path,
                metadata,
                depth: parent.depth + 1,
            };
            visit(&entry)?;
            self.walk_below(&entry, visit)?;
        }
        Ok(())
    }
}
