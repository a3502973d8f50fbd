//! Where packaged binaries come from
//!
//! The toolchain fetches four artifacts by name: the memfs, compiler and
//! linker modules and the sysroot image. A source only needs to hand back
//! their bytes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Supplier of named artifacts
pub trait ArtifactSource: Send + Sync {
    fn fetch(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Artifacts stored as files under one directory
#[derive(Debug, Clone)]
pub struct DirectoryArtifacts {
    root: PathBuf,
}

impl DirectoryArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactSource for DirectoryArtifacts {
    fn fetch(&self, name: &str) -> io::Result<Vec<u8>> {
        // artifact names are plain file names, never paths
        if name.is_empty() || name.contains(&['/', '\\'][..]) || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact name '{}'", name),
            ));
        }
        fs::read(self.root.join(name))
    }
}

/// Artifacts held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifacts {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.files.insert(name.to_string(), bytes.into());
    }
}

impl ArtifactSource for MemoryArtifacts {
    fn fetch(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files.get(name).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no artifact named '{}'", name))
        })
    }
}
