use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt::Display,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use thiserror::Error;
use walkdir::WalkDir;

/// File extension a source file must carry to be picked up by discovery.
pub const SCRIPT_EXTENSION: &str = "script";

/// A single script source: its logical name, where it came from, and its text.
///
/// The logical name is the path relative to the discovery root, with the
/// extension stripped and separators normalized to `/`. It identifies the
/// script in diagnostics and feeds the hash-based id rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub name: String,
    pub path: PathBuf,
    pub text: String,
}

impl ScriptSource {
    /// Builds an in-memory source, mostly useful for embedding and tests.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        let path = PathBuf::from(format!("{}.{}", name, SCRIPT_EXTENSION));
        Self {
            name,
            path,
            text: text.into(),
        }
    }

    fn read(base_dir: &Path, path: PathBuf) -> Result<Self, DiscoverError> {
        let text = std::fs::read_to_string(&path).map_err(|e| DiscoverError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self {
            name: logical_name(base_dir, &path),
            path,
            text,
        })
    }
}

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("{first} and {second} share the logical name {name:?}")]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

pub struct Loader {
    pub base_dir: PathBuf,
}

impl Loader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Walks `base_dir` and reads every `.script` file under it.
    ///
    /// Paths are sorted before reading so the returned set has a stable
    /// order no matter what the directory iteration order was.
    pub fn discover(&self) -> Result<Vec<ScriptSource>, DiscoverError> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.base_dir).follow_links(true) {
            let entry = entry.map_err(|e| DiscoverError::Walk {
                path: self.base_dir.clone(),
                source: e,
            })?;
            if entry.file_type().is_file()
                && entry.path().extension() == Some(OsStr::new(SCRIPT_EXTENSION))
            {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        let sources = paths
            .into_iter()
            .map(|path| ScriptSource::read(&self.base_dir, path))
            .collect::<Result<Vec<_>, _>>()?;
        check_unique_names(&sources)?;
        Ok(sources)
    }
}

/// Derives the logical name of `path` relative to `base_dir`.
pub fn logical_name(base_dir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base_dir).unwrap_or(path);
    rel.with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .join("/")
}

/// Rejects source sets in which two scripts share a logical name.
pub fn check_unique_names(sources: &[ScriptSource]) -> Result<(), DiscoverError> {
    let mut seen: BTreeMap<&str, &Path> = BTreeMap::new();
    for src in sources {
        if let Some(first) = seen.insert(&src.name, &src.path) {
            return Err(DiscoverError::DuplicateName {
                name: src.name.clone(),
                first: first.to_path_buf(),
                second: src.path.clone(),
            });
        }
    }
    Ok(())
}

/// A line/column position within one script, 1-based on both axes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Location {
    /// Resolves a byte offset in `text` to a line/column position.
    pub fn at(text: &str, offset: usize) -> Self {
        let offset = offset.min(text.len());
        let mut line = 1;
        let mut col = 1;
        for ch in text[..offset].chars() {
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        Self { line, col }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.line, self.col))
    }
}
