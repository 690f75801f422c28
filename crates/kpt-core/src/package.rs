//! Package discovery and reading

use glob::{MatchOptions, Pattern};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::document::parse_documents;
use crate::error::{CoreError, Result};
use crate::kptfile::{KPTFILE_NAME, Kptfile};
use crate::resource::Resource;

/// File listing patterns excluded from a package
pub const KRMIGNORE_NAME: &str = ".krmignore";

/// A package root: a directory holding a Kptfile
#[derive(Debug, Clone)]
pub struct Package {
    /// Absolute path as discovered
    path: PathBuf,
    /// Canonical path, used to recognize the same package reached twice
    unique_path: PathBuf,
    kptfile: Kptfile,
}

/// What a package directory holds, excluding its subpackages' contents
#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    /// Resource files, relative and `/`-separated, sorted
    pub files: Vec<String>,
    /// Direct subpackage directories, absolute, sorted
    pub subpackages: Vec<PathBuf>,
}

impl Package {
    /// Open the package rooted at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = lexical_clean(&std::path::absolute(path.as_ref())?);
        if !path.is_dir() {
            return Err(CoreError::ManifestNotFound {
                path: path.display().to_string(),
            });
        }
        let kptfile = Kptfile::load(&path)?;
        let unique_path = std::fs::canonicalize(&path)?;

        Ok(Self {
            path,
            unique_path,
            kptfile,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unique_path(&self) -> &Path {
        &self.unique_path
    }

    pub fn kptfile(&self) -> &Kptfile {
        &self.kptfile
    }

    pub fn name(&self) -> &str {
        &self.kptfile.metadata.name
    }

    /// List resource files and direct subpackages
    ///
    /// Hidden entries and `.krmignore` matches are skipped. A child directory
    /// holding a Kptfile is a subpackage and is not descended into; this also
    /// applies to symlinked directories, other symlinked directories are
    /// ignored.
    pub fn contents(&self) -> Result<PackageContents> {
        let ignore = IgnoreRules::load(&self.path)?;
        let mut contents = PackageContents::default();

        let mut walker = WalkDir::new(&self.path).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = relative_slash_path(&self.path, entry.path());
            let name = entry.file_name().to_string_lossy();
            let real_dir = entry.file_type().is_dir();
            let is_dir = real_dir || (entry.path_is_symlink() && entry.path().is_dir());

            if name.starts_with('.') || ignore.is_ignored(&rel, is_dir) {
                if real_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            if is_dir {
                if entry.path().join(KPTFILE_NAME).is_file() {
                    contents.subpackages.push(entry.path().to_path_buf());
                    if real_dir {
                        walker.skip_current_dir();
                    }
                }
                continue;
            }

            if is_resource_file(&name) {
                contents.files.push(rel);
            }
        }

        contents.subpackages.sort();
        Ok(contents)
    }

    pub fn subpackages(&self) -> Result<Vec<PathBuf>> {
        Ok(self.contents()?.subpackages)
    }

    /// Read the package's own resources (the Kptfile included), each
    /// annotated with its path and index
    pub fn read_resources(&self) -> Result<Vec<Resource>> {
        let contents = self.contents()?;
        let mut resources = Vec::new();
        for file in &contents.files {
            resources.extend(read_resource_file(&self.path, file)?);
        }
        tracing::debug!(pkg = %self.path.display(), count = resources.len(), "read package resources");
        Ok(resources)
    }
}

/// Parse one package file, requiring every document to be a resource
pub fn read_resource_file(root: &Path, rel: &str) -> Result<Vec<Resource>> {
    let content = std::fs::read_to_string(root.join(rel))?;
    let mut resources = parse_documents(&content, rel)?;
    for (index, resource) in resources.iter_mut().enumerate() {
        if !resource.is_resource() {
            return Err(CoreError::InvalidResource {
                path: rel.to_string(),
                index,
                message: "missing apiVersion or kind".to_string(),
            });
        }
        resource.set_path_index(rel, index)?;
    }
    Ok(resources)
}

fn is_resource_file(name: &str) -> bool {
    name == KPTFILE_NAME || name.ends_with(".yaml") || name.ends_with(".yml")
}

/// `.krmignore` patterns of a package
#[derive(Debug, Default)]
struct IgnoreRules {
    patterns: Vec<(Pattern, bool, bool)>,
}

impl IgnoreRules {
    fn load(root: &Path) -> Result<Self> {
        let path = root.join(KRMIGNORE_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut patterns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let dir_only = line.ends_with('/');
            let line = line.trim_end_matches('/');
            let anchored = line.contains('/');
            let pattern = Pattern::new(line.trim_start_matches('/'))?;
            patterns.push((pattern, dir_only, anchored));
        }
        Ok(Self { patterns })
    }

    fn is_ignored(&self, rel: &str, is_dir: bool) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..Default::default()
        };
        let base = rel.rsplit('/').next().unwrap_or(rel);
        self.patterns.iter().any(|(pattern, dir_only, anchored)| {
            if *dir_only && !is_dir {
                return false;
            }
            if *anchored {
                pattern.matches_with(rel, options)
            } else {
                pattern.matches_with(base, options)
            }
        })
    }
}

/// Every file below a directory, split into resource files and plain files
///
/// Used when a whole package tree (subpackages included) is compared as a
/// unit. A YAML file whose documents are not all resources counts as a
/// plain file.
#[derive(Debug, Clone, Default)]
pub struct PackageTree {
    /// Resources with paths relative to the tree root
    pub resources: Vec<Resource>,
    /// Other files by relative path
    pub files: BTreeMap<String, Vec<u8>>,
    /// Relative directories holding a Kptfile (`""` for the root)
    pub packages: BTreeSet<String>,
}

impl PackageTree {
    pub fn read(root: &Path) -> Result<Self> {
        let mut tree = PackageTree::default();
        if !root.exists() {
            return Ok(tree);
        }

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() && !entry.path_is_symlink() {
                continue;
            }
            if entry.path().is_dir() {
                continue;
            }
            let rel = relative_slash_path(root, entry.path());
            let name = entry.file_name().to_string_lossy();

            if name == KPTFILE_NAME {
                let dir = rel.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                tree.packages.insert(dir.to_string());
            }

            let bytes = std::fs::read(entry.path())?;
            if is_resource_file(&name) {
                if let Some(resources) = parse_resources_leniently(&bytes, &rel) {
                    tree.resources.extend(resources);
                    continue;
                }
            }
            tree.files.insert(rel, bytes);
        }
        Ok(tree)
    }

    /// Directory of the innermost package holding `rel`
    pub fn package_of(&self, rel: &str) -> String {
        let mut dir = rel.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        loop {
            if self.packages.contains(dir) || dir.is_empty() {
                return dir.to_string();
            }
            dir = dir.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        }
    }
}

fn parse_resources_leniently(bytes: &[u8], rel: &str) -> Option<Vec<Resource>> {
    let content = std::str::from_utf8(bytes).ok()?;
    let mut resources = parse_documents(content, rel).ok()?;
    if resources.is_empty() || !resources.iter().all(Resource::is_resource) {
        return None;
    }
    for (index, resource) in resources.iter_mut().enumerate() {
        resource.set_path_index(rel, index).ok()?;
    }
    Some(resources)
}

/// `path` relative to `base`, `/`-separated
pub fn relative_slash_path(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve `.` and `..` components without touching the filesystem
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    clean.push("..");
                }
            }
            other => clean.push(other.as_os_str()),
        }
    }
    clean
}

/// Check that `path` is relative and stays inside its base directory,
/// returning it with `.` components removed
pub fn clean_relative_path(path: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(CoreError::InvalidPath {
                        path: path.to_string(),
                        message: "path escapes the package".to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CoreError::InvalidPath {
                    path: path.to_string(),
                    message: "path must be relative".to_string(),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(CoreError::InvalidPath {
            path: path.to_string(),
            message: "path is empty".to_string(),
        });
    }
    Ok(clean)
}
