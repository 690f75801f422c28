//! `update`: move a local package to a new upstream revision
//!
//! The original revision (from the lock) and the new one are fetched into a
//! workspace next to the package. The selected strategy builds the merged
//! tree there, the Kptfile gets the new upstream and lock, and the merged
//! tree is swapped into place. Nothing on disk changes before the swap.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use similar::TextDiff;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use kpt_core::package::relative_slash_path;
use kpt_core::{
    Conflict, ConflictKind, ConflictSubject, FieldPath, KPTFILE_NAME, KptError, Kptfile,
    KptfileDocument, OriginType, PackageTree, PackageWriter, Resource, UpdateStrategy, Upstream,
    UpstreamLock, merge_file, three_way_merge,
};

use crate::cache::RepoCache;
use crate::error::{RepoError, Result};
use crate::fetcher::Fetcher;
use crate::fs::copy_dir;
use crate::oci::strip_tag;

pub const UPDATE_OP: &str = "update";

/// Kptfile fields owned by `get` and `update` rather than by the package
const MANAGED_FIELDS: [&str; 2] = ["upstream", "upstreamLock"];

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// New ref (git) or tag (OCI); the current one when unset
    pub git_ref: Option<String>,
    /// Overrides the strategy recorded in the Kptfile
    pub strategy: Option<UpdateStrategy>,
    /// Abort instead of writing a merge that has conflicts
    pub fail_on_conflict: bool,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ref(mut self, git_ref: Option<String>) -> Self {
        self.git_ref = git_ref;
        self
    }

    pub fn with_strategy(mut self, strategy: Option<UpdateStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fail_on_conflict(mut self, fail: bool) -> Self {
        self.fail_on_conflict = fail;
        self
    }
}

/// Outcome of a successful update
#[derive(Debug, Clone)]
pub struct UpdateSummary {
    pub strategy: UpdateStrategy,
    pub previous: Option<UpstreamLock>,
    pub lock: UpstreamLock,
    pub conflicts: Vec<Conflict>,
}

/// Split `PKG[@REF]`
pub fn split_package_ref(arg: &str) -> (PathBuf, Option<String>) {
    match arg.rsplit_once('@') {
        Some((pkg, git_ref)) if !git_ref.is_empty() && !git_ref.contains('/') => {
            let pkg = if pkg.is_empty() { "." } else { pkg };
            (PathBuf::from(pkg), Some(git_ref.to_string()))
        }
        _ => (PathBuf::from(arg), None),
    }
}

/// Update the package at `pkg_dir`
pub async fn update(
    pkg_dir: &Path,
    options: &UpdateOptions,
    cache: RepoCache,
    cancel: &CancellationToken,
) -> std::result::Result<UpdateSummary, KptError> {
    let scoped = |e: RepoError| KptError::from(e).op(UPDATE_OP).path(pkg_dir);

    let pkg_dir = std::fs::canonicalize(pkg_dir)
        .map_err(RepoError::from)
        .map_err(scoped)?;
    let kptfile = Kptfile::load(&pkg_dir).map_err(RepoError::from).map_err(scoped)?;
    let upstream = kptfile.upstream.clone().ok_or_else(|| {
        scoped(RepoError::NoUpstream {
            path: pkg_dir.display().to_string(),
        })
    })?;
    let strategy = options
        .strategy
        .or(upstream.update_strategy)
        .unwrap_or_default();
    let target = retarget(&upstream, options.git_ref.as_deref(), strategy);
    let fetcher = Fetcher::from_upstream(&target, cache.clone()).map_err(scoped)?;
    fetcher.validate().map_err(scoped)?;
    let repo = fetcher.describe();

    let update = Update {
        pkg_dir: &pkg_dir,
        kptfile: &kptfile,
        target: &target,
        strategy,
        fail_on_conflict: options.fail_on_conflict,
        cache,
        cancel,
    };
    update
        .run(&fetcher)
        .await
        .map_err(|e| scoped(e).repo(repo))
}

struct Update<'a> {
    pkg_dir: &'a Path,
    kptfile: &'a Kptfile,
    target: &'a Upstream,
    strategy: UpdateStrategy,
    fail_on_conflict: bool,
    cache: RepoCache,
    cancel: &'a CancellationToken,
}

impl Update<'_> {
    async fn run(&self, fetcher: &Fetcher) -> Result<UpdateSummary> {
        let name = self.package_name();
        let parent = self.pkg_dir.parent().unwrap_or(self.pkg_dir);
        let workspace = tempfile::Builder::new()
            .prefix(&format!(".{}-update-", name))
            .tempdir_in(parent)?;
        let original_dir = workspace.path().join("original");
        let updated_dir = workspace.path().join("updated");
        let merged_dir = workspace.path().join("merged");
        std::fs::create_dir_all(&original_dir)?;
        std::fs::create_dir_all(&updated_dir)?;

        let lock = fetcher.fetch(self.cancel, &updated_dir).await?;
        let previous = self.kptfile.upstream_lock.clone();
        match &previous {
            Some(previous) => {
                Fetcher::at_lock(previous, self.cache.clone())?
                    .fetch(self.cancel, &original_dir)
                    .await?;
            }
            None => tracing::warn!(
                pkg = %self.pkg_dir.display(),
                "package has no upstream lock, every local file counts as a local change"
            ),
        }

        tracing::info!(
            pkg = %self.pkg_dir.display(),
            strategy = %self.strategy,
            upstream = %fetcher.describe(),
            "updating package"
        );
        let conflicts = match self.strategy {
            UpdateStrategy::ForceDeleteReplace => {
                copy_dir(&updated_dir, &merged_dir)?;
                Vec::new()
            }
            UpdateStrategy::FastForward => {
                let diff = local_changes(&original_dir, self.pkg_dir)?;
                if !diff.is_empty() {
                    return Err(RepoError::LocalDiverged {
                        path: self.pkg_dir.display().to_string(),
                        diff,
                    });
                }
                copy_dir(&updated_dir, &merged_dir)?;
                Vec::new()
            }
            UpdateStrategy::ResourceMerge => {
                merge_trees(&original_dir, self.pkg_dir, &updated_dir, &merged_dir, &name)?
            }
        };

        for conflict in &conflicts {
            tracing::warn!(pkg = %self.pkg_dir.display(), "conflict: {}", conflict);
        }
        if self.fail_on_conflict && !conflicts.is_empty() {
            return Err(RepoError::MergeConflict {
                path: self.pkg_dir.display().to_string(),
                count: conflicts.len(),
            });
        }

        std::fs::create_dir_all(&merged_dir)?;
        let mut doc = KptfileDocument::open_or_new(&merged_dir, &name)?;
        doc.set_name(&name)?;
        doc.set_upstream(self.target)?;
        doc.set_upstream_lock(&lock)?;
        doc.save()?;

        if self.cancel.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        swap_into_place(self.pkg_dir, &merged_dir, &workspace.path().join("previous"))?;

        Ok(UpdateSummary {
            strategy: self.strategy,
            previous,
            lock,
            conflicts,
        })
    }

    fn package_name(&self) -> String {
        if !self.kptfile.metadata.name.is_empty() {
            return self.kptfile.metadata.name.clone();
        }
        self.pkg_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string())
    }
}

/// Point the upstream at a new ref, keeping everything else
fn retarget(upstream: &Upstream, new_ref: Option<&str>, strategy: UpdateStrategy) -> Upstream {
    let mut target = upstream.clone();
    target.update_strategy = Some(strategy);
    let Some(new_ref) = new_ref else {
        return target;
    };
    match target.origin_type {
        OriginType::Git => {
            if let Some(git) = target.git.as_mut() {
                git.git_ref = new_ref.to_string();
            }
        }
        OriginType::Oci => {
            if let Some(oci) = target.oci.as_mut() {
                let name = oci.image.split('@').next().unwrap_or(&oci.image);
                oci.image = format!("{}:{}", strip_tag(name), new_ref);
            }
        }
    }
    target
}

/// Unified diff of the local package against the original revision
///
/// The root Kptfile is compared without its name and managed fields,
/// which `get` rewrites.
fn local_changes(original: &Path, local: &Path) -> Result<String> {
    let original_files = snapshot(original)?;
    let local_files = snapshot(local)?;

    let mut diff = String::new();
    let names: BTreeSet<&String> = original_files.keys().chain(local_files.keys()).collect();
    for rel in names {
        let before = original_files.get(rel).map(Vec::as_slice).unwrap_or_default();
        let after = local_files.get(rel).map(Vec::as_slice).unwrap_or_default();
        if before == after {
            continue;
        }
        diff.push_str(&unified_diff(rel, before, after));
    }

    let before = comparable_kptfile(original)?;
    let after = comparable_kptfile(local)?;
    if before != after {
        let before = serde_yaml::to_string(&before)?;
        let after = serde_yaml::to_string(&after)?;
        diff.push_str(&unified_diff(KPTFILE_NAME, before.as_bytes(), after.as_bytes()));
    }
    Ok(diff)
}

/// Files below `dir` except `.git` and the root Kptfile
fn snapshot(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = relative_slash_path(dir, entry.path());
        if rel == KPTFILE_NAME {
            continue;
        }
        files.insert(rel, std::fs::read(entry.path())?);
    }
    Ok(files)
}

fn comparable_kptfile(dir: &Path) -> Result<serde_yaml::Value> {
    let path = dir.join(KPTFILE_NAME);
    if !path.is_file() {
        return Ok(serde_yaml::Value::Null);
    }
    let mut value: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(&path)?)?;
    if let Some(map) = value.as_mapping_mut() {
        for field in MANAGED_FIELDS {
            map.remove(field);
        }
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_mapping_mut()) {
            metadata.remove("name");
        }
    }
    Ok(value)
}

fn unified_diff(rel: &str, before: &[u8], after: &[u8]) -> String {
    let before = String::from_utf8_lossy(before);
    let after = String::from_utf8_lossy(after);
    TextDiff::from_lines(before.as_ref(), after.as_ref())
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", rel), &format!("b/{}", rel))
        .to_string()
}

/// Three-way merge of whole package trees into `merged`
///
/// Resources are merged per package so identities only need to be unique
/// within one package. Plain files keep the local copy when both sides
/// changed them.
fn merge_trees(
    original: &Path,
    local: &Path,
    updated: &Path,
    merged: &Path,
    name: &str,
) -> Result<Vec<Conflict>> {
    let mut original = PackageTree::read(original)?;
    let mut local = PackageTree::read(local)?;
    let mut updated = PackageTree::read(updated)?;
    prepare_root_kptfile(&mut original, name)?;
    prepare_root_kptfile(&mut local, name)?;
    prepare_root_kptfile(&mut updated, name)?;

    let mut groups: BTreeMap<String, [Vec<Resource>; 3]> = BTreeMap::new();
    for (slot, tree) in [&original, &local, &updated].into_iter().enumerate() {
        for resource in &tree.resources {
            let pkg = tree.package_of(resource.path().unwrap_or_default());
            groups.entry(pkg).or_default()[slot].push(resource.clone());
        }
    }

    let mut conflicts = Vec::new();
    let mut resources = Vec::new();
    for (pkg, [o, l, u]) in &groups {
        let result = three_way_merge(o, l, u);
        tracing::debug!(
            pkg = %pkg,
            resources = result.resources.len(),
            conflicts = result.conflicts.len(),
            "merged package"
        );
        conflicts.extend(result.conflicts);
        resources.extend(result.resources);
    }
    std::fs::create_dir_all(merged)?;
    PackageWriter::new(merged)
        .prune(false)
        .write(resources, &BTreeSet::new())?;

    let names: BTreeSet<&String> = original
        .files
        .keys()
        .chain(local.files.keys())
        .chain(updated.files.keys())
        .collect();
    for rel in names {
        let o = original.files.get(rel).map(Vec::as_slice);
        let l = local.files.get(rel).map(Vec::as_slice);
        let u = updated.files.get(rel).map(Vec::as_slice);
        let (keep, conflicted) = merge_file(o, l, u);
        if conflicted {
            let kind = match (l, u) {
                (None, _) => ConflictKind::DeletedLocally,
                (_, None) => ConflictKind::DeletedUpstream,
                _ => ConflictKind::FileModified,
            };
            conflicts.push(Conflict {
                subject: ConflictSubject::File(rel.clone()),
                field: FieldPath::root(),
                kind,
                local: None,
                updated: None,
            });
        }
        if let Some(bytes) = keep {
            let target = merged.join(rel);
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&target, bytes)?;
        }
    }
    Ok(conflicts)
}

/// Give the root Kptfile the local package name and drop the managed
/// fields, so the three versions match as one resource
fn prepare_root_kptfile(tree: &mut PackageTree, name: &str) -> Result<()> {
    let root = tree
        .resources
        .iter_mut()
        .find(|r| r.path() == Some(KPTFILE_NAME) && r.kind() == Some("Kptfile"));
    let Some(kptfile) = root else {
        return Ok(());
    };
    if kptfile.name() != Some(name) {
        kptfile.set_field(&FieldPath::fields(["metadata", "name"]), name.into())?;
    }
    for field in MANAGED_FIELDS {
        kptfile.remove_field(&FieldPath::fields([field]));
    }
    Ok(())
}

/// Replace `pkg_dir` with `merged`, moving the old tree to `previous`
///
/// A `.git` directory at the package root belongs to the enclosing
/// checkout and moves along with the new tree.
fn swap_into_place(pkg_dir: &Path, merged: &Path, previous: &Path) -> Result<()> {
    let git_dir = pkg_dir.join(".git");
    let carried = git_dir.symlink_metadata().is_ok();
    if carried {
        std::fs::rename(&git_dir, merged.join(".git"))?;
    }

    if let Err(e) = std::fs::rename(pkg_dir, previous) {
        if carried {
            let _ = std::fs::rename(merged.join(".git"), &git_dir);
        }
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(merged, pkg_dir) {
        let _ = std::fs::rename(previous, pkg_dir);
        if carried {
            let _ = std::fs::rename(merged.join(".git"), &git_dir);
        }
        return Err(e.into());
    }
    tracing::debug!(pkg = %pkg_dir.display(), "swapped updated package into place");
    Ok(())
}
