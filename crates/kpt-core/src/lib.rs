//! kpt core - resource model and package primitives
//!
//! This crate provides the foundational types shared by the engine, the
//! repository layer and the CLI:
//! - `Resource`: a YAML document with its comments and source text
//! - `Package`: a directory tree rooted at a `Kptfile`
//! - `Kptfile`: the package manifest and its function pipeline
//! - `PackageWriter`: writes resources back to their files
//! - `three_way_merge`: reconciles original, local and updated resources
//! - `KptError`: operation-scoped error wrapper

pub mod comments;
pub mod document;
pub mod emit;
pub mod error;
pub mod format;
pub mod kptfile;
pub mod merge;
pub mod package;
pub mod resource;
pub mod resource_list;
pub mod writer;

pub use comments::{CommentMap, NodeComments, ScalarStyle};
pub use document::parse_documents;
pub use error::{BoxError, Class, Classify, CoreError, KptError, Result, find_in_chain};
pub use kptfile::{
    Function, GitLock, GitUpstream, KPTFILE_NAME, Kptfile, KptfileDocument, OciLock, OciUpstream,
    OriginType, Pipeline, Selector, UpdateStrategy, Upstream, UpstreamLock, normalize_image,
};
pub use merge::{Conflict, ConflictKind, ConflictSubject, MergeResult, merge_file, three_way_merge};
pub use package::{Package, PackageContents, PackageTree, clean_relative_path};
pub use resource::{FieldPath, PathSegment, Resource, ResourceId};
pub use resource_list::{ResourceList, ResultItem, Severity};
pub use writer::{PackageWriter, WriteSummary, render_file, write_atomic, write_unwrapped};
