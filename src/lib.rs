//! # getrel Core Library
//!
//! This crate contains the core logic of the `getrel` tool – an installer for binaries published as
//! GitHub release assets that remembers every file it put on disk.
//!
//! A project is configured with a repository, a release rule (`latest`, `pre` or a tag pattern), glob
//! rules that pick the release's assets and what to do with them (`unpack`, `bin`, `link`, `delete`,
//! `record`), and install rules applied to the files those actions produce. Everything installed is
//! registered, so `uninstall` removes exactly that.
//!
//! This library is built for the `getrel` CLI, but you can also reuse it as a backend in other tools.
//!
//! ## Modules Overview
//! - [`config`] – Project configuration (`projects.toml`), action specs and rule tables
//! - [`fetch`] – Conditional, throttled HTTP fetching with `ETag`/`Last-Modified` caching
//! - [`release`] – Releases, assets and the rules that select them
//! - [`pattern`] – Glob patterns that identify one name among alternatives
//! - [`state`] – Per-project state and the installed-file registry
//! - [`archive`] – Content-sniffed tar / tar.gz / zip extraction
//! - [`installer`] – The install actions and the recursive install rules
//! - [`script`] – Post-install scripts
//! - [`project`] – update / download / install / uninstall of one project
//! - [`util`] – Shared utilities (paths, globbing, sizes)
//! - [`global`] – Global settings and directories
//! - [`error`] – Errors callers may want to tell apart

pub mod error;
pub mod util;
pub mod global;
pub mod config;
pub mod fetch;
pub mod release;
pub mod pattern;
pub mod state;
pub mod archive;
pub mod installer;
pub mod script;
pub mod project;

pub use error::*;
pub use config::*;
pub use fetch::{
    FetchCache, FetchOutcome, FetchTarget, Fetcher, HttpClient, HttpResponse, ReqwestClient,
};
pub use release::{Asset, AssetDescriptor, Release};
pub use pattern::{identifying_pattern, unique_substrings};
pub use state::{InstalledFiles, InstalledRelease, ProjectState};
pub use installer::Installer;
pub use project::{Project, ProjectFile};
pub use global::settings::{Layout, Settings};
