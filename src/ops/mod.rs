//! Default collaborators: git and npm child processes, esbuild, GitHub.

pub mod esbuild;
pub mod git;
pub mod heads;
pub mod runner;

pub use esbuild::EsbuildTransformer;
pub use git::{FileCatalog, GitInspector};
pub use heads::{GithubHeads, LsRemoteHeads};
pub use runner::CommandRunner;
