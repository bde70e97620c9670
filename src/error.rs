use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("template flag format is wrong")]
    TemplateFlagFormat,

    #[error("source template {} does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("target file {} already exists", .0.display())]
    TargetExists(PathBuf),

    #[error("exec flag cannot be empty")]
    EmptyExec,

    #[error("source template is not a valid template file: {0}")]
    TemplateSyntax(#[source] minijinja::Error),

    #[error("error rendering template: {0}")]
    TemplateRender(#[source] minijinja::Error),

    #[error("failed to start watch for {key}: {source}")]
    WatchStart {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to refresh pods for {key}: {source}")]
    PodRefetch {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to start child process: {0}")]
    ChildSpawn(#[source] std::io::Error),

    #[error("failed to signal child process: {0}")]
    ChildSignal(#[source] nix::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error(transparent)]
    Infer(#[from] kube::config::InferConfigError),

    #[error(transparent)]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
