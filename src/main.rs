use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use kuberender::cli::{ExecArg, TemplateArg};
use kuberender::error::Result;
use kuberender::k8s::client::KubeClusterClient;
use kuberender::run;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Template to render, of the format "/path/to/template.tmpl:/path/to/rendered.conf".
    /// "-" as the target means stdout
    #[arg(short, long)]
    template: String,

    /// Path to a kubeconfig file. Defaults to $KUBECONFIG, ~/.kube/config or
    /// the in-cluster configuration
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Command to run and restart after each successful render
    #[arg(short, long)]
    exec: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                // --help and --version land here
                ExitCode::SUCCESS
            };
        }
    };
    match try_main(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(args: Args) -> Result<()> {
    let template = TemplateArg::from_flag(&args.template)?;
    let exec = args.exec.as_deref().map(ExecArg::parse).transpose()?;
    let client = KubeClusterClient::from_kubeconfig(args.kubeconfig.as_deref()).await?;
    run::run(Arc::new(client), template, exec).await
}
