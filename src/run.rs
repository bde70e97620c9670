//! The top-level render loop: priming render, change-tick handling, the
//! write debounce, and child restarts when an exec command is configured.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cli::{ExecArg, Target, TemplateArg};
use crate::error::Result;
use crate::k8s::client::ClusterClient;
use crate::manager::{Manager, ManagerEvents};
use crate::process::ProcessSupervisor;
use crate::render::{Rendered, Renderer};

/// Quiet period between the last successful render and the write to the
/// target. Independent of the manager's coalescing window.
pub const WRITE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Runs the watch-render-write loop until a fatal error or an interrupt.
///
/// # Errors
///
/// Will return `Err` for template syntax errors, fatal render or IO
/// failures, watch failures surfaced by the manager, and child lifecycle
/// failures.
pub async fn run(
    client: Arc<dyn ClusterClient>,
    template: TemplateArg,
    exec: Option<ExecArg>,
) -> Result<()> {
    let TemplateArg { source, mut target } = template;
    let (manager, events) = Manager::new(client);
    let renderer = Renderer::new(manager, source)?;

    // Priming render into a discard sink: validates the template against the
    // engine and fires every manager function it references, which starts
    // the watches. Not-ready is the expected cold-start outcome.
    match renderer.render()? {
        Rendered::Ready(_) => debug!("priming render completed"),
        Rendered::NotReady => debug!("priming render deferred, watches starting"),
    }

    let mut supervisor = exec.map(ProcessSupervisor::new);
    let outcome = render_loop(&renderer, &mut target, supervisor.as_mut(), events).await;
    let shutdown = match supervisor.as_mut() {
        Some(supervisor) => supervisor.shutdown().await,
        None => Ok(()),
    };
    outcome.and(shutdown)
}

async fn render_loop(
    renderer: &Renderer,
    target: &mut Target,
    mut supervisor: Option<&mut ProcessSupervisor>,
    mut events: ManagerEvents,
) -> Result<()> {
    let mut pending: Option<String> = None;
    let write_delay = sleep(WRITE_DEBOUNCE);
    tokio::pin!(write_delay);

    loop {
        tokio::select! {
            error = events.errors.recv() => {
                let Some(error) = error else {
                    return Ok(());
                };
                return Err(error);
            }
            tick = events.events.recv() => {
                if tick.is_none() {
                    info!("change feed closed, shutting down");
                    return Ok(());
                }
                debug!("change tick received, rendering");
                match renderer.render()? {
                    Rendered::NotReady => {
                        debug!("data not ready, skipping this cycle");
                        pending = None;
                    }
                    Rendered::Ready(output) => {
                        if let Some(supervisor) = supervisor.as_mut() {
                            target.replace(&output)?;
                            supervisor.restart().await?;
                        } else {
                            pending = Some(output);
                            write_delay.as_mut().reset(Instant::now() + WRITE_DEBOUNCE);
                        }
                    }
                }
            }
            () = &mut write_delay, if pending.is_some() => {
                if let Some(output) = pending.take() {
                    debug!(bytes = output.len(), "writing rendered output");
                    target.replace(&output)?;
                }
            }
            interrupt = tokio::signal::ctrl_c() => {
                interrupt?;
                info!("interrupt received, shutting down");
                return Ok(());
            }
        }
    }
}
