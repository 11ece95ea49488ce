use std::future::Future;

use log::info;
use port_blocker_common::PortValue;
use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::{
    config::Config,
    error::{Error, Result},
    kernel::{Collection, Kernel},
    orchestrator::{Attached, bootstrap},
};

/// SIGINT and SIGTERM listeners.
///
/// The handlers are registered on construction, so a signal arriving before
/// [`ShutdownSignal::recv`] is polled is kept and delivered then.
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(Error::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(Error::Signal)?,
        })
    }

    /// Wait for the first of SIGINT or SIGTERM and return its name.
    pub async fn recv(mut self) -> Result<&'static str> {
        tokio::select! {
            _ = self.interrupt.recv() => Ok("SIGINT"),
            _ = self.terminate.recv() => Ok("SIGTERM"),
        }
    }
}

/// Block until `shutdown` resolves, then release `attached`.
pub async fn hold_until<C, F>(attached: Attached<C>, shutdown: F) -> Result<()>
where
    C: Collection,
    F: Future<Output = Result<&'static str>>,
{
    info!(
        "{} is attached. Press Ctrl+C to detach and exit.",
        attached.program()
    );
    let waited = shutdown.await;
    match &waited {
        Ok(name) => info!("received {name}, detaching {}", attached.program()),
        Err(err) => info!("{}, detaching {}", err.report(), attached.program()),
    }
    let released = attached.release();
    waited?;
    released?;
    info!("detached and cleaned up");
    Ok(())
}

/// Bootstrap a program instance and keep it attached until `shutdown`.
pub async fn hold<K, F>(kernel: &mut K, cfg: &Config, port: PortValue, shutdown: F) -> Result<()>
where
    K: Kernel,
    F: Future<Output = Result<&'static str>>,
{
    let attached = bootstrap(kernel, cfg, port)?;
    info!("blocking port {port} on {}", cfg.interface);
    hold_until(attached, shutdown).await
}
