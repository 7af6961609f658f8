//! Re-emits child process output as tracing events.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{EventBus, EventChannel, LauncherEvent};
use crate::supervisor::OutputStream;

/// Spawn a task that logs every line on the `log` channel under the
/// `tether::child` target. The task ends when the bus is dropped.
pub fn spawn_log_sink(bus: &EventBus) -> JoinHandle<()> {
    let mut sub = bus.subscribe(EventChannel::Log);
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            let LauncherEvent::Log(line) = event else {
                continue;
            };
            match line.stream {
                OutputStream::Stdout => {
                    info!(target: "tether::child", role = %line.role, "{}", line.line)
                }
                OutputStream::Stderr => {
                    warn!(target: "tether::child", role = %line.role, "{}", line.line)
                }
            }
        }
    })
}
