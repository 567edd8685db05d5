//! Foreground-UI request from the wearable: run the configured command, if any.

use tracing::{debug, info};

pub struct Launcher {
    command: Option<String>,
}

impl Launcher {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }

    /// Spawn the UI command without waiting for it. Returns false when none is configured.
    pub fn launch(&self) -> std::io::Result<bool> {
        let Some(cmd) = &self.command else {
            debug!("UI launch requested, no ui_command configured");
            return Ok(false);
        };
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(false)
            .spawn()?;
        info!(pid = child.id(), command = %cmd, "launched UI");
        Ok(true)
    }
}
