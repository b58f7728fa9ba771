//! Thin wrapper around systemd sd_notify integration.
//!
//! All methods are no-ops when disabled or on non-Linux platforms, keeping
//! the rest of the codebase free from `#[cfg]` conditionals.

#[derive(Debug, Clone, Copy)]
pub struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Send `READY=1` (startup complete, playback loop entered).
    pub fn notify_ready(&self) {
        if self.enabled {
            self.send_ready();
        }
    }

    /// Send `STOPPING=1` (shutdown sequence started).
    pub fn notify_stopping(&self) {
        if self.enabled {
            self.send_stopping();
        }
    }

    /// Send `STATUS=<msg>` (human-readable playback status).
    pub fn notify_status(&self, msg: &str) {
        if self.enabled {
            self.send_status(msg);
        }
    }

    /// Send `WATCHDOG=1` (keepalive, fired from the supervisor tick).
    pub fn notify_watchdog(&self) {
        if self.enabled {
            self.send_watchdog();
        }
    }

    #[cfg(target_os = "linux")]
    fn send_ready(&self) {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            tracing::debug!(error = %e, "sd_notify READY failed");
        }
    }

    #[cfg(target_os = "linux")]
    fn send_stopping(&self) {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
            tracing::debug!(error = %e, "sd_notify STOPPING failed");
        }
    }

    #[cfg(target_os = "linux")]
    fn send_status(&self, msg: &str) {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Status(msg)]) {
            tracing::debug!(error = %e, "sd_notify STATUS failed");
        }
    }

    #[cfg(target_os = "linux")]
    fn send_watchdog(&self) {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
            tracing::debug!(error = %e, "sd_notify WATCHDOG failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send_ready(&self) {}
    #[cfg(not(target_os = "linux"))]
    fn send_stopping(&self) {}
    #[cfg(not(target_os = "linux"))]
    fn send_status(&self, _msg: &str) {}
    #[cfg(not(target_os = "linux"))]
    fn send_watchdog(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notifier_is_inert() {
        let notifier = SystemdNotifier::new(false);
        notifier.notify_ready();
        notifier.notify_status("playing");
        notifier.notify_watchdog();
        notifier.notify_stopping();
    }
}
