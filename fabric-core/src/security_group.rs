//! Security-group materialization (§4.H): turns a controller-fetched
//! security group document into firewall rules on the tunnel interface.
//! Linux-only; a no-op (with a log-once warning) elsewhere or in userspace
//! mode.

use crate::controller::client::SecurityGroup;
use fabric_shared::AgentError;
use std::sync::atomic::{AtomicBool, Ordering};

static WARNED_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

pub struct SecurityGroupState {
    applied_id: Option<String>,
}

impl SecurityGroupState {
    pub fn new() -> Self {
        Self { applied_id: None }
    }

    /// Decides whether the materialized rules need to change. A mutation
    /// only to `revision` (the group's own change counter) is not
    /// considered a change in identity; callers pass the already-fetched
    /// group only when its id changed from the last sync.
    pub fn needs_sync(&self, security_group_id: Option<&str>) -> bool {
        self.applied_id.as_deref() != security_group_id
    }

    /// Applies (or clears) the firewall rules for `group` on `interface`.
    /// `None` clears any previously applied rules.
    pub fn apply(
        &mut self,
        interface: &wireguard_control::InterfaceName,
        group: Option<&SecurityGroup>,
        userspace_mode: bool,
    ) -> Result<(), AgentError> {
        if !cfg!(target_os = "linux") || userspace_mode {
            if !WARNED_UNSUPPORTED.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "security group enforcement is not supported on this platform/backend; skipping"
                );
            }
            return Ok(());
        }

        match group {
            Some(group) => {
                materialize_rules(interface, group)?;
                self.applied_id = Some(group.id.clone());
            },
            None => {
                clear_rules(interface)?;
                self.applied_id = None;
            },
        }
        Ok(())
    }
}

impl Default for SecurityGroupState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn materialize_rules(
    interface: &wireguard_control::InterfaceName,
    group: &SecurityGroup,
) -> Result<(), AgentError> {
    use std::process::Command;

    clear_rules(interface)?;
    for rule in group.inbound_rules.iter().chain(group.outbound_rules.iter()) {
        for range in &rule.ip_ranges {
            let mut args = vec![
                "-A".to_string(),
                "FORWARD".to_string(),
                "-i".to_string(),
                interface.to_string(),
                "-p".to_string(),
                rule.ip_protocol.clone(),
                "-s".to_string(),
                range.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ];
            if let Some(from) = rule.from_port {
                args.push("--dport".to_string());
                args.push(from.to_string());
            }
            let output = Command::new("iptables").args(&args).output().map_err(|e| {
                AgentError::DataPlane(format!("failed to invoke iptables: {e}"))
            })?;
            if !output.status.success() {
                return Err(AgentError::DataPlane(format!(
                    "iptables rule application failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn materialize_rules(
    _interface: &wireguard_control::InterfaceName,
    _group: &SecurityGroup,
) -> Result<(), AgentError> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn clear_rules(interface: &wireguard_control::InterfaceName) -> Result<(), AgentError> {
    use std::process::Command;
    // Best-effort: repeatedly delete the first matching FORWARD rule for
    // this interface until iptables reports none remain.
    loop {
        let output = Command::new("iptables")
            .args(["-D", "FORWARD", "-i", interface.as_str_lossy().as_ref()])
            .output()
            .map_err(|e| AgentError::DataPlane(format!("failed to invoke iptables: {e}")))?;
        if !output.status.success() {
            break;
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn clear_rules(_interface: &wireguard_control::InterfaceName) -> Result<(), AgentError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_sync_detects_group_change() {
        let state = SecurityGroupState::new();
        assert!(!state.needs_sync(None));
        assert!(state.needs_sync(Some("sg-1")));
    }
}
