// Session event stream

use std::fmt;

/// Credential delivery milestones, in the order a successful run reports them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionPhase {
    /// Device stored the Wi-Fi configuration
    ConfigApplied,
    /// Device acknowledged the apply command
    ConfigSent,
    /// Device accepted the configuration for this session
    SessionContextReady,
    /// Device is associating with the access point
    Joining,
    /// Device joined the network
    Joined { ssid: String },
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionPhase::ConfigApplied => write!(f, "configuration applied"),
            ProvisionPhase::ConfigSent => write!(f, "configuration sent"),
            ProvisionPhase::SessionContextReady => write!(f, "session context ready"),
            ProvisionPhase::Joining => write!(f, "joining network"),
            ProvisionPhase::Joined { ssid } => write!(f, "joined {}", ssid),
        }
    }
}

/// Lifecycle notifications for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { device_id: String },
    Disconnected { device_id: String },
    ConnectionFailed { device_id: String, reason: String },
    Progress { device_id: String, phase: ProvisionPhase },
}

impl SessionEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SessionEvent::Connected { device_id }
            | SessionEvent::Disconnected { device_id }
            | SessionEvent::ConnectionFailed { device_id, .. }
            | SessionEvent::Progress { device_id, .. } => device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_accessor() {
        let event = SessionEvent::Progress {
            device_id: "AA:BB".into(),
            phase: ProvisionPhase::Joining,
        };
        assert_eq!(event.device_id(), "AA:BB");
    }

    #[test]
    fn test_phase_display() {
        let phase = ProvisionPhase::Joined { ssid: "Home".into() };
        assert_eq!(phase.to_string(), "joined Home");
    }
}
