use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
///
/// Valid edges:
///
/// ```text
/// INIT -> CONNECTING -> {QR_REQUIRED | PAIRING_REQUIRED} -> CONNECTING -> CONNECTED
/// CONNECTED -> CONNECTING     (transient close)
/// CONNECTED -> DISCONNECTED   (logged out)
/// INIT | CONNECTING | QR_REQUIRED | PAIRING_REQUIRED -> ERROR   (bring-up failure)
/// ```
///
/// A logged-out close observed before the socket ever opened is a failed
/// bring-up and lands in ERROR. When the socket opens while a QR or pairing
/// code is outstanding, the session steps through CONNECTING without
/// publishing it, so observers see QR_REQUIRED -> CONNECTED directly.
/// Re-entering the current status is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    Connecting,
    QrRequired,
    PairingRequired,
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::QrRequired => "QR_REQUIRED",
            Self::PairingRequired => "PAIRING_REQUIRED",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        }
    }

    /// Whether `self -> to` is one of the lifecycle edges.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Init, Connecting)
                | (Connecting, QrRequired | PairingRequired | Connected)
                | (QrRequired | PairingRequired, Connecting)
                | (Connected, Connecting)
                | (Connected, Disconnected)
                | (Init | Connecting | QrRequired | PairingRequired, Error)
        )
    }

    /// Validate a transition. Returns `Ok(false)` when `to` equals the
    /// current status, `Ok(true)` for a real edge.
    pub fn transition(self, to: SessionStatus) -> Result<bool, InvalidTransition> {
        if self == to {
            return Ok(false);
        }
        if self.can_transition_to(to) {
            Ok(true)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// Statuses that are re-attached automatically at startup.
    pub fn is_restorable(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Connecting | Self::PairingRequired
        )
    }

    /// No edge leaves a terminal status; the session must be recreated.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(Self::Init),
            "CONNECTING" => Ok(Self::Connecting),
            "QR_REQUIRED" => Ok(Self::QrRequired),
            "PAIRING_REQUIRED" => Ok(Self::PairingRequired),
            "CONNECTED" => Ok(Self::Connected),
            "DISCONNECTED" => Ok(Self::Disconnected),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}
