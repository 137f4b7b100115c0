//! Session setup information pushed by the broker

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{CoreError, CoreResult};

/// Raw session setup body: `{"IP": .., "CAN_PORT": .., "CARLA_PORT": ..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SessionInfo {
    /// Multicast group, dotted quad
    #[serde(rename = "IP")]
    #[validate(length(min = 7, max = 15))]
    pub ip: String,
    #[serde(rename = "CAN_PORT")]
    #[validate(range(min = 1, max = 65535))]
    pub can_port: u32,
    #[serde(rename = "CARLA_PORT")]
    #[validate(range(min = 1, max = 65535))]
    pub carla_port: u32,
}

/// Validated multicast parameters of an active session
///
/// A value of this type is always complete; "no session" is modelled as
/// `Option<SessionParameters>::None` by the holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionParameters {
    pub group: Ipv4Addr,
    pub can_port: u16,
    pub carla_port: u16,
}

impl SessionParameters {
    pub fn new(group: Ipv4Addr, can_port: u16, carla_port: u16) -> Self {
        Self {
            group,
            can_port,
            carla_port,
        }
    }

    /// Inbound endpoint (simulated CAN traffic)
    pub fn can_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.can_port)
    }

    /// Outbound endpoint (simulator control traffic)
    pub fn carla_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.carla_port)
    }
}

impl TryFrom<&SessionInfo> for SessionParameters {
    type Error = CoreError;

    fn try_from(info: &SessionInfo) -> CoreResult<Self> {
        let group = Ipv4Addr::from_str(info.ip.trim())
            .map_err(|e| CoreError::InvalidAddress(format!("{}: {}", info.ip, e)))?;
        let can_port = u16::try_from(info.can_port)
            .map_err(|_| CoreError::violation("session-info", "CAN_PORT out of range"))?;
        let carla_port = u16::try_from(info.carla_port)
            .map_err(|_| CoreError::violation("session-info", "CARLA_PORT out of range"))?;

        if !group.is_multicast() {
            tracing::warn!(%group, "Session group is not a multicast address");
        }

        Ok(Self::new(group, can_port, carla_port))
    }
}

impl std::fmt::Display for SessionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "group {} (CAN {}, CARLA {})",
            self.group, self.can_port, self.carla_port
        )
    }
}
