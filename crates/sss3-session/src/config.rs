//! Client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sss3_broker::ChannelConfig;
use sss3_core::DEFAULT_MAC;
use sss3_transport::DataPlaneConfig;

/// Settings for one client process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker address as `host:port`
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Hardware identity presented to the broker
    #[serde(default = "default_mac")]
    pub mac: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on each control-channel response wait; `0` waits indefinitely
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Reactor poll slice while waiting for the setup push
    #[serde(default = "default_push_poll_interval_ms")]
    pub push_poll_interval_ms: u64,
    /// Overall wait for the setup push; waits indefinitely when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_timeout_ms: Option<u64>,
    #[serde(default)]
    pub data_plane: DataPlaneConfig,
}

fn default_broker() -> String {
    "localhost:80".to_string()
}

fn default_mac() -> String {
    DEFAULT_MAC.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_push_poll_interval_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            mac: default_mac(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            push_poll_interval_ms: default_push_poll_interval_ms(),
            setup_timeout_ms: None,
            data_plane: DataPlaneConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        match self.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn push_poll_interval(&self) -> Duration {
        Duration::from_millis(self.push_poll_interval_ms.max(1))
    }

    pub fn setup_timeout(&self) -> Option<Duration> {
        self.setup_timeout_ms.map(Duration::from_millis)
    }

    /// Control channel settings derived from this configuration
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            broker: self.broker.clone(),
            connect_timeout: self.connect_timeout(),
            response_timeout: self.response_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.broker, "localhost:80");
        assert_eq!(config.mac, DEFAULT_MAC);
        assert_eq!(config.response_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.setup_timeout(), None);
        assert_eq!(config.data_plane.receive_timeout_ms, 400);
        assert_eq!(config.data_plane.min_receive_timeout_ms, 40);
    }

    #[rstest]
    #[case(0, None)]
    #[case(1, Some(Duration::from_millis(1)))]
    #[case(2500, Some(Duration::from_millis(2500)))]
    fn test_response_timeout(#[case] ms: u64, #[case] expected: Option<Duration>) {
        let config = ClientConfig {
            response_timeout_ms: ms,
            ..Default::default()
        };
        assert_eq!(config.response_timeout(), expected);
        assert_eq!(config.channel().response_timeout, expected);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(20, 20)]
    fn test_push_poll_interval_never_zero(#[case] ms: u64, #[case] expected_ms: u64) {
        let config = ClientConfig {
            push_poll_interval_ms: ms,
            ..Default::default()
        };
        assert_eq!(config.push_poll_interval(), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_nested_data_plane_overrides() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"broker":"b:9","data_plane":{"receive_timeout_ms":200}}"#)
                .unwrap();
        assert_eq!(config.channel().broker, "b:9");
        assert_eq!(config.data_plane.receive_timeout_ms, 200);
        assert_eq!(config.data_plane.min_receive_timeout_ms, 40);
    }
}
