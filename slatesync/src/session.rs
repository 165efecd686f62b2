use tracing::debug;

use slatesync_core::{DeviceClient, DeviceError};

use crate::ssh::SshChannel;

/// One attached device: detected once, borrowed by every operation,
/// ejected at the end. Nothing about the device lives in process-global
/// state.
pub struct DeviceSession {
    address: String,
    client: DeviceClient,
    channel: SshChannel,
    endpoint_reachable: bool,
}

impl DeviceSession {
    pub async fn detect(address: &str, ssh_user: &str) -> Result<Self, DeviceError> {
        let client = DeviceClient::new(address)?;
        let endpoint_reachable = client.check_connection().await;
        debug!(%address, reachable = endpoint_reachable, "device probed");
        Ok(Self {
            address: address.to_string(),
            client,
            channel: SshChannel::new(ssh_user, address),
            endpoint_reachable,
        })
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    pub fn channel(&self) -> &SshChannel {
        &self.channel
    }

    /// Answered by the probe taken at detection time.
    pub fn endpoint_reachable(&self) -> bool {
        self.endpoint_reachable
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn eject(self) {
        debug!(address = %self.address, "device session closed");
    }
}
