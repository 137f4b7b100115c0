//! Devices command - show what the broker currently offers

use std::sync::Arc;

use anyhow::{Context, Result};
use sss3_broker::{ControlChannel, REGISTER_PATH};
use sss3_core::{IdentityProvider, StaticIdentity, TypedSchemaValidator};
use sss3_session::ClientConfig;
use sss3_transport::Reactor;

use crate::output::OutputContext;

/// Register, list the available devices and deregister again
pub fn devices(config: &ClientConfig, ctx: &OutputContext) -> Result<()> {
    let reactor = Arc::new(Reactor::new().context("Failed to create reactor")?);
    let mut channel =
        ControlChannel::new(config.channel(), reactor, Arc::new(TypedSchemaValidator));
    let identity = StaticIdentity::new(config.mac.clone()).identity();

    channel
        .connect()
        .with_context(|| format!("Could not connect to broker at {}", config.broker))?;

    let listed = channel
        .register(&identity)
        .context("Registration failed")
        .and_then(|()| channel.list_devices().context("Failed to list devices"));

    // Deregister even when listing failed
    channel.send_teardown(REGISTER_PATH, true);

    let devices = listed?;
    if devices.is_empty() {
        ctx.warn("Unfortunately, there are no available ECUs right now. Please check back later.");
    }
    ctx.print_devices(&devices);
    Ok(())
}
