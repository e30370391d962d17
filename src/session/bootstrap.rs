//! Session bootstrap: credentials + transport -> connected session.
//!
//! establish(config) = auth::resolve_from_env + transport::select + connect
//!
//! Everything that can fail locally (credentials, transport name) fails before any
//! network action. The returned session is always connected.
//!
use tracing::{debug, info_span, Instrument};

use super::auth::{self, AuthMode};
use super::transport::{self, Transport, TransportOptions};
use super::Session;
use crate::config::Config;
use crate::error::Result;

/// Connect a session over `transport`, blocking until the hub accepted it.
pub async fn connect(auth: &AuthMode, transport: Transport) -> Result<Box<dyn Session>> {
    let kind = transport.kind();
    let session = transport
        .connect(auth)
        .instrument(info_span!("connect", transport = %kind))
        .await?;
    debug!(transport = %kind, "session ready");
    Ok(session)
}

/// Resolve authentication and transport from `config`, then connect.
pub async fn establish(config: &Config) -> Result<Box<dyn Session>> {
    let auth = auth::resolve_from_env(&config.auth)?;
    debug!(?auth, "resolved authentication");
    let transport = transport::select(
        &config.transport,
        &TransportOptions {
            ca_file: config.ca_file.clone(),
        },
    )?;
    connect(&auth, transport).await
}
