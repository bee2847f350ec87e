//! Data carried per instance by [`super::manager::ConnectionManager`].

/// Connection parameters created on first successful `connect`, retained
/// across disconnection to drive reconnection, and deleted only when a
/// reconnection sequence is permanently abandoned or on explicit removal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub private_key_path: String,
}
