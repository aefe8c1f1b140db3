//! Node configuration.
//!
//! Every field has a default so a partial (or missing) `config.toml` still
//! yields a runnable node. The numeric limits mirror the reference deployment
//! but are deployment policy, not protocol.

use crate::error::WaypostError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// A service role a listener can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Unencrypted port for unauthenticated single requests (ping, role listing).
    Primary,
    /// Encrypted port for clients that are not hosted here.
    ClientNonCustomer,
    /// Encrypted port for hosted identities checking in.
    ClientCustomer,
    /// Encrypted port for relay channels between two application services.
    ClientAppService,
}

impl ServerRole {
    /// All roles, in reporting order.
    pub const ALL: [ServerRole; 4] = [
        ServerRole::Primary,
        ServerRole::ClientNonCustomer,
        ServerRole::ClientCustomer,
        ServerRole::ClientAppService,
    ];

    /// Whether connections for this role must be TLS encrypted.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, ServerRole::Primary)
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Primary => write!(f, "primary"),
            ServerRole::ClientNonCustomer => write!(f, "client_non_customer"),
            ServerRole::ClientCustomer => write!(f, "client_customer"),
            ServerRole::ClientAppService => write!(f, "client_app_service"),
        }
    }
}

/// One listening socket and the roles it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// TCP port. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Roles served on this port. All must share the same encryption requirement.
    pub roles: Vec<ServerRole>,
}

/// Where the node's long-term identity key lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to a file holding the hex-encoded 32-byte Ed25519 seed.
    /// When unset, an ephemeral key is generated at boot.
    pub key_path: Option<PathBuf>,
}

/// TLS material for the encrypted roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM private key.
    pub key_path: Option<PathBuf>,
}

/// Connection and relay limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Seconds a connection may stay silent (or in TLS handshake) before it is closed.
    pub idle_timeout_secs: u64,
    /// Maximum total frame size, header included.
    pub max_frame_size: usize,
    /// Unacknowledged relay messages allowed per direction of a pairing.
    pub max_outstanding_relay_messages: usize,
    /// Application service names a checked-in identity may register.
    pub max_application_services: usize,
    /// Maximum UTF-8 length of one application service name.
    pub max_application_service_name_bytes: usize,
    /// Seconds the callee has to accept or reject an incoming call.
    pub incoming_call_timeout_secs: u64,
    /// Seconds both sides have to bind their relay tokens after the callee accepts.
    pub relay_bind_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 180,
            max_frame_size: 1_048_576,
            max_outstanding_relay_messages: 20,
            max_application_services: 20,
            max_application_service_name_bytes: 32,
            incoming_call_timeout_secs: 10,
            relay_bind_timeout_secs: 30,
        }
    }
}

/// Profile search ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    /// Page size ceiling when thumbnails are included.
    pub max_response_records_with_thumbnails: u32,
    /// Page size ceiling without thumbnails.
    pub max_response_records: u32,
    /// Retained result ceiling when thumbnails are included.
    pub max_total_records_with_thumbnails: u32,
    /// Absolute retained result ceiling.
    pub max_total_records: u32,
    /// Maximum UTF-8 length of the type filter.
    pub max_type_bytes: usize,
    /// Maximum UTF-8 length of the name filter.
    pub max_name_bytes: usize,
    /// Maximum UTF-8 length of the extra data pattern.
    pub max_extra_data_bytes: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_response_records_with_thumbnails: 100,
            max_response_records: 1000,
            max_total_records_with_thumbnails: 1000,
            max_total_records: 10_000,
            max_type_bytes: 64,
            max_name_bytes: 64,
            max_extra_data_bytes: 256,
        }
    }
}

/// Hosting agreement limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    /// Identities this node agrees to host.
    pub max_hosted_identities: usize,
    /// Maximum profile thumbnail size in bytes.
    pub max_thumbnail_bytes: usize,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            max_hosted_identities: 10_000,
            max_thumbnail_bytes: 5 * 1024,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Interface the listeners bind to.
    pub listen_host: String,
    /// Listening sockets.
    pub listeners: Vec<ListenerConfig>,
    /// Node identity key.
    pub identity: IdentityConfig,
    /// TLS certificate and key.
    pub tls: TlsConfig,
    /// Connection and relay limits.
    pub limits: LimitsConfig,
    /// Search ceilings.
    pub search: SearchLimits,
    /// Hosting limits.
    pub hosting: HostingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listeners: vec![
                ListenerConfig {
                    port: 16987,
                    roles: vec![ServerRole::Primary],
                },
                ListenerConfig {
                    port: 16988,
                    roles: vec![
                        ServerRole::ClientNonCustomer,
                        ServerRole::ClientCustomer,
                        ServerRole::ClientAppService,
                    ],
                },
            ],
            identity: IdentityConfig::default(),
            tls: TlsConfig::default(),
            limits: LimitsConfig::default(),
            search: SearchLimits::default(),
            hosting: HostingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check the listener layout.
    ///
    /// Each listener needs at least one role, its roles must agree on
    /// encryption, a role may be served by one listener only, and a fixed port
    /// may not be declared twice.
    pub fn validate_listeners(&self) -> Result<(), WaypostError> {
        if self.listeners.is_empty() {
            return Err(WaypostError::Config("no listeners configured".into()));
        }

        let mut seen_roles = HashSet::new();
        let mut seen_ports = HashSet::new();
        for listener in &self.listeners {
            let Some(first) = listener.roles.first() else {
                return Err(WaypostError::Config(format!(
                    "listener on port {} has no roles",
                    listener.port
                )));
            };
            if listener
                .roles
                .iter()
                .any(|r| r.is_encrypted() != first.is_encrypted())
            {
                return Err(WaypostError::Config(format!(
                    "listener on port {} mixes encrypted and unencrypted roles",
                    listener.port
                )));
            }
            for role in &listener.roles {
                if !seen_roles.insert(*role) {
                    return Err(WaypostError::Config(format!(
                        "role {role} is assigned to more than one listener"
                    )));
                }
            }
            if listener.port != 0 && !seen_ports.insert(listener.port) {
                return Err(WaypostError::Config(format!(
                    "port {} is declared by more than one listener",
                    listener.port
                )));
            }
        }
        Ok(())
    }

    /// Whether any listener needs TLS.
    pub fn needs_tls(&self) -> bool {
        self.listeners
            .iter()
            .flat_map(|l| l.roles.iter())
            .any(|r| r.is_encrypted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate_listeners().is_ok());
        assert!(config.needs_tls());
        assert_eq!(config.limits.idle_timeout_secs, 180);
        assert_eq!(config.search.max_total_records, 10_000);
    }

    #[test]
    fn test_mixed_encryption_rejected() {
        let config = NodeConfig {
            listeners: vec![ListenerConfig {
                port: 9000,
                roles: vec![ServerRole::Primary, ServerRole::ClientCustomer],
            }],
            ..Default::default()
        };
        let err = config.validate_listeners().unwrap_err();
        assert!(err.to_string().contains("mixes"));
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let config = NodeConfig {
            listeners: vec![
                ListenerConfig {
                    port: 9000,
                    roles: vec![ServerRole::ClientCustomer],
                },
                ListenerConfig {
                    port: 9001,
                    roles: vec![ServerRole::ClientCustomer],
                },
            ],
            ..Default::default()
        };
        assert!(config.validate_listeners().is_err());
    }

    #[test]
    fn test_duplicate_fixed_port_rejected_but_ephemeral_allowed() {
        let dup = NodeConfig {
            listeners: vec![
                ListenerConfig {
                    port: 9000,
                    roles: vec![ServerRole::Primary],
                },
                ListenerConfig {
                    port: 9000,
                    roles: vec![ServerRole::ClientCustomer],
                },
            ],
            ..Default::default()
        };
        assert!(dup.validate_listeners().is_err());

        let ephemeral = NodeConfig {
            listeners: vec![
                ListenerConfig {
                    port: 0,
                    roles: vec![ServerRole::Primary],
                },
                ListenerConfig {
                    port: 0,
                    roles: vec![ServerRole::ClientCustomer],
                },
            ],
            ..Default::default()
        };
        assert!(ephemeral.validate_listeners().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            log_level = "debug"

            [limits]
            max_outstanding_relay_messages = 5

            [[listeners]]
            port = 7000
            roles = ["primary"]
        "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.limits.max_outstanding_relay_messages, 5);
        assert_eq!(config.limits.max_frame_size, 1_048_576);
        assert_eq!(config.listeners.len(), 1);
        assert!(!config.needs_tls());
    }
}
