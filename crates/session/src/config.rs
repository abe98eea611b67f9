use crate::error::{Result, SessionError};

pub const DEFAULT_SERVICE_TYPE: &str = "peerlog-share";
pub const DEFAULT_LAN_PORT: u16 = 7656;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const MAX_SERVICE_TYPE_LEN: usize = 15;
pub const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Settings for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name other peers see. Must be unique within the service namespace.
    pub display_name: String,
    /// Namespace shared by peers that should find each other.
    pub service_type: String,
    /// Capacity of the broadcast channel backing `subscribe()`.
    pub event_capacity: usize,
    pub max_payload_size: usize,
    /// TCP port used by the LAN transport.
    pub lan_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "peerlog".to_string(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            event_capacity: 256,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            lan_port: DEFAULT_LAN_PORT,
        }
    }
}

impl SessionConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_lan_port(mut self, port: u16) -> Self {
        self.lan_port = port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_service_type(&self.service_type)?;

        let name_len = self.display_name.chars().count();
        if name_len == 0 || name_len > MAX_DISPLAY_NAME_LEN {
            return Err(SessionError::InvalidDisplayName(format!(
                "'{}' must be 1-{} characters",
                self.display_name, MAX_DISPLAY_NAME_LEN
            )));
        }

        if self.event_capacity == 0 {
            return Err(SessionError::Transport(
                "event capacity must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Service types are 1-15 characters of lowercase ASCII letters, digits
/// and hyphens, with no leading or trailing hyphen.
pub fn validate_service_type(service_type: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(SessionError::InvalidServiceType(format!(
            "'{}': {}",
            service_type, reason
        )))
    };

    if service_type.is_empty() || service_type.len() > MAX_SERVICE_TYPE_LEN {
        return invalid("must be 1-15 characters");
    }
    if !service_type
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return invalid("only lowercase letters, digits and hyphens are allowed");
    }
    if service_type.starts_with('-') || service_type.ends_with('-') {
        return invalid("cannot start or end with a hyphen");
    }

    Ok(())
}
