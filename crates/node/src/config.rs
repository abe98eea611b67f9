use std::path::PathBuf;

use peerlog_session::{SessionConfig, DEFAULT_SERVICE_TYPE, MAX_DISPLAY_NAME_LEN};

pub struct NodeConfig {
    pub name: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub service_type: String,
}

impl NodeConfig {
    pub fn new(
        name: Option<String>,
        port: u16,
        data_dir: Option<String>,
        service_type: Option<String>,
    ) -> Self {
        let name = name.unwrap_or_else(|| {
            std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .ok()
                .map(|host| name_from_host(host.trim()))
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("peer-{}", &uuid::Uuid::new_v4().to_string()[..8]))
        });

        let data_dir = data_dir.map(PathBuf::from).unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "peerlog", "peerlogd")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".peerlog"))
        });

        Self {
            name,
            port,
            data_dir,
            service_type: service_type.unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig::new(self.name.clone())
            .with_service_type(self.service_type.clone())
            .with_lan_port(self.port)
    }

    /// Payloads received while hosting.
    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("commits")
    }
}

/// Host names may exceed the display name limit; pass `--name` to pick another.
fn name_from_host(host: &str) -> String {
    host.chars().take(MAX_DISPLAY_NAME_LEN).collect()
}
