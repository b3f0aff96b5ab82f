//! Device identity and X.509 credentials

use crate::config::{ConfigError, CredentialsSection};
use std::fmt;
use std::path::Path;

/// Identity parsed from a hub connection string
///
/// Accepted form: `HostName=<hub>;DeviceId=<id>[;x509=true][;GatewayHostName=<gw>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub host_name: String,
    pub device_id: String,
    pub gateway_host_name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            gateway_host_name: None,
        }
    }

    /// Parse a connection string. Shared access key strings are rejected;
    /// this agent authenticates with its certificate only.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigError> {
        let mut host_name = None;
        let mut device_id = None;
        let mut gateway_host_name = None;
        let mut x509 = false;
        let mut has_shared_key = false;

        for segment in connection_string.split(';').map(str::trim) {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ConfigError::InvalidConnectionString(format!("segment without '=': {segment}"))
            })?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "GatewayHostName" => gateway_host_name = Some(value.to_string()),
                "x509" => x509 = value.eq_ignore_ascii_case("true"),
                "SharedAccessKey" | "SharedAccessKeyName" | "SharedAccessSignature" => {
                    has_shared_key = true
                }
                _ => {}
            }
        }

        if has_shared_key && !x509 {
            return Err(ConfigError::InvalidConnectionString(
                "shared access key authentication is not supported; use x509=true".to_string(),
            ));
        }

        let host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidConnectionString("missing HostName".to_string()))?;
        let device_id = device_id
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ConfigError::InvalidConnectionString("missing DeviceId".to_string()))?;

        Ok(Self {
            host_name,
            device_id,
            gateway_host_name,
        })
    }

    /// Host to open the socket against
    pub fn connect_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.host_name)
    }
}

/// PEM material for mutual TLS
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

impl Credential {
    /// Read certificate, key and CA from disk. Files are closed as soon as
    /// they are read.
    pub fn load(section: &CredentialsSection) -> Result<Self, ConfigError> {
        Ok(Self {
            cert_pem: read_pem(&section.cert_file)?,
            key_pem: read_pem(&section.key_file)?,
            ca_pem: read_pem(&section.ca_file)?,
        })
    }
}

// Key material stays out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"***")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .finish()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::CredentialRead {
        path: path.to_path_buf(),
        source,
    })?;

    if !String::from_utf8_lossy(&bytes).contains("-----BEGIN ") {
        return Err(ConfigError::InvalidConfig(format!(
            "{} is not PEM encoded",
            path.display()
        )));
    }

    Ok(bytes)
}
