//! Connection string parsing and shared access signatures.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use crate::session::SessionError;

type HmacSha256 = Hmac<Sha256>;

/// How long a generated token stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// `HostName=...;DeviceId=...;SharedAccessKey=...`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
    pub shared_access_key_name: Option<String>,
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .finish_non_exhaustive()
    }
}

impl FromStr for ConnectionString {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        let mut key_name = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys are base64 and may end in '='; split on the first one only.
            let (k, v) = part.split_once('=').ok_or_else(|| {
                SessionError::Credentials(format!("malformed connection string segment {part:?}"))
            })?;
            match k {
                "HostName" => host_name = Some(v.to_string()),
                "DeviceId" => device_id = Some(v.to_string()),
                "SharedAccessKey" => key = Some(v.to_string()),
                "SharedAccessKeyName" => key_name = Some(v.to_string()),
                _ => {}
            }
        }

        let require = |v: Option<String>, name: &str| {
            v.filter(|s| !s.is_empty()).ok_or_else(|| {
                SessionError::Credentials(format!("connection string is missing {name}"))
            })
        };
        Ok(ConnectionString {
            host_name: require(host_name, "HostName")?,
            device_id: require(device_id, "DeviceId")?,
            shared_access_key: require(key, "SharedAccessKey")?,
            shared_access_key_name: key_name,
        })
    }
}

impl ConnectionString {
    /// Token for this device, valid for `TOKEN_TTL` from now.
    pub fn token(&self) -> Result<String, SessionError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        sas_token(
            &format!("{}/devices/{}", self.host_name, self.device_id),
            &self.shared_access_key,
            self.shared_access_key_name.as_deref(),
            now + TOKEN_TTL.as_secs(),
        )
    }
}

fn encode(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Shared access signature for `resource`, expiring at `expiry` (unix seconds).
pub fn sas_token(
    resource: &str,
    key: &str,
    key_name: Option<&str>,
    expiry: u64,
) -> Result<String, SessionError> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| SessionError::Credentials(format!("shared access key is not base64: {e}")))?;
    let sr = encode(resource);

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| SessionError::Credentials(e.to_string()))?;
    mac.update(format!("{sr}\n{expiry}").as_bytes());
    let sig = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={sr}&sig={}&se={expiry}",
        encode(&sig)
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }
    Ok(token)
}
