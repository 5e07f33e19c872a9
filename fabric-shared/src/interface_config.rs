use crate::{chmod, ensure_dirs_exist, Error, IoErrorContext, WrappedIoError};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use wireguard_control::{InterfaceName, KeyPair};

/// WireGuard keypair persisted across restarts so the device identity (and
/// thus its registration with the controller) survives a reboot.
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceKeys {
    pub private_key: String,
    pub public_key: String,
}

impl InterfaceKeys {
    pub fn generate() -> Self {
        let keypair = KeyPair::generate();
        Self {
            private_key: keypair.private.to_base64(),
            public_key: keypair.public.to_base64(),
        }
    }

    /// Load persisted keys from `state_dir`, generating and saving a fresh
    /// pair on first run.
    pub fn load_or_generate(state_dir: &Path) -> Result<Self, Error> {
        ensure_dirs_exist(&[state_dir])?;
        let path = Self::path(state_dir);
        if path.exists() {
            crate::warn_on_dangerous_mode(&path).with_path(&path)?;
            let contents = std::fs::read_to_string(&path).with_path(&path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let keys = Self::generate();
            keys.save(state_dir)?;
            Ok(keys)
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), Error> {
        let path = Self::path(state_dir);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_path(&path)?;
        chmod(&file, 0o600).with_path(&path)?;
        file.write_all(toml::to_string(self)?.as_bytes())
            .with_path(&path)?;
        Ok(())
    }

    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("keys.toml")
    }
}

/// A refreshable OAuth token as acquired by the (external) OIDC device-flow
/// or password-grant collaborator, cached so the agent doesn't need to
/// reauthenticate interactively on every restart.
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ApiToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry_unix_secs: Option<u64>,
}

impl ApiToken {
    pub fn load(state_dir: &Path) -> Result<Option<Self>, Error> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        crate::warn_on_dangerous_mode(&path).with_path(&path)?;
        let contents = std::fs::read_to_string(&path).with_path(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), Error> {
        ensure_dirs_exist(&[state_dir])?;
        let path = Self::path(state_dir);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_path(&path)?;
        chmod(&file, 0o600).with_path(&path)?;
        file.write_all(serde_json::to_string(self)?.as_bytes())
            .with_path(&path)?;
        Ok(())
    }

    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("apitoken.json")
    }
}

/// Startup configuration for a single tunnel interface, distinct from the
/// persisted key/token state above (this is never written back to disk).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub interface: InterfaceName,
    pub controller_url: url::Url,
    pub state_dir: PathBuf,
    pub request_ip: Option<std::net::IpAddr>,
    pub local_endpoint_ip: Option<std::net::IpAddr>,
    pub child_prefixes: Vec<ipnet::IpNet>,
    pub stun: bool,
    pub relay: bool,
    pub relay_only: bool,
    pub insecure_skip_tls_verify: bool,
    pub userspace_mode: bool,
    pub org_id: Option<String>,
    pub listen_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keys = InterfaceKeys::load_or_generate(dir.path()).unwrap();
        let reloaded = InterfaceKeys::load_or_generate(dir.path()).unwrap();
        assert_eq!(keys.private_key, reloaded.private_key);
        assert_eq!(keys.public_key, reloaded.public_key);

        let meta = std::fs::metadata(dir.path().join("keys.toml")).unwrap();
        assert_eq!(
            std::os::unix::fs::PermissionsExt::mode(&meta.permissions()) & 0o777,
            0o600
        );
    }

    #[test]
    fn token_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ApiToken::load(dir.path()).unwrap().is_none());

        let token = ApiToken {
            access_token: "abc".into(),
            refresh_token: Some("def".into()),
            expiry_unix_secs: Some(1_700_000_000),
        };
        token.save(dir.path()).unwrap();

        let reloaded = ApiToken::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.access_token, "abc");
    }
}
