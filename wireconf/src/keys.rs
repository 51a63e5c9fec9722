// Key generation

//! WireGuard key material
//!
//! [`NativeKeys`] generates keys in-process; [`WgToolKeys`] shells out to the
//! `wg` tool for hosts where that is preferred. Both return base64 strings and
//! report every failure as [`Error::KeyService`].

use crate::error::{Error, Result};
use crate::tools::ToolRunner;
use std::future::Future;
use std::time::Duration;
use wireguard_control::Key;

pub trait KeyService: Send + Sync {
    fn generate_private_key(&self) -> impl Future<Output = Result<String>> + Send;

    fn derive_public_key(&self, private_key: &str) -> impl Future<Output = Result<String>> + Send;

    fn generate_preshared_key(&self) -> impl Future<Output = Result<String>> + Send;
}

fn parse_key(key: &str) -> Result<Key> {
    Key::from_base64(key.trim()).map_err(|e| Error::KeyService(format!("invalid key: {}", e)))
}

/// In-process key generation
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeKeys;

impl KeyService for NativeKeys {
    async fn generate_private_key(&self) -> Result<String> {
        Ok(Key::generate_private().to_base64())
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        Ok(parse_key(private_key)?.get_public().to_base64())
    }

    async fn generate_preshared_key(&self) -> Result<String> {
        Ok(Key::generate_preshared().to_base64())
    }
}

/// Key generation through `wg genkey`, `wg pubkey` and `wg genpsk`
#[derive(Debug)]
pub struct WgToolKeys {
    tools: ToolRunner,
}

impl WgToolKeys {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: ToolRunner::new(timeout),
        }
    }

    async fn wg(&self, subcommand: &str, stdin: Option<&[u8]>) -> Result<String> {
        let output = self
            .tools
            .run("wg", &[subcommand], stdin)
            .await
            .map_err(|e| Error::KeyService(e.to_string()))?;

        let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // reject anything that is not a key, e.g. a wrapper printing banners
        parse_key(&key)?;
        Ok(key)
    }
}

impl KeyService for WgToolKeys {
    async fn generate_private_key(&self) -> Result<String> {
        self.wg("genkey", None).await
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        let input = format!("{}\n", private_key.trim());
        self.wg("pubkey", Some(input.as_bytes())).await
    }

    async fn generate_preshared_key(&self) -> Result<String> {
        self.wg("genpsk", None).await
    }
}
