//! Request signing for the Binance WebSocket API

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::path::Path;
use tracing::info;

use crate::error::{BinanceError, BinanceResult};

/// Produces the `signature` parameter for a signed request
pub trait RequestSigner: Send + Sync {
    fn sign(&self, payload: &str) -> BinanceResult<String>;
}

/// Ed25519 signer over a PKCS#8 private key; signatures are standard base64
#[derive(Debug)]
pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
}

impl Ed25519Signer {
    pub fn from_pkcs8(der: &[u8]) -> BinanceResult<Self> {
        // OpenSSL writes v1 documents without the public key, which the checked constructor rejects
        let key_pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(der)
            .map_err(|e| BinanceError::Key(format!("Not an Ed25519 PKCS#8 key: {}", e)))?;
        Ok(Self { key_pair })
    }

    pub fn from_pem(text: &str) -> BinanceResult<Self> {
        let block = pem::parse(text).map_err(|e| BinanceError::Key(format!("Invalid PEM: {}", e)))?;
        if block.tag() != "PRIVATE KEY" {
            return Err(BinanceError::Key(format!(
                "Expected a PRIVATE KEY block, found {}",
                block.tag()
            )));
        }
        Self::from_pkcs8(block.contents())
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> BinanceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let signer = Self::from_pem(&text)?;
        info!("Loaded Ed25519 key from {}", path.display());
        Ok(signer)
    }

    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }
}

impl RequestSigner for Ed25519Signer {
    fn sign(&self, payload: &str) -> BinanceResult<String> {
        let signature = self.key_pair.sign(payload.as_bytes());
        Ok(STANDARD.encode(signature.as_ref()))
    }
}
