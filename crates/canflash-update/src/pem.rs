//! PEM certificate files
//!
//! Only the first PEM block of a file is used. Its DER content is the key
//! material sent to the node.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PemError {
    #[error("No PEM block found")]
    MissingBlock,

    #[error("PEM block '{0}' has no matching END line")]
    Unterminated(String),

    #[error("Invalid base64 content: {0}")]
    InvalidBase64(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemFile {
    /// Text after `BEGIN`, e.g. `PUBLIC KEY`
    pub label: String,
    pub der: Vec<u8>,
}

impl PemFile {
    pub fn parse(text: &str) -> Result<Self, PemError> {
        let mut lines = text.lines().map(str::trim);
        let label = lines
            .by_ref()
            .find_map(|line| {
                line.strip_prefix("-----BEGIN ")
                    .and_then(|rest| rest.strip_suffix("-----"))
            })
            .ok_or(PemError::MissingBlock)?
            .to_string();

        let end = format!("-----END {}-----", label);
        let mut body = String::new();
        let mut terminated = false;
        for line in lines {
            if line == end {
                terminated = true;
                break;
            }
            // RFC 1421 headers such as Proc-Type
            if line.contains(':') {
                continue;
            }
            body.push_str(line);
        }
        if !terminated {
            return Err(PemError::Unterminated(label));
        }

        let der = STANDARD
            .decode(&body)
            .map_err(|e| PemError::InvalidBase64(e.to_string()))?;
        Ok(Self { der, label })
    }

    pub fn key_material(&self) -> &[u8] {
        &self.der
    }
}
