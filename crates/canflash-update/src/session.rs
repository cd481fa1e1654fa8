//! Programming session entry and security access

use tracing::{debug, info};

use crate::config::{SecurityConfig, SessionConfig};
use crate::uds::{UdsError, UdsService};

/// Key for a seed: the seed XOR the secret, cycling over the secret bytes
pub fn compute_key(seed: &[u8], secret: &[u8]) -> Vec<u8> {
    if secret.is_empty() {
        return seed.to_vec();
    }
    seed.iter()
        .enumerate()
        .map(|(i, b)| b ^ secret[i % secret.len()])
        .collect()
}

/// Switch a diagnostic flashloader into its programming session
pub async fn enter_programming_session(
    uds: &UdsService,
    sessions: &SessionConfig,
) -> Result<(), UdsError> {
    uds.diagnostic_session_control(sessions.programming_session)
        .await?;
    debug!(
        session = format!("0x{:02X}", sessions.programming_session),
        "Programming session active"
    );
    Ok(())
}

/// Unlock the node with seed and key
///
/// Returns `false` when the node reported an empty or all-zero seed, meaning
/// it is already unlocked and no key was sent.
pub async fn unlock(uds: &UdsService, security: &SecurityConfig) -> Result<bool, UdsError> {
    let secret = hex::decode(&security.secret).map_err(|e| {
        UdsError::SecurityAccessFailed(format!("Invalid security secret hex: {}", e))
    })?;

    let seed = uds.security_access_request_seed(security.level).await?;
    if seed.iter().all(|b| *b == 0) {
        debug!(level = security.level, "Security already unlocked");
        return Ok(false);
    }

    let key = compute_key(&seed, &secret);
    uds.security_access_send_key(security.level, &key)
        .await
        .map_err(|e| UdsError::SecurityAccessFailed(format!("Send key: {}", e)))?;

    info!(level = security.level, "Security access granted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_key_cycles_secret() {
        assert_eq!(
            compute_key(&[0x12, 0x34, 0x56], &[0xFF, 0x00]),
            vec![0xED, 0x34, 0xA9]
        );
        assert_eq!(compute_key(&[0x12], &[]), vec![0x12]);
    }
}
