use std::path::Path;

use anyhow::Context;
use axum::http::HeaderMap;
use rand::RngCore;

pub const TOKEN_LEN: usize = 32;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// 32 OS-random bytes mapped onto `[A-Za-z0-9]`.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf.iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Reads the persisted token, or writes a fresh one on first run (or when the
/// file is unreadable garbage).
pub async fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if is_valid_token(contents.trim()) => return Ok(contents.trim().to_string()),
        Ok(_) => tracing::warn!(path = %path.display(), "Token file is malformed, regenerating"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Failed to read auth token"),
    }

    let token = generate_token();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create data directory")?;
    }
    tokio::fs::write(path, &token)
        .await
        .context("Failed to write auth token")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to restrict auth token permissions")?;
    }
    tracing::info!(path = %path.display(), "Generated new auth token");
    Ok(token)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Runs in time independent of where the first mismatching byte is.
pub fn token_matches(expected: &str, got: &str) -> bool {
    if expected.len() != got.len() {
        return false;
    }
    expected
        .bytes()
        .zip(got.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
