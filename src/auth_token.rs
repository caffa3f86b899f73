//! Bearer token for the concierge backend.
//!
//! Looked up from the `SCOUT_AUTH_TOKEN` environment variable first, then
//! from the OS's native secret storage:
//! - Linux: libsecret (GNOME Keyring/KDE Wallet)
//! - macOS: Keychain
//! - Windows: Credential Manager
//!
//! Never log the token value; use [`mask_token`] for display.

use keyring::Entry;

const SERVICE_NAME: &str = "scout-voice";
const TOKEN_KEY_NAME: &str = "backend-auth-token";

/// Environment variable checked before the keyring
pub const TOKEN_ENV: &str = "SCOUT_AUTH_TOKEN";

#[derive(Debug, Clone, PartialEq)]
pub enum TokenError {
    /// No token in the environment or the keyring
    NotConfigured,
    Keyring(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::NotConfigured => write!(
                f,
                "No auth token configured (set {} or run `scout-voice login`)",
                TOKEN_ENV
            ),
            TokenError::Keyring(e) => write!(f, "Keyring error: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

/// Source of the identity token sent as the socket's first frame and as the
/// REST bearer.
pub trait TokenProvider: Send + Sync + 'static {
    fn get_token(&self) -> Result<String, TokenError>;
}

/// Environment first, then the keyring
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredToken;

impl TokenProvider for StoredToken {
    fn get_token(&self) -> Result<String, TokenError> {
        if let Some(token) = token_from_env() {
            return Ok(token);
        }
        load_token()?.ok_or(TokenError::NotConfigured)
    }
}

/// Fixed token, for tests and for `--token`
#[derive(Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn get_token(&self) -> Result<String, TokenError> {
        if self.0.is_empty() {
            Err(TokenError::NotConfigured)
        } else {
            Ok(self.0.clone())
        }
    }
}

fn token_from_env() -> Option<String> {
    std::env::var(TOKEN_ENV)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn entry() -> Result<Entry, TokenError> {
    Entry::new(SERVICE_NAME, TOKEN_KEY_NAME).map_err(|e| {
        log::warn!("AuthToken: failed to create keyring entry: {}", e);
        TokenError::Keyring(e.to_string())
    })
}

/// Read the stored token, `None` if nothing is stored
pub fn load_token() -> Result<Option<String>, TokenError> {
    match entry()?.get_password() {
        Ok(token) if token.is_empty() => Ok(None),
        Ok(token) => Ok(Some(token)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => {
            log::warn!("AuthToken: failed to retrieve token: {}", e);
            Err(TokenError::Keyring(e.to_string()))
        }
    }
}

/// Store the token in the system keyring.
/// Pass None (or an empty token) to delete it.
pub fn store_token(token: Option<&str>) -> Result<(), TokenError> {
    let entry = entry()?;

    match token {
        Some(t) if !t.is_empty() => {
            entry
                .set_password(t)
                .map_err(|e| TokenError::Keyring(e.to_string()))?;
            log::info!("AuthToken: stored new token");
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("AuthToken: deleted token"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(TokenError::Keyring(e.to_string())),
        },
    }

    Ok(())
}

/// Masked form for display (e.g., "eyJ...a1b2c3")
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
