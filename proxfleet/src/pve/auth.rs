use std::fmt;

/// How to authenticate against every server of one run.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Ticket login (`POST /access/ticket`) with a realm-qualified user.
    Password { user: String, password: String },
    /// API token, sent as `Authorization: PVEAPIToken=user!name=value`.
    Token {
        user: String,
        name: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("missing Proxmox user, provide --user or PROXMOX_USER")]
    MissingUser,
    #[error("token mode enabled but token name missing, provide --token-name or PROXMOX_TOKEN_NAME")]
    MissingTokenName,
    #[error("token mode enabled but token value missing, provide --token-value or PROXMOX_TOKEN_VALUE")]
    MissingTokenValue,
    #[error("password mode but password missing, provide --password or PROXMOX_PASSWORD")]
    MissingPassword,
}

impl Credentials {
    /// Build credentials from the raw CLI/environment values. Blank values
    /// count as missing.
    pub fn resolve(
        user: Option<String>,
        password: Option<String>,
        use_token: bool,
        token_name: Option<String>,
        token_value: Option<String>,
    ) -> Result<Self, CredentialsError> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let user = present(user).ok_or(CredentialsError::MissingUser)?;
        if use_token {
            let name = present(token_name).ok_or(CredentialsError::MissingTokenName)?;
            let value = present(token_value).ok_or(CredentialsError::MissingTokenValue)?;
            Ok(Credentials::Token { user, name, value })
        } else {
            let password = present(password).ok_or(CredentialsError::MissingPassword)?;
            Ok(Credentials::Password { user, password })
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Credentials::Password { user, .. } | Credentials::Token { user, .. } => user,
        }
    }

    /// Value of the `Authorization` header in token mode.
    pub fn token_header(&self) -> Option<String> {
        match self {
            Credentials::Token { user, name, value } => {
                Some(format!("PVEAPIToken={user}!{name}={value}"))
            }
            Credentials::Password { .. } => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Token { user, name, .. } => f
                .debug_struct("Token")
                .field("user", user)
                .field("name", name)
                .field("value", &"<redacted>")
                .finish(),
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { user, .. } => write!(f, "password auth as {user}"),
            Credentials::Token { user, name, .. } => write!(f, "token auth as {user}!{name}"),
        }
    }
}
