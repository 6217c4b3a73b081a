//! Admission of a socket before the upgrade: every connection is bound to a
//! participant identity up front.

use serde::Deserialize;

use crate::error::AuthError;
use crate::repository::UserRepository;
use crate::tokens::USER_ROLE;
use crate::types::User;

pub const MAX_NAME_LEN: usize = 40;

/// Query parameters of the upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionParams {
    pub token: Option<String>,
    pub name: Option<String>,
}

/// Resolves the participant for a new connection. A token takes precedence
/// over a display name.
pub async fn admit(params: &AdmissionParams, users: &dyn UserRepository) -> Result<User, AuthError> {
    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        let (id, role) = users.parse_token(token).map_err(AuthError::InvalidToken)?;
        if role != USER_ROLE {
            return Err(AuthError::ForbiddenRole(role));
        }
        let account = users.get_user_by_id(id).await.map_err(AuthError::Account)?;
        return Ok(User::account(id, account.display_name()));
    }

    let Some(name) = params.name.as_deref() else {
        return Err(AuthError::MissingCredentials);
    };
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(AuthError::InvalidName { max: MAX_NAME_LEN });
    }
    Ok(User::guest(name))
}
