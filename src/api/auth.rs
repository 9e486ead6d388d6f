use serde_json::json;

use super::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::models::{LoginResponse, MessageResponse, Session};
use crate::normalize::decode;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Checks done before a new password is ever sent.
pub fn validate_new_password(new_password: &str, confirmation: &str) -> Result<()> {
    if new_password != confirmation {
        return Err(ConsultaError::Validation(
            "The new passwords do not match.".to_string(),
        ));
    }
    if new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ConsultaError::Validation(format!(
            "The new password must be at least {MIN_PASSWORD_LEN} characters long."
        )));
    }
    Ok(())
}

impl ApiClient {
    pub fn login(&self, email: &str, password: &str) -> Result<Session> {
        let value = self.post_json(
            "/api/auth/login",
            &json!({ "email": email.trim(), "password": password }),
            "Login failed",
        )?;
        let resp: LoginResponse = decode(value)?;
        if resp.token.trim().is_empty() {
            return Err(ConsultaError::Other(
                "the server accepted the login but sent no token".to_string(),
            ));
        }
        Ok(Session {
            user: resp.user,
            token: resp.token,
        })
    }

    pub fn recover_password(&self, email: &str) -> Result<MessageResponse> {
        let value = self.post_json(
            "/api/auth/recover-password",
            &json!({ "email": email.trim() }),
            "Password recovery request failed",
        )?;
        decode(value)
    }

    pub fn reset_password(&self, token: &str, new_password: &str) -> Result<MessageResponse> {
        let value = self.post_json(
            "/api/auth/reset-password",
            &json!({ "token": token, "newPassword": new_password }),
            "Password reset failed",
        )?;
        decode(value)
    }

    pub fn change_password(
        &self,
        email: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<MessageResponse> {
        let value = self.post_json(
            "/api/auth/change-password",
            &json!({
                "email": email,
                "currentPassword": current_password,
                "newPassword": new_password,
            }),
            "Password change failed",
        )?;
        decode(value)
    }
}
