//! Callback credentials - signed tokens binding a webhook call to a project.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Claims carried by a callback credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackClaims {
    pub project_id: String,
}

/// Mints and verifies HS256 callback credentials against a shared secret.
///
/// Tokens carry no expiry claim and none is enforced on verification.
#[derive(Clone)]
pub struct CredentialSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl CredentialSigner {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a credential scoped to `project_id`.
    pub fn mint(&self, project_id: &str) -> Result<String> {
        let claims = CallbackClaims {
            project_id: project_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Upstream(format!("failed to sign callback credential: {e}")))
    }

    /// Verify a credential and return the project it was minted for.
    pub fn verify(&self, token: &str) -> Result<CallbackClaims> {
        let data = jsonwebtoken::decode::<CallbackClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| Error::Unauthorized(format!("invalid callback credential: {e}")))?;

        if data.claims.project_id.trim().is_empty() {
            return Err(Error::Unauthorized(
                "callback credential carries no project_id".to_string(),
            ));
        }
        Ok(data.claims)
    }

    /// Verify the value of an `Authorization` header, with or without a
    /// `Bearer ` prefix.
    pub fn verify_header(&self, header: Option<&str>) -> Result<CallbackClaims> {
        let value = header
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing callback credential".to_string()))?;
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        self.verify(token)
    }
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_credential_verifies_to_its_project() {
        let signer = CredentialSigner::new("shared");
        let token = signer.mint("p-1").unwrap();

        assert_eq!(signer.verify(&token).unwrap().project_id, "p-1");
        let bearer = format!("Bearer {token}");
        assert_eq!(
            signer.verify_header(Some(&bearer)).unwrap().project_id,
            "p-1"
        );
    }

    #[test]
    fn foreign_or_missing_credentials_are_unauthorized() {
        let token = CredentialSigner::new("other").mint("p-1").unwrap();
        let signer = CredentialSigner::new("shared");

        assert!(matches!(signer.verify(&token), Err(Error::Unauthorized(_))));
        assert!(matches!(signer.verify("garbage"), Err(Error::Unauthorized(_))));
        assert!(matches!(signer.verify_header(None), Err(Error::Unauthorized(_))));
        assert!(matches!(
            signer.verify_header(Some("  ")),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn empty_project_id_is_rejected() {
        let signer = CredentialSigner::new("shared");
        let token = signer.mint("").unwrap();
        assert!(matches!(signer.verify(&token), Err(Error::Unauthorized(_))));
    }
}
