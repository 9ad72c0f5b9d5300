use std::{collections::HashMap, sync::Arc};

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use outreach_core::types::ProviderKind;
use outreach_util::WebhookConfig;

pub const LEMLIST_SIGNATURE_HEADER: &str = "X-Lemlist-Signature";
pub const POSTMARK_SIGNATURE_HEADER: &str = "X-Postmark-Signature";
pub const BEARER_HEADER: &str = "authorization";

/// Authentication scheme for one provider, fixed at startup.
#[derive(Clone)]
pub enum SignatureVerifier {
    /// `sha256=<hex>` HMAC-SHA256 of the raw body.
    HexHmac {
        header: &'static str,
        secret: Arc<[u8]>,
    },
    /// Standard base64 HMAC-SHA256 of the raw body.
    Base64Hmac {
        header: &'static str,
        secret: Arc<[u8]>,
    },
    /// `Authorization: Bearer <token>`.
    Bearer { token: Arc<[u8]> },
    /// Accepts every request. Never installed in production.
    Bypass,
}

impl SignatureVerifier {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::HexHmac { .. } => "hex_hmac",
            Self::Base64Hmac { .. } => "base64_hmac",
            Self::Bearer { .. } => "bearer",
            Self::Bypass => "bypass",
        }
    }

    /// Checks `body` against the credentials carried in `headers`.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        match self {
            Self::HexHmac { header, secret } => {
                let provided = required_header(headers, *header)?;
                let hex_part = provided
                    .strip_prefix("sha256=")
                    .ok_or(SignatureError::Malformed("signature must start with 'sha256='"))?;
                let provided_bytes = hex::decode(hex_part)
                    .map_err(|_| SignatureError::Malformed("signature is not valid hex"))?;
                verify_hmac(secret, body, &provided_bytes)
            }
            Self::Base64Hmac { header, secret } => {
                let provided = required_header(headers, *header)?;
                let provided_bytes = STANDARD
                    .decode(provided.trim())
                    .map_err(|_| SignatureError::Malformed("signature is not valid base64"))?;
                verify_hmac(secret, body, &provided_bytes)
            }
            Self::Bearer { token } => {
                let provided = required_header(headers, BEARER_HEADER)?;
                let candidate = provided
                    .strip_prefix("Bearer ")
                    .ok_or(SignatureError::Malformed("authorization must use the Bearer scheme"))?;
                if body.is_empty() {
                    return Err(SignatureError::EmptyBody);
                }
                if bool::from(candidate.as_bytes().ct_eq(token.as_ref())) {
                    Ok(())
                } else {
                    Err(SignatureError::Mismatch)
                }
            }
            Self::Bypass => Ok(()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("request body is empty")]
    EmptyBody,
    #[error("malformed credentials: {0}")]
    Malformed(&'static str),
    #[error("signature mismatch")]
    Mismatch,
}

fn required_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::MissingHeader(name))
}

fn verify_hmac(secret: &[u8], body: &[u8], provided: &[u8]) -> Result<(), SignatureError> {
    if body.is_empty() {
        return Err(SignatureError::EmptyBody);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| SignatureError::Malformed("failed to initialize signature verifier"))?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Providers the endpoint accepts, each with its verifier.
///
/// A provider without credentials is absent and its route answers 404.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    verifiers: HashMap<ProviderKind, SignatureVerifier>,
}

impl ProviderRegistry {
    pub fn from_config(config: &WebhookConfig) -> Self {
        let mut verifiers = HashMap::new();

        if config.signature_bypass {
            for provider in ProviderKind::ALL {
                verifiers.insert(provider, SignatureVerifier::Bypass);
            }
            return Self { verifiers };
        }

        if let Some(secret) = &config.lemlist_secret {
            verifiers.insert(
                ProviderKind::Lemlist,
                SignatureVerifier::HexHmac {
                    header: LEMLIST_SIGNATURE_HEADER,
                    secret: Arc::from(secret.as_bytes()),
                },
            );
        }
        if let Some(secret) = &config.postmark_secret {
            verifiers.insert(
                ProviderKind::Postmark,
                SignatureVerifier::Base64Hmac {
                    header: POSTMARK_SIGNATURE_HEADER,
                    secret: Arc::from(secret.as_bytes()),
                },
            );
        }
        if let Some(token) = &config.phantombuster_token {
            verifiers.insert(
                ProviderKind::Phantombuster,
                SignatureVerifier::Bearer {
                    token: Arc::from(token.as_bytes()),
                },
            );
        }

        Self { verifiers }
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&SignatureVerifier> {
        self.verifiers.get(&provider)
    }

    /// Enabled providers in declaration order.
    pub fn enabled(&self) -> impl Iterator<Item = (ProviderKind, &SignatureVerifier)> + '_ {
        ProviderKind::ALL
            .into_iter()
            .filter_map(|provider| self.verifiers.get(&provider).map(|v| (provider, v)))
    }
}
