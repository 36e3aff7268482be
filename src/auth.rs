use crate::directory;
use crate::error::ApiError;
use crate::schemas::{Access, Role, User};
use actix_web::http::header::HeaderValue;
use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use hmac::{Hmac, Mac};
use mongodb::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{env, num::ParseIntError};

type HmacSha256 = Hmac<Sha256>;

/// Identity payload the external provider places in the Authorization
/// header. The signature covers every other field, keyed by a secret shared
/// with the provider.
#[derive(Deserialize, Debug, Clone)]
pub struct IdentityClaims {
    pub external_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub issued_at: String,
    pub signature: String,
}

pub fn verify_identity(request: &HttpRequest) -> Option<IdentityClaims> {
    let authorization = request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .map(HeaderValue::to_str)?
        .ok()?;
    let secret = env::var("IDENTITY_SECRET").ok()?;
    let claims: IdentityClaims = serde_json::from_str(authorization).ok()?;
    let signature = claims
        .signature
        .chars()
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|n| u8::from_str_radix(&String::from_iter(n), 16))
        .collect::<Result<Vec<u8>, ParseIntError>>()
        .ok()?;
    if compute_signature(&claims, &secret) == signature {
        Some(claims)
    } else {
        None
    }
}

fn compute_signature(claims: &IdentityClaims, secret: &str) -> Vec<u8> {
    // Fields are signed as key=value lines in alphabetical order, absent
    // optional fields are left out entirely.
    let signed_content = vec![
        ("email", claims.email.clone()),
        ("external_id", Some(claims.external_id.clone())),
        ("issued_at", Some(claims.issued_at.clone())),
        ("name", claims.name.clone()),
    ]
    .into_iter()
    .filter_map(|pair| pair.1.map(|val| format!("{}={}", pair.0, val)))
    .collect::<Vec<_>>()
    .join("\n");

    let mut sha256_hasher = Sha256::new();
    sha256_hasher.update(secret.as_bytes());
    let key = sha256_hasher.finalize();

    let mut hmac_hasher = HmacSha256::new_from_slice(&key).unwrap();
    hmac_hasher.update(signed_content.as_bytes());
    hmac_hasher.finalize().into_bytes().to_vec()
}

fn store_client(req: &HttpRequest) -> Client {
    req.app_data::<web::Data<Client>>()
        .expect("the mongodb client must be registered as app data")
        .get_ref()
        .clone()
}

/// First gate tier: a verified identity payload that maps to a registered
/// user. Handlers taking this require no account context.
pub struct Identified {
    pub user: User,
}

impl FromRequest for Identified {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let claims = verify_identity(&req).ok_or(ApiError::Unauthenticated)?;
            let client = store_client(&req);
            let user = directory::user_by_external_id(&client, &claims.external_id)
                .await?
                .ok_or(ApiError::Unauthenticated)?;
            Ok(Identified { user })
        })
    }
}

/// Second tier: the caller holds at least viewer access on the account named
/// in the path. The resolved role rides along into the handler.
pub struct AccountAccess {
    pub user: User,
    pub account_id: String,
    pub role: Role,
}

impl FromRequest for AccountAccess {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let identified = Identified::from_request(req, payload);
        let req = req.clone();
        Box::pin(async move {
            let Identified { user } = identified.await?;
            let account_id = req
                .match_info()
                .get("account_id")
                .ok_or(ApiError::Forbidden)?
                .to_string();
            let client = store_client(&req);
            // resolved fresh on every request, a revoked membership takes
            // effect on the next call
            match directory::resolve(&client, &user.id, &account_id).await? {
                Access::Admin => Ok(AccountAccess {
                    user,
                    account_id,
                    role: Role::Admin,
                }),
                Access::Viewer => Ok(AccountAccess {
                    user,
                    account_id,
                    role: Role::Viewer,
                }),
                Access::Denied => Err(ApiError::Forbidden),
            }
        })
    }
}

/// Third tier: admin role required.
pub struct AccountAdmin {
    pub user: User,
    pub account_id: String,
}

impl FromRequest for AccountAdmin {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let access = AccountAccess::from_request(req, payload);
        Box::pin(async move {
            let access = access.await?;
            if access.role != Role::Admin {
                return Err(ApiError::Forbidden);
            }
            Ok(AccountAdmin {
                user: access.user,
                account_id: access.account_id,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::AUTHORIZATION;
    use actix_web::test::TestRequest;
    use serde_json::json;

    const SECRET: &str = "test-identity-secret";

    fn signed_payload(external_id: &str, name: Option<&str>, email: Option<&str>) -> String {
        let claims = IdentityClaims {
            external_id: external_id.to_string(),
            name: name.map(str::to_string),
            email: email.map(str::to_string),
            issued_at: "1722772800".to_string(),
            signature: String::new(),
        };
        let signature = compute_signature(&claims, SECRET)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        json!({
            "external_id": claims.external_id,
            "name": claims.name,
            "email": claims.email,
            "issued_at": claims.issued_at,
            "signature": signature,
        })
        .to_string()
    }

    fn request_with(header: &str) -> HttpRequest {
        env::set_var("IDENTITY_SECRET", SECRET);
        TestRequest::default()
            .insert_header((AUTHORIZATION, header.to_string()))
            .to_http_request()
    }

    #[test]
    fn well_signed_payload_is_accepted() {
        let payload = signed_payload("ext-42", Some("Maria"), Some("maria@example.com"));
        let claims = verify_identity(&request_with(&payload)).expect("should verify");
        assert_eq!(claims.external_id, "ext-42");
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let payload = signed_payload("ext-7", None, None);
        assert!(verify_identity(&request_with(&payload)).is_some());
    }

    #[test]
    fn tampered_field_is_rejected() {
        let payload = signed_payload("ext-42", Some("Maria"), None);
        let forged = payload.replace("ext-42", "ext-43");
        assert!(verify_identity(&request_with(&forged)).is_none());
    }

    #[test]
    fn garbage_header_is_rejected() {
        assert!(verify_identity(&request_with("not json at all")).is_none());
    }

    #[test]
    fn missing_header_is_rejected() {
        env::set_var("IDENTITY_SECRET", SECRET);
        let request = TestRequest::default().to_http_request();
        assert!(verify_identity(&request).is_none());
    }
}
