//! C6 digest authentication (RFC 2617), used to answer 401/407
//! challenges when `auto_authenticate` is enabled and to build the
//! REGISTER retry in [`crate::dialog::registration`].

use crate::core::config::Credentials;
use crate::message::typed::DigestParams;

/// Computes the digest `response` field for `method`/`uri` against a
/// challenge, per RFC 2617 §3.2.2.1 (`qop` unset; this stack only
/// answers the basic MD5 challenge, not `qop=auth`/`auth-int`).
pub fn compute_response(credentials: &Credentials, challenge: &DigestParams, method: &str, uri: &str) -> String {
    let realm = challenge.realm.as_deref().unwrap_or("");
    let nonce = challenge.nonce.as_deref().unwrap_or("");
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", credentials.user_name, realm, credentials.password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

/// Builds the `Authorization`/`Proxy-Authorization` header value for a
/// retried request, filling in the computed `response` and the request
/// line the challenge was issued for.
pub fn build_authorization(credentials: &Credentials, challenge: &DigestParams, method: &str, uri: &str) -> DigestParams {
    let response = compute_response(credentials, challenge, method, uri);
    DigestParams {
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        algorithm: challenge.algorithm.clone(),
        opaque: challenge.opaque.clone(),
        qop: None,
        stale: false,
        username: Some(credentials.user_name.clone()),
        uri: Some(uri.to_string()),
        response: Some(response),
        cnonce: None,
        nc: None,
    }
}
