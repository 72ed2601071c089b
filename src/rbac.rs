/// HMAC-signed session/widget tokens and the role permission model.
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::UserSession;

type HmacSha256 = Hmac<Sha256>;

/// Role that passes every permission check.
pub const ADMIN_ROLE: &str = "admin";

const WIDGET_TOKEN_PREFIX: &str = "w";

fn sign(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify(secret: &str, payload: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Compact session token: `{session_id}.{expires_at}.{sig}`.
pub fn generate_session_token(session_id: &str, secret: &str, ttl_secs: u64) -> String {
    let expires_at = Utc::now().timestamp() + ttl_secs as i64;
    let payload = format!("{}.{}", session_id, expires_at);
    let signature = sign(secret, &payload);
    format!("{}.{}", payload, signature)
}

/// Returns the session id for a well-formed, untampered, unexpired token.
pub fn validate_session_token(token: &str, secret: &str) -> Option<String> {
    // Signature and expiry are the rightmost segments; the id may not
    // contain dots, but parse defensively anyway
    let mut parts = token.rsplitn(3, '.');
    let signature = parts.next()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let session_id = parts.next()?;

    let payload = format!("{}.{}", session_id, expires_at);
    if !verify(secret, &payload, signature) {
        return None;
    }
    if expires_at <= Utc::now().timestamp() {
        return None;
    }
    Some(session_id.to_string())
}

/// Widget-scoped capability token: `w.{widget_id}.{expires_at}.{sig}`.
///
/// Grants access to exactly one widget, independent of any user session, so
/// a widget URL can be shared without leaking full session rights.
pub fn generate_widget_token(widget_id: &str, secret: &str, ttl_secs: u64) -> String {
    let expires_at = Utc::now().timestamp() + ttl_secs as i64;
    let payload = format!("{}.{}.{}", WIDGET_TOKEN_PREFIX, widget_id, expires_at);
    let signature = sign(secret, &payload);
    format!("{}.{}", payload, signature)
}

/// Returns the widget id for a valid widget token.
pub fn validate_widget_token(token: &str, secret: &str) -> Option<String> {
    let mut parts = token.rsplitn(4, '.');
    let signature = parts.next()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let widget_id = parts.next()?;
    let prefix = parts.next()?;

    if prefix != WIDGET_TOKEN_PREFIX {
        return None;
    }
    let payload = format!("{}.{}.{}", prefix, widget_id, expires_at);
    if !verify(secret, &payload, signature) {
        return None;
    }
    if expires_at <= Utc::now().timestamp() {
        return None;
    }
    Some(widget_id.to_string())
}

/// Whether one granted permission string covers `resource_type:action`.
/// Grants are `"type:action"` with `*` allowed on either side, or a bare `*`.
pub fn permission_covers(granted: &str, resource_type: &str, action: &str) -> bool {
    if granted == "*" {
        return true;
    }
    let Some((granted_type, granted_action)) = granted.split_once(':') else {
        return false;
    };
    (granted_type == "*" || granted_type == resource_type)
        && (granted_action == "*" || granted_action == action)
}

pub fn any_permission_covers<'a, I>(granted: I, resource_type: &str, action: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    granted
        .into_iter()
        .any(|g| permission_covers(g, resource_type, action))
}

/// Whether the granted set covers a required `"type:action"` permission.
pub fn has_permission<'a, I>(granted: I, permission: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let Some((resource_type, action)) = permission.split_once(':') else {
        return false;
    };
    any_permission_covers(granted, resource_type, action)
}

pub fn is_admin(session: &UserSession) -> bool {
    session.has_role(ADMIN_ROLE)
}

/// Widget access check: admins always pass, otherwise the session needs a
/// covering `widget:<action>` grant resolved by the caller.
pub fn check_widget_permission<'a, I>(session: &UserSession, granted: I, action: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    if is_admin(session) {
        return true;
    }
    any_permission_covers(granted, "widget", action)
}
