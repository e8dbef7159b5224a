use serde_json::Value;

use crate::models::audit_event::AuditEventResponse;

const MASKED: &str = "***";
/// Roles allowed to see decrypted personal data unmasked.
const UNMASKED_ROLES: [&str; 2] = ["system_admin", "auditor"];

/// Masking applied to audit reads, chosen from the caller's gateway role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiPolicy {
    Unmasked,
    Masked,
}

impl PiiPolicy {
    pub fn for_role(role: Option<&str>) -> Self {
        match role {
            Some(role) if UNMASKED_ROLES.contains(&role.trim().to_ascii_lowercase().as_str()) => {
                PiiPolicy::Unmasked
            }
            _ => PiiPolicy::Masked,
        }
    }

    /// Value of the `X-PII-Masked` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            PiiPolicy::Unmasked => "false",
            PiiPolicy::Masked => "true",
        }
    }

    pub fn apply(&self, mut event: AuditEventResponse) -> AuditEventResponse {
        if *self == PiiPolicy::Unmasked {
            return event;
        }
        event.actor_email = event.actor_email.map(|email| {
            if event.redacted_fields.iter().any(|f| f == "actor_email") {
                email
            } else {
                mask_email(&email)
            }
        });
        event.before_value = event.before_value.as_ref().map(mask_pii_json);
        event.after_value = event.after_value.as_ref().map(mask_pii_json);
        event.metadata = event.metadata.as_ref().map(mask_pii_json);
        event
    }
}

pub fn mask_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return MASKED.to_string();
    }

    let mut chars = trimmed.chars();
    let first = chars.next().unwrap_or('*');
    let remaining = chars.count();
    format!("{first}{}", "*".repeat(remaining.max(2)))
}

pub fn mask_email(email: &str) -> String {
    let trimmed = email.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return MASKED.to_string();
    };

    let local_first = local.chars().next().unwrap_or('*');
    let mut domain_parts = domain.split('.');
    let domain_label = domain_parts.next().unwrap_or_default();
    let tld = domain_parts.collect::<Vec<_>>().join(".");
    let domain_first = domain_label.chars().next().unwrap_or('*');

    if tld.is_empty() {
        format!("{local_first}***@{domain_first}***")
    } else {
        format!("{local_first}***@{domain_first}***.{tld}")
    }
}

pub fn mask_ip(ip: &str) -> String {
    if ip.contains(':') {
        let parts = ip.split(':').take(4).collect::<Vec<_>>();
        return format!("{}::/64", parts.join(":"));
    }

    let parts = ip.split('.').collect::<Vec<_>>();
    if parts.len() == 4 {
        return format!("{}.0/24", parts[..3].join("."));
    }

    MASKED.to_string()
}

pub fn mask_user_agent(user_agent: &str) -> String {
    if user_agent.is_empty() {
        return MASKED.to_string();
    }
    let visible: String = user_agent.chars().take(12).collect();
    format!("{visible}***")
}

pub fn mask_pii_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let masked = map
                .iter()
                .map(|(key, val)| {
                    let lowered = key.to_ascii_lowercase();
                    let out = if is_pii_key(&lowered) {
                        mask_json_scalar(&lowered, val)
                    } else {
                        mask_pii_json(val)
                    };
                    (key.clone(), out)
                })
                .collect();
            Value::Object(masked)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(mask_pii_json).collect()),
        _ => value.clone(),
    }
}

fn is_pii_key(key: &str) -> bool {
    if key == "ip" || key.ends_with("_ip") || key.starts_with("ip_") {
        return true;
    }
    [
        "email",
        "full_name",
        "name",
        "phone",
        "address",
        "secret",
        "token",
        "user_agent",
    ]
    .iter()
    .any(|needle| key.contains(needle))
}

fn mask_json_scalar(key: &str, value: &Value) -> Value {
    if let Some(raw) = value.as_str() {
        if key.contains("email") {
            return Value::String(mask_email(raw));
        }
        if key.contains("user_agent") {
            return Value::String(mask_user_agent(raw));
        }
        if key.contains("name") {
            return Value::String(mask_name(raw));
        }
        if key == "ip" || key.ends_with("_ip") || key.starts_with("ip_") {
            return Value::String(mask_ip(raw));
        }
    }
    Value::String(MASKED.to_string())
}
