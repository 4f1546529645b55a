use lazy_static::lazy_static;
use regex::Regex;

/// Mask an account, violation or plate number suitable for use in logs. Only
/// the last four characters are kept.
pub fn identifier(value: &str) -> String {
    const DEFAULT_MASK: &str = "****";
    let value = value.trim();
    let visible = value.chars().count().saturating_sub(4);
    if visible == 0 {
        DEFAULT_MASK.to_string()
    } else {
        let tail: String = value.chars().skip(visible).collect();
        format!("{}{}", DEFAULT_MASK, tail)
    }
}

/// Mask email address suitable for use in logs.
pub fn email(address: &str) -> String {
    const DEFAULT_MASK: &str = "****@******";

    lazy_static! {
        static ref EMAIL_MASK_REGEX: Regex = Regex::new(r"^([^@]*)@(.+)$").unwrap();
    }

    if let Some(captures) = EMAIL_MASK_REGEX.captures(address.trim()) {
        match (captures.get(1), captures.get(2)) {
            (Some(local), Some(host)) if !local.as_str().is_empty() => {
                let local: String = local.as_str().chars().take(1).collect();
                let host = host.as_str();
                let hidden = host.chars().count().saturating_sub(2);
                let host: String = if hidden > 0 {
                    host.chars().skip(hidden).collect()
                } else {
                    String::new()
                };
                format!("{}{}{}", local, DEFAULT_MASK, host)
            }
            _ => DEFAULT_MASK.to_string(),
        }
    } else {
        DEFAULT_MASK.to_string()
    }
}
