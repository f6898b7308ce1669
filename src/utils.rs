use crate::error::{RepoError, RepoResult};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use url::Url;
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    format!("{:.1} {}", size, UNITS[unit_index])
}
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        format!("{}h {}m", hours, minutes)
    }
}
pub fn calculate_checksum(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
/// Filesystem-safe form of a repository name, used for cache file names.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
/// Replaces `{key}` placeholders. Values are percent-encoded unless the key is
/// listed in `raw`, which is how path segments such as `{arch}` are passed through.
pub fn substitute_placeholders(template: &str, vars: &HashMap<&str, String>, raw: &[&str]) -> RepoResult<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        result.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            RepoError::ConfigError(format!("unterminated placeholder in '{}'", template))
        })?;
        let key = &after[..end];
        let value = vars.get(key).ok_or_else(|| {
            RepoError::ConfigError(format!("no value for placeholder {{{}}} in '{}'", key, template))
        })?;
        if raw.contains(&key) {
            result.push_str(value);
        } else {
            result.push_str(&urlencoding::encode(value));
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}
pub fn join_url(base: &str, relative: &str) -> RepoResult<String> {
    let base = if base.ends_with('/') {
        Url::parse(base)?
    } else {
        Url::parse(&format!("{}/", base))?
    };
    Ok(base.join(relative.trim_start_matches('/'))?.to_string())
}
/// Directory part of a URL, with trailing slash.
pub fn parent_url(url: &str) -> String {
    match url.rfind('/') {
        Some(idx) => url[..=idx].to_string(),
        None => url.to_string(),
    }
}
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, plain dates and unix seconds.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
/// Splits dependency-style lists (`a, b (>= 1), c | d`) into bare names.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| {
            let part = part.trim();
            let part = part.split('|').next().unwrap_or(part).trim();
            part.split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or(part)
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_format_size() {
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
    }
    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("apt ubuntu/jammy"), "apt_ubuntu_jammy");
        assert_eq!(sanitize_filename("dnf-fedora-f40"), "dnf-fedora-f40");
    }
    #[test]
    fn test_substitute_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("query", "left pad".to_string());
        vars.insert("arch", "x86_64".to_string());
        let url = substitute_placeholders("https://r.example/{arch}/search?q={query}", &vars, &["arch"]).unwrap();
        assert_eq!(url, "https://r.example/x86_64/search?q=left%20pad");
        assert!(substitute_placeholders("https://r.example/{package}", &vars, &[]).is_err());
    }
    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://mirror.example/fedora/40/x86_64/os", "repodata/primary.xml.zst").unwrap(),
            "https://mirror.example/fedora/40/x86_64/os/repodata/primary.xml.zst"
        );
        assert_eq!(parent_url("https://a.example/x/repomd.xml"), "https://a.example/x/");
    }
    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("0").unwrap().timestamp(), 0);
        assert!(parse_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("libc6 (>= 2.34), zlib1g | libz, , openssl"),
            vec!["libc6", "zlib1g", "openssl"]
        );
    }
}
