//! Alpine `APKINDEX.tar.gz`.

use super::{checkpoint, report_skipped, FieldMapper, FormatParser, ParseContext};
use crate::{
    error::{RepoError, RepoResult},
    fetcher::RawPayload,
    package::Package,
    utils::parent_url,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::Read;

pub struct ApkIndexParser;

const DEFAULT_FIELDS: &[(&str, &str)] = &[];

// single-letter keys of the index, spelled out
fn field_name(key: &str) -> Option<&'static str> {
    Some(match key {
        "P" => "name",
        "V" => "version",
        "T" => "description",
        "U" => "homepage",
        "L" => "license",
        "m" => "maintainer",
        "S" => "size",
        "A" => "architecture",
        "C" => "checksum",
        "D" => "dependencies",
        "t" => "last_updated",
        "o" => "origin",
        "I" => "installed_size",
        "c" => "commit",
        "p" => "provides",
        "k" => "provider_priority",
        "i" => "install_if",
        _ => return None,
    })
}

/// Pulls the `APKINDEX` member out of the (already decompressed) tarball.
/// Plain index text is accepted as is.
fn index_text(data: &[u8]) -> RepoResult<String> {
    if data.starts_with(b"C:") || data.starts_with(b"P:") {
        return Ok(String::from_utf8_lossy(data).into_owned());
    }

    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|e| RepoError::ParseError(format!("not a tar archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| RepoError::ParseError(format!("corrupt tar entry: {}", e)))?;
        let is_index = entry
            .path()
            .map(|p| p.as_os_str() == "APKINDEX")
            .unwrap_or(false);
        if is_index {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| RepoError::ParseError(format!("unreadable APKINDEX: {}", e)))?;
            return Ok(text);
        }
    }
    Err(RepoError::ParseError(
        "archive has no APKINDEX member".to_string(),
    ))
}

fn records(text: &str) -> Vec<Map<String, Value>> {
    let mut records = Vec::new();
    let mut current = Map::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(name) = field_name(key) else {
            current.insert(key.to_string(), Value::String(value.to_string()));
            continue;
        };
        let value = match name {
            "dependencies" | "provides" | "install_if" => Value::Array(
                value
                    .split_whitespace()
                    .map(|d| Value::String(d.to_string()))
                    .collect(),
            ),
            _ => Value::String(value.to_string()),
        };
        current.insert(name.to_string(), value);
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

#[async_trait]
impl FormatParser for ApkIndexParser {
    fn format(&self) -> &'static str {
        "apk_index"
    }

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>> {
        let data = ctx.decompressor.decode(&payload.bytes, &payload.url).await?;
        let text = index_text(&data)?;

        let mapper = FieldMapper::new(ctx, DEFAULT_FIELDS);
        let base = parent_url(&payload.url);
        let mut packages = Vec::new();
        let mut skipped = 0;

        for (index, record) in records(&text).into_iter().enumerate() {
            checkpoint(index).await;
            match mapper.map(&record) {
                Some(mut package) => {
                    package.download_url =
                        Some(format!("{}{}-{}.apk", base, package.name, package.version));
                    packages.push(package);
                }
                None => skipped += 1,
            }
        }

        report_skipped(self.format(), &ctx.repository.name, packages.len(), skipped);
        Ok(packages)
    }
}
