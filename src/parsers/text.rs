use super::{checkpoint, report_skipped, FieldMapper, FormatParser, ParseContext};
use crate::{error::RepoResult, fetcher::RawPayload, package::Package};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

/// One package per line.
///
/// With `parsing.pattern`, named capture groups become record keys. Otherwise
/// each line is split on `parsing.separator` (whitespace by default) into
/// columns `"0"`, `"1"`, ... and the last column keeps the rest of the line.
/// Blank lines and `#` comments are ignored.
pub struct TextLinesParser;

const DEFAULT_FIELDS: &[(&str, &str)] = &[("name", "0"), ("version", "1"), ("description", "2")];

fn split_columns(line: &str, separator: Option<&str>, columns: usize) -> Map<String, Value> {
    let parts: Vec<&str> = match separator {
        Some(sep) => line.splitn(columns, sep).collect(),
        None => {
            let mut parts = Vec::new();
            let mut rest = line.trim_start();
            while parts.len() + 1 < columns {
                match rest.split_once(char::is_whitespace) {
                    Some((head, tail)) => {
                        parts.push(head);
                        rest = tail.trim_start();
                    }
                    None => break,
                }
            }
            if !rest.is_empty() {
                parts.push(rest);
            }
            parts
        }
    };
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| (i.to_string(), Value::String(part.trim().to_string())))
        .collect()
}

fn capture_record(pattern: &Regex, line: &str) -> Option<Map<String, Value>> {
    let captures = pattern.captures(line)?;
    Some(
        pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), Value::String(m.as_str().trim().to_string())))
            })
            .collect(),
    )
}

#[async_trait]
impl FormatParser for TextLinesParser {
    fn format(&self) -> &'static str {
        "text_lines"
    }

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>> {
        let parsing = ctx.parsing();
        let pattern = parsing.pattern.as_deref().map(Regex::new).transpose()?;
        let separator = parsing.separator.as_deref();
        // enough columns for the highest one any field refers to
        let columns = parsing
            .fields
            .values()
            .map(|s| s.as_str())
            .chain(DEFAULT_FIELDS.iter().map(|(_, s)| *s))
            .filter_map(|s| s.parse::<usize>().ok())
            .max()
            .unwrap_or(2)
            + 1;

        let data = ctx.decompressor.decode(&payload.bytes, &payload.url).await?;
        let content = String::from_utf8(data)?;

        // capture groups are already named after canonical fields
        let defaults: &'static [(&str, &str)] = if pattern.is_some() { &[] } else { DEFAULT_FIELDS };
        let mapper = FieldMapper::new(ctx, defaults);
        let mut packages = Vec::new();
        let mut skipped = 0;

        for (index, line) in content.lines().enumerate() {
            checkpoint(index).await;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record = match &pattern {
                Some(pattern) => capture_record(pattern, trimmed),
                None => Some(split_columns(trimmed, separator, columns)),
            };
            match record.as_ref().and_then(|r| mapper.map(r)) {
                Some(package) => packages.push(package),
                None => skipped += 1,
            }
        }

        report_skipped(self.format(), &ctx.repository.name, packages.len(), skipped);
        Ok(packages)
    }
}
