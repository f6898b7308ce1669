//! RPM repository metadata: `repomd.xml` (optionally behind a metalink) and
//! the compressed `primary.xml` it points at.

use super::{checkpoint, report_skipped, FieldMapper, FormatParser, ParseContext};
use crate::{
    error::{RepoError, RepoResult},
    fetcher::RawPayload,
    mirrors::{repository_base, MirrorList},
    package::Package,
    utils::{calculate_checksum, join_url},
};
use async_trait::async_trait;
use log::{debug, info, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

pub struct RepomdParser;

const DEFAULT_FIELDS: &[(&str, &str)] = &[
    ("description", "summary"),
    ("homepage", "url"),
    ("maintainer", "packager"),
    ("category", "group"),
    ("dependencies", "requires"),
    ("download_url", "location"),
    ("architecture", "arch"),
    ("last_updated", "build_time"),
];

/// The `<data type="primary">` entry of a repomd document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryLocation {
    pub href: String,
    /// sha256 of the file as stored (compressed)
    pub sha256: Option<String>,
    pub open_size: Option<u64>,
}

/// Finds the primary metadata entry. A document without one, or that is not a
/// repomd document at all, is a parse error.
pub fn locate_primary(repomd: &[u8]) -> RepoResult<PrimaryLocation> {
    let mut reader = Reader::from_reader(repomd);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut saw_root = false;
    let mut in_primary = false;
    let mut text_target: Option<&'static str> = None;
    let mut checksum_is_sha256 = false;
    let mut found: Option<PrimaryLocation> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"repomd" => saw_root = true,
                b"data" => {
                    in_primary = attribute(&e, b"type")?.as_deref() == Some("primary");
                    if in_primary {
                        found = Some(PrimaryLocation {
                            href: String::new(),
                            sha256: None,
                            open_size: None,
                        });
                    }
                }
                b"checksum" if in_primary => {
                    checksum_is_sha256 = attribute(&e, b"type")?.as_deref() == Some("sha256");
                    text_target = Some("checksum");
                }
                b"open-size" if in_primary => text_target = Some("open-size"),
                b"location" if in_primary => set_href(&mut found, &e)?,
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"location" && in_primary {
                    set_href(&mut found, &e)?;
                }
            }
            Event::Text(t) => {
                if let (Some(target), Some(location)) = (text_target, found.as_mut()) {
                    let text = t.unescape()?.trim().to_string();
                    match target {
                        "checksum" if checksum_is_sha256 => {
                            location.sha256 = Some(text.to_lowercase())
                        }
                        "open-size" => location.open_size = text.parse().ok(),
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                text_target = None;
                if e.local_name().as_ref() == b"data" && in_primary {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(RepoError::ParseError(
            "document is not a repomd index".to_string(),
        ));
    }
    match found {
        Some(location) if !location.href.is_empty() => Ok(location),
        _ => Err(RepoError::ParseError(
            "repomd index has no primary metadata entry".to_string(),
        )),
    }
}

fn set_href(found: &mut Option<PrimaryLocation>, e: &BytesStart<'_>) -> RepoResult<()> {
    if let (Some(location), Some(href)) = (found.as_mut(), attribute(e, b"href")?) {
        location.href = href;
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> RepoResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Streams `<package>` elements out of primary.xml into flat records.
///
/// Version is `ver-rel`; epoch and the other rpm-only bits stay as extra keys.
async fn primary_records(xml: &[u8]) -> RepoResult<Vec<Map<String, Value>>> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut saw_root = false;
    let mut records = Vec::new();
    let mut current: Option<Map<String, Value>> = None;
    let mut requires: Vec<Value> = Vec::new();
    let mut in_requires = false;
    let mut text_key: Option<String> = None;
    let mut events = 0usize;

    loop {
        events += 1;
        checkpoint(events).await;
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let is_start = matches!(event, Event::Start(_));
                let local = e.local_name();
                match local.as_ref() {
                    b"metadata" => saw_root = true,
                    b"package" => {
                        if is_start {
                            current = Some(Map::new());
                            requires.clear();
                        }
                    }
                    _ if current.is_none() => {}
                    b"version" => {
                        if let Some(record) = current.as_mut() {
                            read_version(record, e)?;
                        }
                    }
                    b"time" => {
                        if let (Some(record), Some(build)) = (current.as_mut(), attribute(e, b"build")?) {
                            record.insert("build_time".to_string(), Value::String(build));
                        }
                    }
                    b"size" => {
                        if let Some(record) = current.as_mut() {
                            if let Some(size) = attribute(e, b"package")? {
                                record.insert("size".to_string(), Value::String(size));
                            }
                            if let Some(size) = attribute(e, b"installed")? {
                                record.insert("installed_size".to_string(), Value::String(size));
                            }
                        }
                    }
                    b"location" => {
                        if let (Some(record), Some(href)) = (current.as_mut(), attribute(e, b"href")?) {
                            record.insert("location".to_string(), Value::String(href));
                        }
                    }
                    b"requires" => in_requires = is_start,
                    b"entry" if in_requires => {
                        if let Some(name) = attribute(e, b"name")? {
                            // rpmlib() capabilities are not real packages
                            if !name.starts_with("rpmlib(") && !name.starts_with('/') {
                                requires.push(Value::String(name));
                            }
                        }
                    }
                    b"name" | b"arch" | b"summary" | b"description" | b"packager" | b"url"
                    | b"license" | b"group" | b"vendor" | b"sourcerpm" | b"checksum" => {
                        if is_start {
                            text_key = Some(String::from_utf8_lossy(local.as_ref()).into_owned());
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let (Some(key), Some(record)) = (text_key.as_ref(), current.as_mut()) {
                    let text = t.unescape()?;
                    record.insert(key.clone(), Value::String(text.trim().to_string()));
                }
            }
            Event::CData(c) => {
                if let (Some(key), Some(record)) = (text_key.as_ref(), current.as_mut()) {
                    let text = String::from_utf8_lossy(c.as_ref()).trim().to_string();
                    record.insert(key.clone(), Value::String(text));
                }
            }
            Event::End(e) => {
                text_key = None;
                match e.local_name().as_ref() {
                    b"requires" => in_requires = false,
                    b"package" => {
                        if let Some(mut record) = current.take() {
                            if !requires.is_empty() {
                                record.insert(
                                    "requires".to_string(),
                                    Value::Array(std::mem::take(&mut requires)),
                                );
                            }
                            records.push(record);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(RepoError::ParseError(
            "primary metadata has no <metadata> root".to_string(),
        ));
    }
    Ok(records)
}

fn read_version(record: &mut Map<String, Value>, e: &BytesStart<'_>) -> RepoResult<()> {
    let ver = attribute(e, b"ver")?.filter(|v| !v.is_empty());
    let rel = attribute(e, b"rel")?.filter(|r| !r.is_empty());
    if let Some(epoch) = attribute(e, b"epoch")? {
        record.insert("epoch".to_string(), Value::String(epoch));
    }
    if let Some(rel) = &rel {
        record.insert("release".to_string(), Value::String(rel.clone()));
    }
    if let Some(ver) = ver {
        let version = match rel {
            Some(rel) => format!("{}-{}", ver, rel),
            None => ver,
        };
        record.insert("version".to_string(), Value::String(version));
    }
    Ok(())
}

impl RepomdParser {
    /// Returns the repomd document and the repository base URL it belongs to.
    /// A metalink is followed to one mirror; a metalink that points at another
    /// metalink is rejected.
    async fn resolve_index(
        &self,
        payload: &RawPayload,
        ctx: &ParseContext<'_>,
    ) -> RepoResult<(Vec<u8>, String)> {
        let data = ctx.decompressor.decode(&payload.bytes, &payload.url).await?;
        if !MirrorList::is_metalink(&data) {
            return Ok((data, repository_base(&payload.url)));
        }

        let mirrors = MirrorList::parse(&data)?;
        let ranked = mirrors.ranked();
        if ranked.is_empty() {
            return Err(RepoError::ParseError(format!(
                "metalink {} lists no usable mirrors",
                payload.url
            )));
        }

        let mut last_error = None;
        for mirror in ranked.into_iter().take(ctx.max_mirror_attempts) {
            debug!("Trying mirror {} for {}", mirror.url, ctx.repository.name);
            let fetched = match ctx.documents.fetch_document(&mirror.url).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!("Mirror {} failed: {}", mirror.url, e);
                    last_error = Some(e);
                    continue;
                }
            };
            let index = ctx.decompressor.decode(&fetched.bytes, &fetched.url).await?;
            if MirrorList::is_metalink(&index) {
                return Err(RepoError::ParseError(format!(
                    "mirror {} returned another metalink",
                    mirror.url
                )));
            }
            if !mirrors.verifies(&fetched.bytes) {
                warn!("Mirror {} serves a repomd.xml that does not match the metalink", mirror.url);
                last_error = Some(RepoError::ParseError(format!(
                    "checksum mismatch for {}",
                    mirror.url
                )));
                continue;
            }
            info!("Using mirror {} for {}", mirror.base_url(), ctx.repository.name);
            return Ok((index, mirror.base_url()));
        }

        Err(last_error.unwrap_or_else(|| {
            RepoError::fetch(&payload.url, "no mirror could be reached")
        }))
    }
}

#[async_trait]
impl FormatParser for RepomdParser {
    fn format(&self) -> &'static str {
        "rpm_metadata"
    }

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>> {
        let (index, base_url) = self.resolve_index(payload, ctx).await?;
        let primary = locate_primary(&index)?;
        if let Some(open_size) = primary.open_size {
            if open_size > ctx.decompressor.max_bytes() {
                return Err(RepoError::DecompressionError(format!(
                    "primary metadata declares {} bytes, limit is {}",
                    open_size,
                    ctx.decompressor.max_bytes()
                )));
            }
        }

        let primary_url = join_url(&base_url, &primary.href)?;
        debug!("Downloading primary metadata from {}", primary_url);
        let fetched = ctx.documents.fetch_document(&primary_url).await?;
        if let Some(expected) = &primary.sha256 {
            let actual = calculate_checksum(&fetched.bytes);
            if &actual != expected {
                return Err(RepoError::ParseError(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    primary_url, expected, actual
                )));
            }
        }
        let xml = ctx.decompressor.decode(&fetched.bytes, &primary_url).await?;

        let mapper = FieldMapper::new(ctx, DEFAULT_FIELDS);
        let mut packages = Vec::new();
        let mut skipped = 0;
        for (index, record) in primary_records(&xml).await?.into_iter().enumerate() {
            checkpoint(index).await;
            match mapper.map(&record) {
                Some(mut package) => {
                    if let Some(href) = package.download_url.as_deref() {
                        if !href.contains("://") {
                            package.download_url = join_url(&base_url, href).ok();
                        }
                    }
                    packages.push(package);
                }
                None => skipped += 1,
            }
        }

        report_skipped(self.format(), &ctx.repository.name, packages.len(), skipped);
        Ok(packages)
    }
}
