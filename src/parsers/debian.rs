//! Debian `Packages` indexes (deb822 stanzas).

use super::{checkpoint, report_skipped, FieldMapper, FormatParser, ParseContext};
use crate::{
    error::{RepoError, RepoResult},
    fetcher::RawPayload,
    package::Package,
    utils::join_url,
};
use async_trait::async_trait;
use serde_json::{Map, Value};

const DEFAULT_FIELDS: &[(&str, &str)] = &[
    ("name", "Package"),
    ("version", "Version"),
    ("description", "Description"),
    ("homepage", "Homepage"),
    ("maintainer", "Maintainer"),
    ("size", "Size"),
    ("category", "Section"),
    ("dependencies", "Depends"),
    ("tags", "Tag"),
    ("checksum", "SHA256"),
    ("download_url", "Filename"),
    ("architecture", "Architecture"),
];

pub struct DebianPackagesParser;

/// Splits an index into stanzas of `Key: value` pairs. Continuation lines are
/// folded into the previous field; for `Description` only the synopsis is kept.
/// A stanza with a line that is neither a field nor a continuation is `Err`.
async fn stanzas(content: &str) -> Vec<Result<Map<String, Value>, ()>> {
    let mut result = Vec::new();
    let mut current = Map::new();
    let mut broken = false;
    let mut last_key: Option<String> = None;

    let mut flush = |current: &mut Map<String, Value>, broken: &mut bool| {
        if !current.is_empty() || *broken {
            let stanza = std::mem::take(current);
            result.push(if *broken { Err(()) } else { Ok(stanza) });
        }
        *broken = false;
    };

    for (index, line) in content.lines().enumerate() {
        checkpoint(index).await;
        if line.trim().is_empty() {
            flush(&mut current, &mut broken);
            last_key = None;
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // multi-line descriptions are not worth keeping
            match last_key.as_deref() {
                Some("Description") | None => {}
                Some(key) => {
                    if let Some(Value::String(existing)) = current.get_mut(key) {
                        existing.push(' ');
                        existing.push_str(line.trim());
                    }
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                let key = key.trim().to_string();
                current.insert(key.clone(), Value::String(value.trim().to_string()));
                last_key = Some(key);
            }
            _ => broken = true,
        }
    }
    flush(&mut current, &mut broken);
    result
}

// Filenames are relative to the archive root, the part before `/dists/`.
fn archive_root(index_url: &str) -> Option<&str> {
    index_url.find("/dists/").map(|idx| &index_url[..idx])
}

#[async_trait]
impl FormatParser for DebianPackagesParser {
    fn format(&self) -> &'static str {
        "debian_packages"
    }

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>> {
        let data = ctx.decompressor.decode(&payload.bytes, &payload.url).await?;
        let content = String::from_utf8_lossy(&data);

        let stanzas = stanzas(&content).await;
        if !content.trim().is_empty() && !stanzas.iter().any(|s| s.is_ok()) {
            return Err(RepoError::ParseError(format!(
                "{} is not a Debian Packages index",
                payload.url
            )));
        }

        let mapper = FieldMapper::new(ctx, DEFAULT_FIELDS);
        let root = archive_root(&payload.url);
        let mut packages = Vec::with_capacity(stanzas.len());
        let mut skipped = 0;

        for (index, stanza) in stanzas.into_iter().enumerate() {
            checkpoint(index).await;
            let Some(mut package) = stanza.ok().and_then(|s| mapper.map(&s)) else {
                skipped += 1;
                continue;
            };
            if let (Some(root), Some(file)) = (root, package.download_url.as_deref()) {
                if !file.contains("://") {
                    package.download_url = join_url(root, file).ok();
                }
            }
            packages.push(package);
        }

        report_skipped(self.format(), &ctx.repository.name, packages.len(), skipped);
        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::compression::Decompressor;

    const INDEX: &str = "\
Package: curl
Architecture: amd64
Version: 7.81.0-1ubuntu1.15
Priority: optional
Section: web
Maintainer: Ubuntu Developers <ubuntu-devel-discuss@lists.ubuntu.com>
Installed-Size: 453
Depends: libc6 (>= 2.34), libcurl4 (= 7.81.0-1ubuntu1.15), zlib1g (>= 1:1.1.4)
Filename: pool/main/c/curl/curl_7.81.0-1ubuntu1.15_amd64.deb
Size: 194522
SHA256: 0b1a2c3d
Homepage: https://curl.se/
Description: command line tool for transferring data with URL syntax
 This is a command line tool and library for transferring data with URL
 syntax.

Package: nginx
Architecture: amd64
Version: 1.18.0-6ubuntu14.4
Section: httpd
Description: small, powerful, scalable web/proxy server

Architecture: all
Version: 1.0
Description: stanza without a package name
";

    async fn parse(content: &[u8], url: &str) -> RepoResult<Vec<Package>> {
        let repo = repository("debian_packages", &[]);
        let docs = StaticDocuments::default();
        let ctx = ParseContext::new(&repo, Decompressor::new(1 << 20), &docs);
        let payload = RawPayload::new(url, content.to_vec());
        DebianPackagesParser.parse(&payload, &ctx).await
    }

    #[tokio::test]
    async fn test_parse_gzipped_index() {
        let url = "http://archive.ubuntu.com/ubuntu/dists/jammy/main/binary-amd64/Packages.gz";
        let packages = parse(&gzip(INDEX.as_bytes()), url).await.unwrap();
        assert_eq!(packages.len(), 2);

        let curl = &packages[0];
        assert_eq!(curl.name, "curl");
        assert_eq!(curl.version, "7.81.0-1ubuntu1.15");
        assert_eq!(
            curl.description.as_deref(),
            Some("command line tool for transferring data with URL syntax")
        );
        assert_eq!(curl.size, Some(194522));
        assert_eq!(curl.category.as_deref(), Some("web"));
        assert_eq!(
            curl.dependencies.as_deref(),
            Some(&["libc6".to_string(), "libcurl4".to_string(), "zlib1g".to_string()][..])
        );
        assert_eq!(
            curl.download_url.as_deref(),
            Some("http://archive.ubuntu.com/ubuntu/pool/main/c/curl/curl_7.81.0-1ubuntu1.15_amd64.deb")
        );
        assert_eq!(curl.extra.get("Priority"), Some(&serde_json::json!("optional")));
        assert_eq!(packages[1].name, "nginx");
    }

    #[tokio::test]
    async fn test_hundred_records_and_one_without_name() {
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("Package: pkg{}\nVersion: 1.{}\n\n", i, i));
        }
        content.push_str("Version: 9.9\nDescription: nameless\n\n");
        let packages = parse(content.as_bytes(), "https://deb.example/Packages").await.unwrap();
        assert_eq!(packages.len(), 100);
    }

    #[tokio::test]
    async fn test_garbage_is_a_parse_error() {
        let err = parse(b"<html><body>502 Bad Gateway</body></html>", "https://deb.example/Packages")
            .await
            .unwrap_err();
        assert!(err.is_parse_failure());
    }

    #[tokio::test]
    async fn test_long_index_yields_to_the_runtime() {
        let mut content = String::new();
        for i in 0..2000 {
            content.push_str(&format!("Package: pkg{}\nVersion: 1.{}\n\n", i, i));
        }
        let mut parsing = tokio_test::task::spawn(parse(content.as_bytes(), "https://deb.example/Packages"));
        tokio_test::assert_pending!(parsing.poll());
        let packages = loop {
            if let std::task::Poll::Ready(result) = parsing.poll() {
                break result.unwrap();
            }
        };
        assert_eq!(packages.len(), 2000);
    }

    #[tokio::test]
    async fn test_empty_index_is_empty() {
        assert!(parse(b"", "https://deb.example/Packages").await.unwrap().is_empty());
    }
}
