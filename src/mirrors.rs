//! Metalink mirror lists (v3 as served by MirrorManager, and RFC 5854 v4).

use crate::error::{RepoError, RepoResult};
use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;

/// Protocols we are willing to fetch from, best first.
pub const PREFERRED_PROTOCOLS: [&str; 2] = ["https", "http"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub url: String,
    pub protocol: String,
    pub location: Option<String>,
    /// higher is better; v4 `priority` is folded into this by negation
    pub preference: i64,
}

impl Mirror {
    pub fn is_https(&self) -> bool {
        self.protocol == "https"
    }

    pub fn base_url(&self) -> String {
        repository_base(&self.url)
    }
}

/// Repository root of a URL pointing at `.../repodata/repomd.xml`.
pub fn repository_base(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let url = url.strip_suffix("repomd.xml").unwrap_or(url);
    let url = url.strip_suffix("repodata/").unwrap_or(url);
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorList {
    pub file_name: Option<String>,
    pub mirrors: Vec<Mirror>,
    /// every sha256 the document vouches for, alternates included
    pub sha256: HashSet<String>,
}

impl MirrorList {
    pub fn is_metalink(data: &[u8]) -> bool {
        let head = &data[..data.len().min(1024)];
        head.windows(b"<metalink".len()).any(|w| w == b"<metalink")
    }

    pub fn parse(data: &[u8]) -> RepoResult<Self> {
        let mut reader = Reader::from_reader(data);
        reader.trim_text(true);

        let mut list = MirrorList::default();
        let mut buf = Vec::new();
        let mut saw_root = false;
        let mut current_url: Option<(Option<String>, Option<String>, i64)> = None;
        let mut in_sha256 = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"metalink" => saw_root = true,
                    b"file" if list.file_name.is_none() => {
                        list.file_name = attribute(&e, b"name")?;
                    }
                    b"url" => current_url = Some(url_attributes(&e)?),
                    b"hash" => {
                        in_sha256 = attribute(&e, b"type")?.as_deref() == Some("sha256");
                    }
                    _ => {}
                },
                Event::Empty(e) if e.local_name().as_ref() == b"metalink" => saw_root = true,
                Event::Text(t) => {
                    let text = t.unescape()?;
                    if let Some((protocol, location, preference)) = current_url.take() {
                        let url = text.trim().to_string();
                        let protocol = protocol.unwrap_or_else(|| scheme_of(&url));
                        list.mirrors.push(Mirror {
                            url,
                            protocol,
                            location,
                            preference,
                        });
                    } else if in_sha256 {
                        list.sha256.insert(text.trim().to_lowercase());
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"url" => current_url = None,
                    b"hash" => in_sha256 = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !saw_root {
            return Err(RepoError::ParseError(
                "document is not a metalink".to_string(),
            ));
        }
        debug!("Metalink lists {} mirrors", list.mirrors.len());
        Ok(list)
    }

    /// Usable mirrors, HTTPS first, then by the document's own preference.
    /// Ties keep document order.
    pub fn ranked(&self) -> Vec<&Mirror> {
        let mut usable: Vec<&Mirror> = self
            .mirrors
            .iter()
            .filter(|m| PREFERRED_PROTOCOLS.contains(&m.protocol.as_str()))
            .collect();
        usable.sort_by_key(|m| {
            let rank = PREFERRED_PROTOCOLS
                .iter()
                .position(|p| *p == m.protocol)
                .unwrap_or(PREFERRED_PROTOCOLS.len());
            (rank, -m.preference)
        });
        usable
    }

    pub fn best(&self) -> Option<&Mirror> {
        self.ranked().into_iter().next()
    }

    /// True when the document lists no hashes, or lists this one.
    pub fn verifies(&self, data: &[u8]) -> bool {
        self.sha256.is_empty() || self.sha256.contains(&crate::utils::calculate_checksum(data))
    }
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

fn url_attributes(e: &BytesStart<'_>) -> RepoResult<(Option<String>, Option<String>, i64)> {
    let protocol = match attribute(e, b"protocol")? {
        Some(p) => Some(p.to_lowercase()),
        None => attribute(e, b"type")?.map(|t| t.to_lowercase()),
    };
    let location = attribute(e, b"location")?;
    let preference = match attribute(e, b"preference")? {
        Some(p) => p.trim().parse().unwrap_or(0),
        None => attribute(e, b"priority")?
            .and_then(|p| p.trim().parse::<i64>().ok())
            .map(|p| -p)
            .unwrap_or(0),
    };
    Ok((protocol, location, preference))
}

fn scheme_of(url: &str) -> String {
    url.split_once("://")
        .map(|(scheme, _)| scheme.to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const METALINK: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<metalink version="3.0" xmlns="http://www.metalinker.org/" xmlns:mm0="http://fedorahosted.org/mirrormanager">
 <files>
  <file name="repomd.xml">
   <mm0:timestamp>1713200000</mm0:timestamp>
   <verification>
    <hash type="md5">d41d8cd98f00b204e9800998ecf8427e</hash>
    <hash type="sha256">E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855</hash>
   </verification>
   <resources maxconnections="1">
    <url protocol="http" type="http" location="DE" preference="100">http://mirror.one.example/fedora/releases/40/Everything/x86_64/os/repodata/repomd.xml</url>
    <url protocol="rsync" type="rsync" location="DE" preference="100">rsync://mirror.one.example/fedora/releases/40/Everything/x86_64/os/repodata/repomd.xml</url>
    <url protocol="https" type="https" location="US" preference="90">https://mirror.two.example/pub/fedora/linux/releases/40/Everything/x86_64/os/repodata/repomd.xml</url>
   </resources>
  </file>
 </files>
</metalink>
"#;

    #[test]
    fn test_parse_fedora_metalink() {
        assert!(MirrorList::is_metalink(METALINK.as_bytes()));
        let list = MirrorList::parse(METALINK.as_bytes()).unwrap();
        assert_eq!(list.file_name.as_deref(), Some("repomd.xml"));
        assert_eq!(list.mirrors.len(), 3);
        assert_eq!(list.mirrors[0].location.as_deref(), Some("DE"));
        assert_eq!(list.sha256.len(), 1);
    }

    #[test]
    fn test_https_preferred_over_higher_preference_http() {
        let list = MirrorList::parse(METALINK.as_bytes()).unwrap();
        let best = list.best().unwrap();
        assert!(best.is_https());
        assert_eq!(
            best.base_url(),
            "https://mirror.two.example/pub/fedora/linux/releases/40/Everything/x86_64/os/"
        );
        let ranked: Vec<&str> = list.ranked().iter().map(|m| m.protocol.as_str()).collect();
        assert_eq!(ranked, vec!["https", "http"]);
    }

    #[test]
    fn test_metalink_v4_priority() {
        let doc = r#"<?xml version="1.0"?>
<metalink xmlns="urn:ietf:params:xml:ns:metalink">
  <file name="repomd.xml">
    <url location="se" priority="2">https://b.example/os/repodata/repomd.xml</url>
    <url location="de" priority="1">https://a.example/os/repodata/repomd.xml</url>
  </file>
</metalink>"#;
        let list = MirrorList::parse(doc.as_bytes()).unwrap();
        assert_eq!(list.best().unwrap().url, "https://a.example/os/repodata/repomd.xml");
        assert!(list.verifies(b"anything"));
    }

    #[test]
    fn test_hash_verification_is_case_insensitive() {
        let list = MirrorList::parse(METALINK.as_bytes()).unwrap();
        assert!(list.verifies(b""));
        assert!(!list.verifies(b"tampered"));
    }

    #[test]
    fn test_non_metalink_document_is_rejected() {
        let repomd = br#"<?xml version="1.0"?><repomd xmlns="http://linux.duke.edu/metadata/repo"></repomd>"#;
        assert!(!MirrorList::is_metalink(repomd));
        assert!(MirrorList::parse(repomd).is_err());
    }
}
