use crate::error::{RepoError, RepoResult};
use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Xz,
    Zstd,
    Bzip2,
    None,
}

impl CompressionFormat {
    pub fn from_path(path: &str) -> Self {
        // strip query strings before looking at the extension
        let path = path.split(['?', '#']).next().unwrap_or(path);
        match path.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()) {
            Some(ext) => match ext.as_str() {
                "gz" | "gzip" | "tgz" => Self::Gzip,
                "xz" => Self::Xz,
                "zst" | "zstd" => Self::Zstd,
                "bz2" => Self::Bzip2,
                _ => Self::None,
            },
            None => Self::None,
        }
    }

    pub fn from_magic(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else if data.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else if data.starts_with(b"BZh") {
            Self::Bzip2
        } else {
            Self::None
        }
    }

    /// Magic bytes win; the URL extension is only a fallback.
    pub fn detect(data: &[u8], url: &str) -> Self {
        match Self::from_magic(data) {
            Self::None => Self::from_path(url),
            found => found,
        }
    }
}

/// Streaming decompressor with a hard ceiling on output size.
#[derive(Debug, Clone, Copy)]
pub struct Decompressor {
    max_bytes: u64,
}

impl Decompressor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Decompresses `data` if it looks compressed, otherwise returns it as is.
    pub async fn decode(&self, data: &[u8], url: &str) -> RepoResult<Vec<u8>> {
        let format = CompressionFormat::detect(data, url);
        if format == CompressionFormat::None {
            if data.len() as u64 > self.max_bytes {
                return Err(RepoError::DecompressionError(format!(
                    "payload from {} is {} bytes, limit is {}",
                    url,
                    data.len(),
                    self.max_bytes
                )));
            }
            return Ok(data.to_vec());
        }
        self.decompress(data, format).await
    }

    pub async fn decompress(&self, data: &[u8], format: CompressionFormat) -> RepoResult<Vec<u8>> {
        debug!(
            "Decompressing {} bytes as {:?} (limit {})",
            data.len(),
            format,
            self.max_bytes
        );
        let output = match format {
            CompressionFormat::Gzip => {
                let mut decoder = GzipDecoder::new(data);
                decoder.multiple_members(true);
                self.read_bounded(decoder).await?
            }
            CompressionFormat::Xz => self.read_bounded(XzDecoder::new(data)).await?,
            CompressionFormat::Zstd => self.read_bounded(ZstdDecoder::new(data)).await?,
            CompressionFormat::Bzip2 => self.read_bounded(BzDecoder::new(data)).await?,
            CompressionFormat::None => data.to_vec(),
        };
        debug!("Decompression complete: {} bytes", output.len());
        Ok(output)
    }

    async fn read_bounded<R: AsyncRead + Unpin>(&self, mut decoder: R) -> RepoResult<Vec<u8>> {
        let mut output = Vec::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = decoder
                .read(&mut buffer)
                .await
                .map_err(|e| RepoError::DecompressionError(e.to_string()))?;
            if n == 0 {
                break;
            }
            if output.len() as u64 + n as u64 > self.max_bytes {
                return Err(RepoError::DecompressionError(format!(
                    "decompressed size exceeds limit of {} bytes",
                    self.max_bytes
                )));
            }
            output.extend_from_slice(&buffer[..n]);
            // in-memory input never blocks, so give deadlines a chance to fire
            tokio::task::yield_now().await;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use std::task::Poll;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect_prefers_magic_over_extension() {
        let gz = gzip(b"hello");
        assert_eq!(CompressionFormat::detect(&gz, "primary.xml"), CompressionFormat::Gzip);
        assert_eq!(
            CompressionFormat::detect(b"<xml/>", "primary.xml.zst"),
            CompressionFormat::Zstd
        );
        assert_eq!(
            CompressionFormat::from_path("https://a/Packages.gz?x=1"),
            CompressionFormat::Gzip
        );
        assert_eq!(CompressionFormat::from_path("repomd.xml"), CompressionFormat::None);
    }

    #[tokio::test]
    async fn test_gzip_roundtrip_within_limit() {
        let data = b"Package: curl\nVersion: 8.5.0\n\n".repeat(10);
        let decoded = Decompressor::new(1024 * 1024)
            .decode(&gzip(&data), "Packages.gz")
            .await
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn test_zstd_bomb_is_rejected() {
        // 8 MiB of zeros squeezes into a few hundred bytes
        let bomb = zstd::encode_all(&vec![0u8; 8 * 1024 * 1024][..], 19).unwrap();
        assert!(bomb.len() < 64 * 1024);
        let err = Decompressor::new(1024 * 1024)
            .decode(&bomb, "primary.xml.zst")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::DecompressionError(_)));
        assert!(err.is_parse_failure());
    }

    #[tokio::test]
    async fn test_large_decode_yields_between_chunks() {
        let data = vec![b'a'; 1024 * 1024];
        let compressed = zstd::encode_all(&data[..], 3).unwrap();
        let decompressor = Decompressor::new(4 * 1024 * 1024);

        let mut decode = tokio_test::task::spawn(decompressor.decode(&compressed, "Packages.zst"));
        tokio_test::assert_pending!(decode.poll());
        let output = loop {
            if let Poll::Ready(result) = decode.poll() {
                break result.unwrap();
            }
        };
        assert_eq!(output, data);
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_decompression_error() {
        let mut data = gzip(b"some metadata that will be damaged");
        let len = data.len();
        data.truncate(len / 2);
        let err = Decompressor::new(1024).decode(&data, "x.gz").await.unwrap_err();
        assert!(matches!(err, RepoError::DecompressionError(_)));
    }

    #[tokio::test]
    async fn test_uncompressed_payload_passes_through() {
        let decoded = Decompressor::new(64).decode(b"plain", "index.txt").await.unwrap();
        assert_eq!(decoded, b"plain");
        assert!(Decompressor::new(2).decode(b"plain", "index.txt").await.is_err());
    }
}
