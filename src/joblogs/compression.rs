use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use brotli::CompressorWriter;
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use xz2::write::XzEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Gzip,
    Bzip2,
    Lzma,
    Brotli,
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(CompressionMethod::Gzip),
            "bzip2" => Ok(CompressionMethod::Bzip2),
            "lzma" => Ok(CompressionMethod::Lzma),
            "brotli" => Ok(CompressionMethod::Brotli),
            _ => Err(format!("unsupported compression method: {s}")),
        }
    }
}

impl CompressionMethod {
    /// Object-name suffix for this method.
    pub fn extension(self) -> &'static str {
        match self {
            CompressionMethod::Gzip => "gz",
            CompressionMethod::Bzip2 => "bz2",
            CompressionMethod::Lzma => "xz",
            CompressionMethod::Brotli => "br",
        }
    }

    /// Compresses `input` into a sibling temporary file and returns its
    /// path. The caller owns the returned file.
    pub fn compress(self, input: &Path) -> io::Result<PathBuf> {
        let dir = input.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .suffix(&format!(".log.{}", self.extension()))
            .tempfile_in(dir)?;
        let (file, path) = temp.keep().map_err(|err| err.error)?;

        let mut reader = File::open(input)?;
        let result = self.compress_into(&mut reader, file);
        if result.is_err() {
            let _ = std::fs::remove_file(&path);
        }
        result.map(|_| path)
    }

    fn compress_into(self, reader: &mut File, file: File) -> io::Result<()> {
        match self {
            CompressionMethod::Gzip => {
                let mut encoder = GzEncoder::new(file, flate2::Compression::default());
                io::copy(reader, &mut encoder)?;
                encoder.finish()?;
            }
            CompressionMethod::Bzip2 => {
                let mut encoder = BzEncoder::new(file, bzip2::Compression::default());
                io::copy(reader, &mut encoder)?;
                encoder.finish()?;
            }
            CompressionMethod::Lzma => {
                let mut encoder = XzEncoder::new(file, 6);
                io::copy(reader, &mut encoder)?;
                encoder.finish()?;
            }
            CompressionMethod::Brotli => {
                let mut writer = CompressorWriter::new(file, 4096, 11, 22);
                io::copy(reader, &mut writer)?;
                writer.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn method_names_parse() {
        assert_eq!("gzip".parse::<CompressionMethod>().unwrap(), CompressionMethod::Gzip);
        assert_eq!("bzip2".parse::<CompressionMethod>().unwrap(), CompressionMethod::Bzip2);
        assert_eq!("lzma".parse::<CompressionMethod>().unwrap(), CompressionMethod::Lzma);
        assert_eq!("brotli".parse::<CompressionMethod>().unwrap(), CompressionMethod::Brotli);
        assert!("zip".parse::<CompressionMethod>().is_err());
    }

    #[test]
    fn extensions_match_methods() {
        assert_eq!(CompressionMethod::Gzip.extension(), "gz");
        assert_eq!(CompressionMethod::Bzip2.extension(), "bz2");
        assert_eq!(CompressionMethod::Lzma.extension(), "xz");
        assert_eq!(CompressionMethod::Brotli.extension(), "br");
    }

    #[test]
    fn gzip_compression_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.log");
        let content = "line one\nline two\n".repeat(500);
        std::fs::write(&input, &content).unwrap();

        let compressed = CompressionMethod::Gzip.compress(&input).unwrap();
        assert!(compressed.to_string_lossy().ends_with(".log.gz"));
        assert!(compressed.parent() == input.parent());

        let mut decoder = flate2::read::GzDecoder::new(File::open(&compressed).unwrap());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, content);
    }

    #[test]
    fn brotli_compression_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.log");
        let content = "brotli me\n".repeat(200);
        std::fs::write(&input, &content).unwrap();

        let compressed = CompressionMethod::Brotli.compress(&input).unwrap();
        assert!(compressed.to_string_lossy().ends_with(".log.br"));

        let mut decoder = brotli::Decompressor::new(File::open(&compressed).unwrap(), 4096);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, content);
    }
}
