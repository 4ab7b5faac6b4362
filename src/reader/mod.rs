//! Line-oriented log sources with transparent decompression.
//!
//! Rotated httpd logs arrive as plain text, gzip or xz; the suffix decides
//! which decoder wraps the file. Lines are decoded lossily so a stray
//! non-UTF-8 byte inside one line cannot abort a multi-gigabyte run.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;

/// Open a log file for line-oriented reading, decompressing `.gz`/`.xz` by
/// suffix.
pub fn open_log(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let reader: Box<dyn BufRead + Send> = match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))),
        Some("xz") => Box::new(BufReader::new(XzDecoder::new(BufReader::new(file)))),
        _ => Box::new(BufReader::new(file)),
    };
    Ok(reader)
}

/// Iterator over the lines of a reader, trailing newline stripped, invalid
/// UTF-8 replaced rather than rejected.
pub struct LogLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> LogLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for LogLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&self.buf).into_owned()))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_plain_lines() {
        let lines: Vec<_> = LogLines::new(&b"one\ntwo\r\nthree"[..])
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let lines: Vec<_> = LogLines::new(&b"ok\nbad\xff\xfeline\nok2\n"[..])
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ok");
        assert_eq!(lines[2], "ok2");
    }

    #[test]
    fn opens_gzip_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access_log.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"alpha\nbeta\n").unwrap();
        encoder.finish().unwrap();

        let lines: Vec<_> = LogLines::new(open_log(&path).unwrap())
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[test]
    fn opens_xz_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access_log.xz");
        let file = File::create(&path).unwrap();
        let mut encoder = xz2::write::XzEncoder::new(file, 6);
        encoder.write_all(b"alpha\nbeta\n").unwrap();
        encoder.finish().unwrap();

        let lines: Vec<_> = LogLines::new(open_log(&path).unwrap())
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(open_log(Path::new("/nonexistent/access_log")).is_err());
    }
}
