use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::SourceError;

use super::ByteSource;

/// Local file, optionally followed as it grows. A followed file never
/// reports a permanent EOF; the pump keeps polling it.
pub struct FileSource {
    path: PathBuf,
    file: File,
    follow: bool,
}

impl FileSource {
    pub fn open(path: &Path, follow: bool) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            follow,
        })
    }
}

impl ByteSource for FileSource {
    fn description(&self) -> String {
        self.path.display().to_string()
    }

    fn eof_is_permanent(&self) -> bool {
        !self.follow
    }

    fn could_stream(&self) -> bool {
        self.follow
    }

    fn declared_length(&self) -> Option<u64> {
        if self.follow {
            return None;
        }
        self.file.metadata().ok().map(|m| m.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_and_reports_length() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(b"0123456789").expect("write");
        let mut source = FileSource::open(tmp.path(), false).expect("open");
        assert_eq!(source.declared_length(), Some(10));
        assert!(source.eof_is_permanent());
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn followed_file_reports_transient_eof() {
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let source = FileSource::open(tmp.path(), true).expect("open");
        assert!(!source.eof_is_permanent());
        assert!(source.could_stream());
        assert_eq!(source.declared_length(), None);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = FileSource::open(Path::new("/no/such/tideline/file"), false);
        assert!(matches!(err, Err(SourceError::Open { .. })));
    }
}
