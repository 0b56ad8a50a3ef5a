//! Upload gate. Runs before anything touches the blob store or the database.
use crate::error::{Result, ValidationError};

pub const DEFAULT_MAX_FILES: usize = 4;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_ALLOWED_TYPES: [&str; 3] = ["image/jpeg", "image/png", "application/pdf"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_files: usize,
    pub max_file_bytes: u64,
    pub allowed_types: Vec<String>,
}

/// One file of a submission, as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String, // as declared by the client
    pub bytes: Vec<u8>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allowed_types: DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl UploadFile {
    pub fn new(file_name: &str, content_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl UploadPolicy {
    fn allows(&self, content_type: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(content_type.trim()))
    }

    /// Checks the whole batch, stopping at the first offending file.
    pub fn validate(&self, files: &[UploadFile]) -> Result<()> {
        if files.is_empty() {
            return Err(ValidationError::NoFiles.into());
        }
        if files.len() > self.max_files {
            return Err(ValidationError::TooManyFiles {
                limit: self.max_files,
            }
            .into());
        }

        for file in files {
            if file.file_name.trim().is_empty() {
                return Err(ValidationError::EmptyFileName.into());
            }
            if file.bytes.is_empty() {
                return Err(ValidationError::EmptyFile {
                    file_name: file.file_name.clone(),
                }
                .into());
            }
            if file.size() > self.max_file_bytes {
                return Err(ValidationError::FileTooLarge {
                    file_name: file.file_name.clone(),
                    limit: self.max_file_bytes,
                }
                .into());
            }
            if !self.allows(&file.content_type) {
                return Err(ValidationError::UnsupportedType {
                    file_name: file.file_name.clone(),
                    content_type: file.content_type.clone(),
                }
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RxError;

    fn pdf(name: &str) -> UploadFile {
        UploadFile::new(name, "application/pdf", vec![1, 2, 3])
    }

    fn validation(err: RxError) -> ValidationError {
        match err {
            RxError::Validation(v) => v,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_default_types() {
        let files = vec![
            UploadFile::new("a.jpg", "image/jpeg", vec![0xff]),
            UploadFile::new("b.png", "IMAGE/PNG", vec![0x89]),
            pdf("c.pdf"),
        ];
        assert!(UploadPolicy::default().validate(&files).is_ok());
    }

    #[test]
    fn rejects_fifth_file() {
        let files: Vec<_> = (0..5).map(|i| pdf(&format!("{i}.pdf"))).collect();
        let err = validation(UploadPolicy::default().validate(&files).unwrap_err());
        assert_eq!(err, ValidationError::TooManyFiles { limit: 4 });
    }

    #[test]
    fn names_the_oversized_file() {
        let policy = UploadPolicy {
            max_file_bytes: 2,
            ..UploadPolicy::default()
        };
        let files = vec![
            UploadFile::new("ok.pdf", "application/pdf", vec![1]),
            pdf("big.pdf"),
        ];
        let err = validation(policy.validate(&files).unwrap_err());
        assert_eq!(
            err,
            ValidationError::FileTooLarge {
                file_name: "big.pdf".into(),
                limit: 2
            }
        );
    }

    #[test]
    fn stops_at_first_empty_name() {
        let files = vec![
            pdf("  "),
            UploadFile::new("evil.exe", "application/x-msdownload", vec![1]),
        ];
        let err = validation(UploadPolicy::default().validate(&files).unwrap_err());
        assert_eq!(err, ValidationError::EmptyFileName);
    }

    #[test]
    fn rejects_unlisted_type() {
        let files = vec![UploadFile::new("notes.txt", "text/plain", vec![1])];
        let err = validation(UploadPolicy::default().validate(&files).unwrap_err());
        assert!(matches!(err, ValidationError::UnsupportedType { file_name, .. } if file_name == "notes.txt"));
    }

    #[test]
    fn rejects_empty_batch() {
        let err = validation(UploadPolicy::default().validate(&[]).unwrap_err());
        assert_eq!(err, ValidationError::NoFiles);
    }
}
