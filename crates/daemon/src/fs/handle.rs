use bytes::Bytes;

use super::attrs::Attributes;

/// Content captured when a file was opened.
///
/// Reads never reach the cache or the backend, so a handle keeps serving
/// the same bytes however the secret changes afterwards.
#[derive(Debug, Clone)]
pub struct FileHandle {
    attributes: Attributes,
    content: Bytes,
}

impl FileHandle {
    pub(crate) fn new(attributes: Attributes, content: Bytes) -> Self {
        Self {
            attributes,
            content,
        }
    }

    /// Attributes as of open time
    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Up to `size` bytes starting at `offset`; empty past the end
    pub fn read(&self, offset: u64, size: usize) -> Bytes {
        let len = self.content.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size).min(len);
        self.content.slice(start..end)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::attrs::Attributes;
    use crate::ownership::Ownership;

    #[test]
    fn test_read_ranges() {
        let handle = FileHandle::new(
            Attributes::file(0o400, 6, Ownership::new(0, 0)),
            Bytes::from_static(b"secret"),
        );

        assert_eq!(handle.read(0, 100).as_ref(), b"secret");
        assert_eq!(handle.read(2, 3).as_ref(), b"cre");
        assert!(handle.read(6, 10).is_empty());
        assert!(handle.read(u64::MAX, usize::MAX).is_empty());
        assert_eq!(handle.attributes().size, handle.len() as u64);
    }
}
