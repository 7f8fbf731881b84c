// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{paged::PagedFile, MAGIC_BYTES};
use std::path::Path;

const FLIP_OFFSET: usize = 4;
const PROCEEDING_OFFSET: usize = 5;

/// Which of the two small files currently plays which part
///
/// The persisted flip bit names the executor side; the other file is
/// the merge side. Every "which file?" question is a total function of
/// this role plus the merge-in-progress flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmallRole {
    /// The first small file / index chain
    Primary,

    /// The second small file / index chain
    Secondary,
}

impl SmallRole {
    /// The opposite role.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

/// Single-page control file: flip bit + merge-in-progress flag
///
/// Both flags are written under the file latch with discardable writes,
/// so a failed toggle reverts on recovery.
pub(crate) struct InfoFile {
    paged: PagedFile,
}

impl InfoFile {
    pub fn open(path: &Path, page_size: usize) -> crate::Result<Self> {
        let paged = PagedFile::open(path, page_size)?;

        if paged.committed_pages() == 0 {
            let mut page = vec![0u8; page_size];
            #[allow(clippy::indexing_slicing)]
            page[..4].copy_from_slice(&MAGIC_BYTES);
            paged.update(0, page);
            paged.flush(None)?;
        } else {
            let page = paged.fix(0)?;
            if page.get(..4) != Some(&MAGIC_BYTES) {
                return Err(crate::Error::InvalidHeader("info file"));
            }
        }

        Ok(Self { paged })
    }

    /// The small file currently accepting writes.
    #[allow(clippy::indexing_slicing)]
    pub fn executor_role(&self) -> crate::Result<SmallRole> {
        let page = self.paged.fix(0)?;
        Ok(if page[FLIP_OFFSET] == 0 {
            SmallRole::Primary
        } else {
            SmallRole::Secondary
        })
    }

    /// `true` while a merge is draining the merge side.
    #[allow(clippy::indexing_slicing)]
    pub fn is_proceeding(&self) -> crate::Result<bool> {
        let page = self.paged.fix(0)?;
        Ok(page[PROCEEDING_OFFSET] != 0)
    }

    /// Swaps the small-file roles and marks the merge as in progress.
    pub fn flip(&self) -> crate::Result<()> {
        self.paged.modify(0, |page| {
            #[allow(clippy::indexing_slicing)]
            {
                page[FLIP_OFFSET] = u8::from(page[FLIP_OFFSET] == 0);
                page[PROCEEDING_OFFSET] = 1;
            }
        })
    }

    /// Clears the merge-in-progress flag.
    pub fn merge_done(&self) -> crate::Result<()> {
        self.paged.modify(0, |page| {
            #[allow(clippy::indexing_slicing)]
            {
                page[PROCEEDING_OFFSET] = 0;
            }
        })
    }

    pub fn flush(&self) -> crate::Result<()> {
        self.paged.flush(None)
    }

    pub fn recover(&self) {
        self.paged.recover();
    }

    pub fn verify(&self) -> crate::Result<()> {
        let page = self.paged.fix(0)?;
        if page.get(..4) == Some(&MAGIC_BYTES) {
            Ok(())
        } else {
            Err(crate::Error::InvalidHeader("info file"))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use test_log::test;

    #[test]
    fn flip_toggles_and_persists() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("info");

        {
            let info = InfoFile::open(&path, 64)?;
            assert_eq!(SmallRole::Primary, info.executor_role()?);
            assert!(!info.is_proceeding()?);

            info.flip()?;
            info.flush()?;

            assert_eq!(SmallRole::Secondary, info.executor_role()?);
            assert!(info.is_proceeding()?);

            info.merge_done()?;
            info.flush()?;
            assert!(!info.is_proceeding()?);
        }

        let info = InfoFile::open(&path, 64)?;
        assert_eq!(SmallRole::Secondary, info.executor_role()?);
        Ok(())
    }

    #[test]
    fn failed_flip_reverts_on_recovery() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let info = InfoFile::open(&dir.path().join("info"), 64)?;

        info.flip()?;
        info.recover();

        assert_eq!(SmallRole::Primary, info.executor_role()?);
        assert!(!info.is_proceeding()?);
        Ok(())
    }

    #[test]
    fn roles_are_total() {
        assert_eq!(SmallRole::Secondary, SmallRole::Primary.other());
        assert_eq!(SmallRole::Primary, SmallRole::Primary.other().other());
    }
}
