// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Kernel;
use crate::{arena::EntryBatch, file::DataFile};
use std::sync::Mutex;

struct PageCursor {
    current: Option<u32>,
    started: bool,
    done: bool,
}

/// Parallel page load: workers pull page ids from a shared cursor and
/// decode them into thread-local batches, which the build appends into
/// the arena afterwards.
pub(crate) struct LoadEntry<'a> {
    data: &'a dyn DataFile,
    cursor: Mutex<PageCursor>,
    batches: Mutex<Vec<EntryBatch>>,
}

impl<'a> LoadEntry<'a> {
    pub fn new(data: &'a dyn DataFile) -> Self {
        Self {
            data,
            cursor: Mutex::new(PageCursor {
                current: None,
                started: false,
                done: false,
            }),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn next_page(&self) -> crate::Result<Option<u32>> {
        #[allow(clippy::expect_used)]
        let mut cursor = self.cursor.lock().expect("lock is poisoned");

        if cursor.done {
            return Ok(None);
        }

        cursor.started = true;
        cursor.current = self.data.next_page_id(cursor.current)?;

        if cursor.current.is_none() {
            cursor.done = true;
        }

        Ok(cursor.current)
    }

    #[allow(clippy::expect_used)]
    pub fn into_batches(self) -> Vec<EntryBatch> {
        self.batches.into_inner().expect("lock is poisoned")
    }
}

impl Kernel for LoadEntry<'_> {
    fn parallel(&self, _worker: usize, _workers: usize) -> crate::Result<()> {
        let mut local = EntryBatch::default();
        local.reserve_rows(self.data.count_per_page());

        while let Some(page_id) = self.next_page()? {
            self.data.read_page(page_id, &mut local)?;
        }

        if local.len() > 0 {
            #[allow(clippy::expect_used)]
            self.batches.lock().expect("lock is poisoned").push(local);
        }

        Ok(())
    }
}
