//! The per-step write pipeline: replacer in front, stream buffer behind.
//!
//! Executors write raw bytes here; subscribers and snapshot readers only
//! ever see masked text. `close` flushes the masker tail, runs the
//! fallback literal pass over the retained lines, then closes the buffer.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::buffer::StreamBuffer;
use crate::mask::Replacer;

pub struct StepLog {
    masker: Mutex<Replacer>,
    buffer: Arc<StreamBuffer>,
    closed: Mutex<bool>,
}

impl StepLog {
    pub fn new(masker: Replacer, buffer: Arc<StreamBuffer>) -> Arc<Self> {
        Arc::new(Self {
            masker: Mutex::new(masker),
            buffer,
            closed: Mutex::new(false),
        })
    }

    /// Mask and append raw output bytes.
    pub fn write(&self, bytes: &[u8]) {
        let masked = self.masker.lock().feed(bytes);
        self.buffer.write(&masked);
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    /// Flush, run the belt-and-braces pass, close the buffer. Idempotent.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        let mut masker = self.masker.lock();
        let tail = masker.finish();
        self.buffer.write(&tail);
        if !masker.is_empty() {
            self.buffer.remask(|text| masker.mask_all(text));
        }
        self.buffer.close();
    }
}
