use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::write::WriteController;
use crate::error::Result;
use crate::Error;

/// Holds the background error that puts the engine in read-only mode.
///
/// The first error wins until [`clear`](Self::clear). Setting one wakes writers
/// blocked on a write stall so they fail instead of waiting.
#[derive(Debug)]
pub(crate) struct ErrorHandler {
    set: AtomicBool,
    error: Mutex<Option<Error>>,
    controller: WriteController,
}

impl ErrorHandler {
    pub fn new(controller: WriteController) -> Self {
        Self {
            set: AtomicBool::new(false),
            error: Mutex::new(None),
            controller,
        }
    }

    pub fn check(&self) -> Result<()> {
        if !self.set.load(Ordering::Acquire) {
            return Ok(());
        }
        match &*self.error.lock() {
            Some(e) => Err(Error::ReadOnly(e.to_string())),
            None => Ok(()),
        }
    }

    pub fn set(&self, error: Error) {
        {
            let mut current = self.error.lock();
            if current.is_some() {
                return;
            }
            tracing::error!(error = %error, "Background error set, engine is read-only");
            *current = Some(error);
            self.set.store(true, Ordering::Release);
        }
        self.controller.notify_waiters();
    }

    pub fn current(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    pub fn clear(&self) {
        let mut current = self.error.lock();
        if let Some(e) = current.take() {
            tracing::info!(error = %e, "Background error cleared");
        }
        self.set.store(false, Ordering::Release);
    }
}
