//! In-memory transport for unit tests.

use std::io;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::sync::Notify;

use crate::transport::{ResponsePart, Transport, WriteFuture};

/// Records every part written to it. Optionally starts failing after a
/// fixed number of successful writes.
#[derive(Default)]
pub(crate) struct Recorder {
    parts: Mutex<Vec<ResponsePart>>,
    fail_after: Option<usize>,
    ended: Notify,
}

impl Recorder {
    pub(crate) fn failing_after(writes: usize) -> Self {
        Self { fail_after: Some(writes), ..Self::default() }
    }

    pub(crate) fn parts(&self) -> Vec<ResponsePart> {
        self.parts.lock().unwrap().clone()
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.parts().into_iter().find_map(|p| match p {
            ResponsePart::Head(status) => Some(status),
            _ => None,
        })
    }

    pub(crate) fn body(&self) -> Bytes {
        let mut body = BytesMut::new();
        for part in self.parts() {
            if let ResponsePart::Body(chunk) = part {
                body.extend_from_slice(&chunk);
            }
        }
        body.freeze()
    }

    pub(crate) fn body_chunks(&self) -> usize {
        self.parts().iter().filter(|p| matches!(p, ResponsePart::Body(_))).count()
    }

    /// Waits until the terminator has been written.
    pub(crate) async fn ended(&self) {
        loop {
            let notified = self.ended.notified();
            if self.parts().last() == Some(&ResponsePart::End) {
                return;
            }
            notified.await;
        }
    }
}

impl Transport for Recorder {
    fn write(&self, part: ResponsePart) -> WriteFuture<'_> {
        Box::pin(async move {
            let mut parts = self.parts.lock().unwrap();
            if self.fail_after.is_some_and(|limit| parts.len() >= limit) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
            }
            let is_end = part == ResponsePart::End;
            parts.push(part);
            drop(parts);
            if is_end {
                self.ended.notify_waiters();
            }
            Ok(())
        })
    }
}
