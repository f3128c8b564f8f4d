//! Test doubles shared by the unit tests.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::decode;
use crate::transport::Link;

/// A link that decodes and records every command sent through it.
#[derive(Default)]
pub(crate) struct RecordingLink {
    sent: Mutex<Vec<Vec<String>>>,
}

impl RecordingLink {
    /// Drain everything recorded so far.
    pub(crate) fn take(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Wait until at least `count` commands were recorded, then drain them.
    pub(crate) async fn wait_for(&self, count: usize) -> Vec<Vec<String>> {
        for _ in 0..200 {
            if self.sent.lock().unwrap().len() >= count {
                return self.take();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} sends, got {:?}", count, self.take());
    }
}

impl Link for RecordingLink {
    fn send(&self, command: Bytes) -> Result<()> {
        let (reply, _) = decode(&command).unwrap().unwrap();
        let args = reply
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap().to_string())
            .collect();
        self.sent.lock().unwrap().push(args);
        Ok(())
    }
}
