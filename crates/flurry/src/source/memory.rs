//! In-process object source.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{ByteStream, KeyFilter, ModificationMarker, ObjectSource, SourceObject};
use crate::error::{ObjectMissingSnafu, SourceError};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, (ModificationMarker, Bytes)>,
    /// Remaining reads per key that break off halfway with an I/O error.
    interrupted_reads: HashMap<String, usize>,
    /// Remaining reads per key that stop delivering data halfway.
    stalled_reads: HashMap<String, usize>,
    /// Remaining listings that never complete.
    stalled_listings: usize,
}

fn take_one(remaining: Option<&mut usize>) -> bool {
    match remaining {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Object source holding objects in memory, for tests and dry runs.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<State>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an object.
    pub fn put(&self, key: &str, marker: impl Into<ModificationMarker>, content: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .objects
            .insert(key.to_string(), (marker.into(), content.into()));
    }

    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.objects.remove(key);
    }

    /// Make the next `times` reads of `key` fail with a connection reset
    /// after delivering the first half of the content.
    pub fn interrupt_reads(&self, key: &str, times: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.interrupted_reads.insert(key.to_string(), times);
    }

    /// Make the next `times` reads of `key` hang after delivering the first
    /// half of the content.
    pub fn stall_reads(&self, key: &str, times: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stalled_reads.insert(key.to_string(), times);
    }

    /// Make the next `times` listings hang.
    pub fn stall_listings(&self, times: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stalled_listings = times;
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn list(&self, filter: &KeyFilter) -> Result<Vec<SourceObject>, SourceError> {
        let (listed, stalled) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let stalled = take_one(Some(&mut state.stalled_listings));
            let listed: Vec<SourceObject> = state
                .objects
                .iter()
                .filter(|(key, _)| filter.matches(key))
                .map(|(key, (marker, content))| SourceObject {
                    key: key.clone(),
                    modification_marker: *marker,
                    size_bytes: content.len() as u64,
                })
                .collect();
            (listed, stalled)
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(listed)
    }

    async fn open_stream(&self, key: &str) -> Result<ByteStream, SourceError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some((_, content)) = state.objects.get(key).cloned() else {
            return ObjectMissingSnafu { key }.fail();
        };

        let interrupt = take_one(state.interrupted_reads.get_mut(key));
        let stall = take_one(state.stalled_reads.get_mut(key));

        let half = content.len() / 2;
        if stall {
            let head = futures::stream::iter([std::io::Result::Ok(content.slice(..half))]);
            return Ok(head.chain(futures::stream::pending()).boxed());
        }
        let chunks: Vec<std::io::Result<Bytes>> = if interrupt {
            vec![
                Ok(content.slice(..half)),
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )),
            ]
        } else {
            vec![Ok(content.slice(..half)), Ok(content.slice(half..))]
        };

        Ok(futures::stream::iter(chunks).boxed())
    }
}
