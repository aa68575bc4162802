//! In-memory object store.

use crate::lock;
use converge_core::error::CloudError;
use converge_core::transfer::ObjectSource;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct ObjectState {
    listed_prefixes: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Object store whose objects are in-memory strings.
#[derive(Debug, Default)]
pub struct FakeObjectSource {
    /// `None` marks an object whose download fails
    objects: BTreeMap<String, Option<String>>,
    download_delay: Duration,
    state: Mutex<ObjectState>,
}

impl FakeObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, key: &str, content: &str) -> Self {
        self.objects.insert(key.to_string(), Some(content.to_string()));
        self
    }

    pub fn with_failing_object(mut self, key: &str) -> Self {
        self.objects.insert(key.to_string(), None);
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn listed_prefixes(&self) -> Vec<String> {
        lock(&self.state).listed_prefixes.clone()
    }

    /// Highest number of downloads observed running at once
    pub fn max_in_flight(&self) -> usize {
        lock(&self.state).max_in_flight
    }
}

impl ObjectSource for FakeObjectSource {
    async fn list_keys(&self, _bucket: &str, prefix: &str) -> Result<Vec<String>, CloudError> {
        lock(&self.state).listed_prefixes.push(prefix.to_string());
        Ok(self
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, _bucket: &str, key: &str, destination: &Path) -> Result<(), CloudError> {
        {
            let mut state = lock(&self.state);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }
        lock(&self.state).in_flight -= 1;

        match self.objects.get(key) {
            Some(Some(content)) => tokio::fs::write(destination, content)
                .await
                .map_err(|e| CloudError::transport(e.to_string())),
            Some(None) => Err(CloudError::transport(format!("connection reset reading {key}"))),
            None => Err(CloudError::new("NoSuchKey", format!("{key} does not exist"))),
        }
    }
}
