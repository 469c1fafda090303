//! Account registry
//!
//! One [`OrderExecutor`] per credential bundle, looked up by account name.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use super::OrderExecutor;
use crate::error::{ConnectorError, Result};

#[derive(Default)]
pub struct AccountRegistry {
    executors: DashMap<String, Arc<OrderExecutor>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its account name
    pub fn register(&self, executor: Arc<OrderExecutor>) -> Result<()> {
        let name = executor.account().to_string();
        match self.executors.entry(name.clone()) {
            Entry::Occupied(_) => Err(ConnectorError::AlreadyExists(format!("account {}", name))),
            Entry::Vacant(slot) => {
                slot.insert(executor);
                info!(account = %name, "Account registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<OrderExecutor>> {
        self.executors
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConnectorError::NotFound(format!("account {}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Close and drop every executor
    pub async fn close_all(&self) {
        let executors: Vec<Arc<OrderExecutor>> =
            self.executors.iter().map(|e| e.value().clone()).collect();
        self.executors.clear();

        for executor in executors {
            executor.close().await;
        }
    }
}
