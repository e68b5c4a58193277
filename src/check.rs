//! `feeder check`: probe the broker and store of every task.

use anyhow::{bail, Result};

use context_feeder_core::broker::ContextBroker;
use context_feeder_core::store::DocumentStore;

use crate::config::Config;
use crate::elastic::ElasticStore;
use crate::ngsi::NgsiBroker;

/// Reachability of one task's endpoints. `None` means reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHealth {
    pub name: String,
    pub broker_error: Option<String>,
    pub store_error: Option<String>,
}

impl TaskHealth {
    pub fn healthy(&self) -> bool {
        self.broker_error.is_none() && self.store_error.is_none()
    }
}

pub async fn probe(name: &str, broker: &dyn ContextBroker, store: &dyn DocumentStore) -> TaskHealth {
    TaskHealth {
        name: name.to_string(),
        broker_error: broker
            .list_subscriptions()
            .await
            .err()
            .map(|e| format!("{:#}", e)),
        store_error: store.ping().await.err().map(|e| format!("{:#}", e)),
    }
}

fn status(error: &Option<String>) -> &'static str {
    if error.is_some() {
        "UNREACHABLE"
    } else {
        "OK"
    }
}

pub async fn run_check(config: &Config) -> Result<()> {
    let mut results = Vec::new();
    for task in config.task_configs() {
        let broker = NgsiBroker::new(&task.broker)?;
        let store = ElasticStore::new(&task.store)?;
        results.push(probe(&task.name, &broker, &store).await);
    }

    println!("{:<24} {:<12} {:<12}", "TASK", "BROKER", "STORE");
    for r in &results {
        println!(
            "{:<24} {:<12} {:<12}",
            r.name,
            status(&r.broker_error),
            status(&r.store_error)
        );
    }
    for r in results.iter().filter(|r| !r.healthy()) {
        for error in r.broker_error.iter().chain(&r.store_error) {
            eprintln!("{}: {}", r.name, error);
        }
    }

    let unhealthy = results.iter().filter(|r| !r.healthy()).count();
    if unhealthy > 0 {
        bail!("{} of {} tasks have unreachable endpoints", unhealthy, results.len());
    }
    println!("All {} tasks reachable.", results.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_feeder_core::broker::memory::InMemoryBroker;
    use context_feeder_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_probe_reports_each_side() {
        let ok = probe("a", &InMemoryBroker::new(), &InMemoryStore::new()).await;
        assert!(ok.healthy());

        let bad = probe(
            "b",
            &InMemoryBroker::new().fail_list(),
            &InMemoryStore::new().fail_pings(1),
        )
        .await;
        assert!(!bad.healthy());
        assert!(bad.broker_error.unwrap().contains("listing"));
        assert!(bad.store_error.unwrap().contains("unreachable"));
    }
}
