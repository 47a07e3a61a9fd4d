//! Declared topology, kept so it can be replayed after a reconnect or a
//! broker restart.

use parking_lot::Mutex;
use tracing::debug;

use super::broker::{Binding, BrokerProvider, ExchangeDeclaration, QueueDeclaration};
use super::errors::MessagingResult;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    pub exchanges: Vec<ExchangeDeclaration>,
    pub queues: Vec<QueueDeclaration>,
    pub bindings: Vec<Binding>,
}

/// Every exchange, queue and binding the bus has declared, in declaration order
#[derive(Debug, Default)]
pub struct Topology {
    inner: Mutex<TopologySnapshot>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&self, exchange: &ExchangeDeclaration) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.exchanges.iter_mut().find(|e| e.name == exchange.name) {
            *existing = exchange.clone();
        } else {
            inner.exchanges.push(exchange.clone());
        }
    }

    pub fn record_queue(&self, queue: &QueueDeclaration) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.queues.iter_mut().find(|q| q.name == queue.name) {
            *existing = queue.clone();
        } else {
            inner.queues.push(queue.clone());
        }
    }

    pub fn record_binding(&self, binding: &Binding) {
        let mut inner = self.inner.lock();
        if !inner.bindings.contains(binding) {
            inner.bindings.push(binding.clone());
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.inner.lock().clone()
    }

    /// Declare everything again on `broker` (exchanges, then queues, then bindings)
    pub async fn replay(&self, broker: &BrokerProvider) -> MessagingResult<()> {
        let snapshot = self.snapshot();

        for exchange in &snapshot.exchanges {
            broker.declare_exchange(exchange).await?;
        }
        for queue in &snapshot.queues {
            broker.declare_queue(queue).await?;
        }
        for binding in &snapshot.bindings {
            broker.bind_queue(binding).await?;
        }

        debug!(
            exchanges = snapshot.exchanges.len(),
            queues = snapshot.queues.len(),
            bindings = snapshot.bindings.len(),
            "Topology replayed"
        );
        Ok(())
    }
}
