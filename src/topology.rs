//! Broker-side topology definitions.
//!
//! A [`Topology`] is the static description of everything a dispatching
//! process needs on the broker:
//!
//! - a direct *request* exchange that workers consume from,
//! - a direct *result* exchange that workers publish replies to,
//! - a durable shared work queue bound to the request exchange,
//! - a process-scoped, auto-deleting reply queue bound to the result exchange
//!   under its own name, so only replies addressed to this process arrive.
//!
//! This module is data only. Declaring it is the job of a
//! [`Link`](crate::Link) implementation, and it must be idempotent:
//! re-declaring matching attributes is a no-op on the broker.

use crate::BrokerConfig;

/// Exchange routing type. Only direct routing is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
}

/// One exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// One queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// One queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Complete topology for a dispatching process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub request_exchange: ExchangeSpec,
    pub result_exchange: ExchangeSpec,
    pub shared_queue: QueueSpec,
    pub reply_queue: QueueSpec,
}

impl Topology {
    /// Derive the topology from broker configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        // ---
        Self {
            request_exchange: ExchangeSpec {
                name: config.request_exchange.clone(),
                kind: ExchangeKind::Direct,
                durable: false,
            },
            result_exchange: ExchangeSpec {
                name: config.result_exchange.clone(),
                kind: ExchangeKind::Direct,
                durable: false,
            },
            shared_queue: QueueSpec {
                name: config.queue.clone(),
                durable: true,
                auto_delete: false,
            },
            reply_queue: QueueSpec {
                name: config.reply_queue.clone(),
                durable: true,
                auto_delete: true,
            },
        }
    }

    /// Exchanges in declaration order.
    pub fn exchanges(&self) -> [&ExchangeSpec; 2] {
        [&self.request_exchange, &self.result_exchange]
    }

    /// Queues in declaration order.
    pub fn queues(&self) -> [&QueueSpec; 2] {
        [&self.shared_queue, &self.reply_queue]
    }

    /// Bindings in declaration order. Each queue is bound under its own name.
    pub fn bindings(&self) -> [BindingSpec; 2] {
        // ---
        [
            BindingSpec {
                queue: self.shared_queue.name.clone(),
                exchange: self.request_exchange.name.clone(),
                routing_key: self.shared_queue.name.clone(),
            },
            BindingSpec {
                queue: self.reply_queue.name.clone(),
                exchange: self.result_exchange.name.clone(),
                routing_key: self.reply_queue.name.clone(),
            },
        ]
    }

    /// Reply-to address stamped on every outgoing request.
    pub fn reply_to(&self) -> &str {
        &self.reply_queue.name
    }
}
