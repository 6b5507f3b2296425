//! Configuration module
//!
//! Handles CLI configuration: broker and object store connection settings.

use kiln_client::{AmqpConfig, S3Config};

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the RabbitMQ broker
    pub rabbitmq_url: String,
    pub queue: String,
    pub dead_letter_exchange: Option<String>,

    pub store_endpoint: Option<String>,
    pub store_region: String,
    pub store_bucket: String,
    pub store_access_key: String,
    pub store_secret_key: String,
}

impl Config {
    /// Queue settings matching the worker's declaration
    pub fn amqp(&self) -> AmqpConfig {
        AmqpConfig {
            url: self.rabbitmq_url.clone(),
            queue: self.queue.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            prefetch: 1,
        }
    }

    pub fn s3(&self) -> S3Config {
        S3Config {
            endpoint: self.store_endpoint.clone(),
            region: self.store_region.clone(),
            bucket: self.store_bucket.clone(),
            access_key: self.store_access_key.clone(),
            secret_key: self.store_secret_key.clone(),
        }
    }
}
