//! Submit command handler
//!
//! Publishes a build task to the queue the workers consume.

use anyhow::{Context, Result};
use colored::*;
use kiln_client::AmqpQueue;
use kiln_core::domain::layout::result_key;
use kiln_core::domain::task::BuildTask;

use crate::config::Config;

/// Validate and publish a build task
pub async fn handle_submit(key: &str, profile: &str, config: &Config) -> Result<()> {
    let task = BuildTask::new(key, profile);
    task.validate().context("Invalid build task")?;

    let queue = AmqpQueue::connect(&config.amqp())
        .await
        .with_context(|| format!("Failed to connect to {}", config.rabbitmq_url))?;

    let published = queue.publish(&task).await;
    // Close before reporting so a failed publish still releases the connection
    let _ = queue.close().await;
    published.context("Failed to publish build task")?;

    println!("{}", "✓ Build task submitted".green().bold());
    println!("  Queue:    {}", queue.queue());
    println!("  Source:   {}", task.source_key);
    println!("  Profile:  {}", task.build_profile);
    println!("  Artifact: {}", result_key(&task).cyan());

    Ok(())
}
