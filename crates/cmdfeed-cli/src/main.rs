//! cmdfeed demo: one command lifecycle against the in-memory backends.
//!
//! Usage: `cmdfeed-cli [config.json]`. Without a path a built-in two-database,
//! one-account layout is used. `RUST_LOG` controls verbosity (default `info`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cmdfeed_core::domain::{
    AgentId, AssetGroupId, PrivacyCommand, PrivacyCommandType, QueueStorageKind, SubjectType,
};
use cmdfeed_core::impls::{InMemoryCloudQueue, InMemoryDocumentStore};
use cmdfeed_core::ports::{Clock, SystemClock};
use cmdfeed_core::{
    CommandQueue, CommandQueueFactory, LogicalCommandQueue, QueueConfig, ReplaceOperations,
};

const DEMO_CONFIG: &str = r#"{
    "databases": [
        { "moniker": "westus-db1", "weight": 3 },
        { "moniker": "eastus-db1", "weight": 1 }
    ],
    "cloud_accounts": [
        { "moniker": "cmdfeedaccount1" }
    ]
}"#;

const SUBJECT: SubjectType = SubjectType::Msa;

fn load_config() -> Result<QueueConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            QueueConfig::from_path(&path).with_context(|| format!("loading config from {path}"))
        }
        None => QueueConfig::from_json_str(DEMO_CONFIG).context("parsing built-in config"),
    }
}

fn build_factory(config: QueueConfig, clock: Arc<dyn Clock>) -> Result<CommandQueueFactory> {
    let databases: Vec<String> = config.databases.iter().map(|d| d.moniker.clone()).collect();
    let accounts: Vec<String> = config.cloud_accounts.iter().map(|a| a.moniker.clone()).collect();

    let mut builder = CommandQueueFactory::builder(config).clock(clock.clone());
    for moniker in databases {
        builder = builder.document_client(moniker, Arc::new(InMemoryDocumentStore::new(clock.clone())));
    }
    for moniker in accounts {
        builder = builder.cloud_client(Arc::new(InMemoryCloudQueue::new(moniker, clock.clone())));
    }
    builder.build().context("building queue factory")
}

fn command(
    clock: &dyn Clock,
    command_type: PrivacyCommandType,
    agent_id: AgentId,
    asset_group_id: AssetGroupId,
    request: u32,
) -> PrivacyCommand {
    let now = clock.now();
    PrivacyCommand::new(
        command_type,
        agent_id,
        asset_group_id,
        SUBJECT,
        now,
        now + chrono::Duration::days(30),
        serde_json::json!({ "request": request }),
    )
}

async fn print_statistics(queue: &LogicalCommandQueue, token: &CancellationToken) -> Result<()> {
    for view in queue.queue_statistics(true, token).await? {
        info!(statistics = %serde_json::to_string(&view)?, "queue statistics");
    }
    Ok(())
}

/// Enqueue a handful of commands, lease some, extend one lease, complete the
/// rest, then flush whatever is left.
async fn document_cycle(
    factory: &CommandQueueFactory,
    clock: &dyn Clock,
    token: &CancellationToken,
) -> Result<()> {
    let (agent, group) = (AgentId::generate(), AssetGroupId::generate());
    let queue = factory.create_queue(agent, group, SUBJECT, QueueStorageKind::DocumentDb)?;

    for request in 0..5 {
        queue
            .enqueue(command(clock, PrivacyCommandType::Delete, agent, group, request))
            .await?;
    }
    info!(%agent, %group, "enqueued 5 delete commands");

    let popped = queue.pop(3, Some(Duration::from_secs(60))).await?;
    info!(leased = popped.commands.len(), errors = popped.errors.len(), "popped");

    let mut receipts = Vec::new();
    for (index, mut leased) in popped.commands.into_iter().enumerate() {
        let receipt = leased
            .lease_receipt
            .take()
            .context("popped command without a lease receipt")?;
        if index == 0 {
            leased.body = serde_json::json!({ "request": 0, "progress": "halfway" });
            leased.next_visible_time = clock.now() + chrono::Duration::minutes(5);
            let renewed = queue.replace(&receipt, leased, ReplaceOperations::ALL).await?;
            info!(command_id = %renewed.command_id(), moniker = renewed.moniker(), "lease extended");
            receipts.push(renewed);
        } else {
            receipts.push(receipt);
        }
    }

    for receipt in &receipts {
        queue.delete(receipt).await?;
        info!(command_id = %receipt.command_id(), moniker = receipt.moniker(), "completed");
    }

    print_statistics(&queue, token).await?;
    for collection in factory.document_collections(SUBJECT) {
        collection.refresh_partition_key_range_statistics().await?;
        info!(
            moniker = collection.moniker(),
            approximate_documents = collection.approximate_documents_count(),
            "partition key range statistics"
        );
    }
    queue.flush_agent_queue(clock.now(), token).await?;
    info!("flushed remaining commands");
    print_statistics(&queue, token).await
}

async fn cloud_cycle(
    factory: &CommandQueueFactory,
    clock: &dyn Clock,
    token: &CancellationToken,
) -> Result<()> {
    let (agent, group) = (AgentId::generate(), AssetGroupId::generate());
    let queue = factory.create_queue(agent, group, SUBJECT, QueueStorageKind::CloudQueue)?;

    queue
        .enqueue(command(clock, PrivacyCommandType::AgeOut, agent, group, 0))
        .await?;
    let popped = queue.pop(10, None).await?;
    for leased in &popped.commands {
        let receipt = leased
            .lease_receipt
            .as_ref()
            .context("popped command without a lease receipt")?;
        queue.delete(receipt).await?;
        info!(command_id = %leased.command_id, moniker = receipt.moniker(), "age-out completed");
    }
    print_statistics(&queue, token).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let has_cloud = !config.cloud_accounts.is_empty();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let factory = build_factory(config, clock.clone())?;
    factory.initialize().await.context("initializing storage")?;

    let token = CancellationToken::new();
    document_cycle(&factory, clock.as_ref(), &token).await?;
    if has_cloud {
        cloud_cycle(&factory, clock.as_ref(), &token).await?;
    }
    Ok(())
}
