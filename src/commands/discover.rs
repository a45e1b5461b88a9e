//! Discovery snapshot commands
//!
//! Starts every available backend, gives them one list timeout to perform
//! their initial sync, prints the requested view as JSON and stops them.

use crate::config::Config;
use crate::discovery::{build_platform_clients, MergingPlatformClient, PlatformClient, TracingNotificationSink};
use crate::error::Result;
use std::sync::Arc;

/// Builds the merged client over every available backend
pub async fn merged_client(config: &Config) -> MergingPlatformClient {
    let clients = build_platform_clients(&config.discovery).await;
    tracing::info!(backends = clients.len(), "Discovery backends selected");
    MergingPlatformClient::new(
        clients,
        Arc::new(TracingNotificationSink),
        config.discovery.list_timeout(),
    )
}

async fn with_started<T, F, Fut>(config: &Config, view: F) -> Result<T>
where
    F: FnOnce(Arc<MergingPlatformClient>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let merged = Arc::new(merged_client(config).await);
    merged.start().await?;
    tokio::time::sleep(config.discovery.list_timeout()).await;
    let result = view(merged.clone()).await;
    merged.stop().await?;
    result
}

/// Prints every discoverable target
///
/// # Examples
///
/// ```no_run
/// use cryostat::config::Config;
/// use cryostat::commands::discover::run_discover;
///
/// # async fn example() -> anyhow::Result<()> {
/// run_discover(&Config::default()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_discover(config: &Config) -> Result<()> {
    let services = with_started(config, |merged| async move { merged.list_discoverable_services().await }).await?;
    println!("{}", serde_json::to_string_pretty(&services)?);
    Ok(())
}

/// Prints the merged discovery tree
pub async fn run_tree(config: &Config) -> Result<()> {
    let tree = with_started(config, |merged| async move { merged.discovery_tree().await }).await?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}
