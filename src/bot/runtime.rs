//! Bot runtime - long polling alongside the change feed.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{error, info};

use super::dispatcher::ThrottledBot;
use crate::sync::EventHub;

/// Poll for updates until Ctrl-C, or until the change feed is lost.
///
/// A lost feed is an error: cached state can no longer follow the database.
pub async fn run(
    mut dispatcher: Dispatcher<ThrottledBot, anyhow::Error, teloxide::dispatching::DefaultKey>,
    hub: Arc<EventHub>,
) -> anyhow::Result<()> {
    info!("Starting bot in polling mode...");

    tokio::select! {
        _ = dispatcher.dispatch() => {
            info!("Dispatcher stopped");
            Ok(())
        }
        err = hub.closed() => {
            error!("Change feed closed: {}", err);
            Err(err.into())
        }
    }
}
