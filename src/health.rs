//! Backend liveness polling. Purely informational; it never gates a session.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use log::info;
use reqwest::Client;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

pub struct HealthMonitor {
    url: String,
    interval: Duration,
    timeout: Duration,
    available: Arc<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

async fn probe(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            log_debug!("health probe to {} failed: {}", url, err);
            false
        }
    }
}

async fn health_loop(
    client: Client,
    url: String,
    interval: Duration,
    available: Arc<watch::Sender<bool>>,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let up = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    up = probe(&client, &url) => up,
                };
                let changed = available.send_if_modified(|current| {
                    let changed = *current != up;
                    *current = up;
                    changed
                });
                if changed {
                    info!("Backend {} is {}", url, if up { "available" } else { "unavailable" });
                }
            }
        }
    }
}

impl HealthMonitor {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            url: url.into(),
            interval,
            timeout,
            available: Arc::new(available),
            handle: None,
            cancel_token: None,
        }
    }

    /// Root endpoint of the backend is probed; the URL is used as given.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            bail!("health monitor already running");
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .context("building health check client")?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(health_loop(
            client,
            self.url.clone(),
            self.interval,
            Arc::clone(&self.available),
            cancel_token.clone(),
        ));
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("health loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
