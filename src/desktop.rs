//! Tauri bridge: exposes the bus to the webview.

use crate::bus::{BusEvent, EventFilter, EventTopic, RequestEnvelope, Subscription};
use crate::config;
use crate::error::AppResult;
use crate::state::AppState;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tauri::async_runtime::JoinHandle;
use tauri::{AppHandle, Emitter, Manager, State};
use tokio::sync::oneshot;

/// Event forwarding tasks, keyed by subscription id
#[derive(Default)]
pub struct Forwarders {
    tasks: Arc<DashMap<u64, JoinHandle<()>>>,
}

impl Forwarders {
    /// Pump `subscription` into `emit` until the hub or the emitter gives
    /// up. A task that ends on its own drops its entry.
    fn start<F>(&self, subscription: Subscription, emit: F) -> u64
    where
        F: Fn(&str, &BusEvent) -> Result<(), String> + Send + 'static,
    {
        let id = subscription.id();
        let name = event_name(subscription.topic());
        let mut events = subscription.into_stream();
        let tasks = Arc::clone(&self.tasks);
        let (registered_tx, registered) = oneshot::channel::<()>();

        let task = tauri::async_runtime::spawn(async move {
            // the entry must exist before it can be removed
            let _ = registered.await;
            while let Some(event) = events.next().await {
                if let Err(e) = emit(&name, &event) {
                    tracing::warn!("Failed to forward {} to the webview: {}", name, e);
                    break;
                }
            }
            tasks.remove(&id);
        });
        self.tasks.insert(id, task);
        let _ = registered_tx.send(());
        id
    }

    fn stop(&self, id: u64) -> bool {
        match self.tasks.remove(&id) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Create and configure the Tauri application
pub fn create_app() -> tauri::Builder<tauri::Wry> {
    tauri::Builder::default()
        .setup(|app| {
            let config_dir = config::get_config_dir()?;
            std::fs::create_dir_all(&config_dir)?;
            tracing::info!("remux config dir: {:?}", config_dir);

            let state = AppState::new(&config_dir)
                .map_err(|e| anyhow::anyhow!("Failed to initialize remux state: {}", e))?;
            let state = Arc::new(state);
            app.manage(state);
            app.manage(Forwarders::default());

            tracing::info!("remux initialized");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            bus_request,
            bus_subscribe,
            bus_unsubscribe,
        ])
}

/// Tauri event names may not contain dots
pub fn event_name(topic: EventTopic) -> String {
    topic.as_str().replace('.', ":")
}

#[tauri::command]
pub async fn bus_request(
    state: State<'_, Arc<AppState>>,
    request: RequestEnvelope,
) -> AppResult<serde_json::Value> {
    state.bus.dispatch(request).await
}

/// Subscribe to a topic; events are re-emitted under [`event_name`].
#[tauri::command]
pub async fn bus_subscribe(
    app: AppHandle,
    state: State<'_, Arc<AppState>>,
    forwarders: State<'_, Forwarders>,
    topic: String,
    filter: Option<EventFilter>,
) -> AppResult<u64> {
    let subscription = state.bus.subscribe(&topic, filter.unwrap_or_default())?;
    Ok(forwarders.start(subscription, move |name, event| {
        app.emit(name, event).map_err(|e| e.to_string())
    }))
}

#[tauri::command]
pub async fn bus_unsubscribe(
    forwarders: State<'_, Forwarders>,
    subscription_id: u64,
) -> AppResult<bool> {
    Ok(forwarders.stop(subscription_id))
}
