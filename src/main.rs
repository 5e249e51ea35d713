use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;
use userscript_bridge::bridge::{CommandName, Envelope, GuestInvoker, HostInvoker, Mode};
use userscript_bridge::inject::{DataKey, Injector, Stage};
use userscript_bridge::js::{QuickJsEngine, QuickJsUserscript};
use userscript_bridge::BridgeConfig;

/// The part of a batch item the demo loader cares about.
#[derive(Deserialize)]
struct LoaderItem {
    #[serde(rename = "dataKey", alias = "dataKeyName")]
    data_key: DataKey,
    #[serde(default)]
    code: Option<String>,
}

fn main() {
    let Some(batch_path) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: userscript-bridge <batch.json>");
        std::process::exit(2);
    };

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config = BridgeConfig::load_default().unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to start async runtime: {err}");
            std::process::exit(1);
        });

    let local = LocalSet::new();
    if let Err(err) = local.block_on(&runtime, run(&batch_path, config)) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(batch_path: &Path, config: BridgeConfig) -> Result<()> {
    let contents = std::fs::read_to_string(batch_path)
        .with_context(|| format!("failed to read {}", batch_path.display()))?;
    let batch: Value = serde_json::from_str(&contents).context("batch is not valid JSON")?;
    let loader_items: Vec<LoaderItem> = match batch.get("items") {
        Some(items) => serde_json::from_value(items.clone()).context("invalid batch items")?,
        None => Vec::new(),
    };

    // Stands in for the content script: answers SetTimeout, logs the rest.
    let guest_slot: Rc<RefCell<Option<GuestInvoker>>> = Rc::default();
    let host_guest = Rc::clone(&guest_slot);
    let invoker: HostInvoker = Rc::new(move |envelope: Envelope, realm: Mode| {
        if envelope.command_name() == Some(CommandName::SetTimeout) {
            let guest = host_guest.borrow().clone();
            if let (Some(guest), Some(callback_id)) = (guest, envelope.callback_id) {
                let delay = Duration::from_millis(envelope.payload.as_u64().unwrap_or(0));
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    guest(Envelope::new(
                        CommandName::Callback,
                        json!({ "callbackId": callback_id, "payload": null }),
                    ));
                });
            }
            return;
        }
        info!(
            target: "host",
            realm = realm.as_str(),
            cmd = %envelope.command,
            data = %envelope.payload,
            "outbound message"
        );
    });

    let injector = Injector::builder("page", "content")
        .host_invoker(invoker)
        .config(config)
        .initialize()?;
    let guest = injector
        .guest_invoker()
        .context("content-mode injector has no guest invoker")?;
    *guest_slot.borrow_mut() = Some(Rc::clone(&guest));

    guest(Envelope::new(CommandName::ScriptData, batch));

    let engine = Rc::new(QuickJsEngine::new()?);
    for item in loader_items {
        let Some(code) = item.code else {
            continue;
        };
        let filename = format!("{}.user.js", item.data_key);
        injector.assign_global(
            &item.data_key,
            QuickJsUserscript::new(Rc::clone(&engine), code, filename).boxed(),
        );
    }

    for stage in [Stage::Start, Stage::End, Stage::Idle] {
        guest(Envelope::new(CommandName::RunAt, json!(stage.as_str())));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!(target: "host", "all stages signaled");
    Ok(())
}
