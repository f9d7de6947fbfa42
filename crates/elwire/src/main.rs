mod cli;

use std::time::Duration;

use clap::Parser;
use eyre::{bail, eyre, WrapErr};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use elwire_core::{parse_proxy, Callback, ConnectionState, Event, Interface, InterfaceConfig};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config = InterfaceConfig {
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        tls: args.tls_policy(),
        ..InterfaceConfig::default()
    };
    let proxy = parse_proxy(&args.proxy);
    let interface = Interface::new(&args.server, proxy, config.clone())
        .wrap_err_with(|| format!("set up connection to `{}`", args.server))?;

    // Subscriptions registered before the connection exists are kept and
    // replayed once it is up.
    let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();
    let subscriber = Callback::new(move |event| {
        let _ = events_tx.send(event);
    });
    let subscriptions = args.subscriptions();
    if !subscriptions.is_empty() {
        interface.send(&subscriptions, &subscriber).await;
    }

    interface.start().wrap_err("start connection worker")?;
    let state = wait_for_outcome(&interface, config.connect_timeout + Duration::from_secs(5))
        .await
        .wrap_err_with(|| format!("connect to {}", interface.describe()))?;
    if state != ConnectionState::Running {
        interface.stop().await;
        bail!("could not connect to {}", interface.describe());
    }
    tracing::info!(server = %interface.describe(), "connected");

    if let Some(message) = args.call_message() {
        let timeout = Duration::from_secs(args.timeout_secs);
        let result = interface
            .synchronous_get(std::slice::from_ref(&message), timeout)
            .await
            .wrap_err_with(|| format!("call `{}`", message.method));
        match result {
            Ok(mut values) => {
                let value = values.pop().unwrap_or(Value::Null);
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Err(err) => {
                interface.stop().await;
                return Err(err);
            }
        }
    }

    if !subscriptions.is_empty() {
        let sent = interface.resubscribe().await;
        tracing::info!(requests = sent, "subscribed");
        follow(&interface, &mut events).await?;
    }

    interface.stop().await;
    if let Some(version) = interface.server_version() {
        tracing::debug!(server.version = %version, "session finished");
    }
    Ok(())
}

/// Wait for the first connection attempt to settle.
async fn wait_for_outcome(
    interface: &Interface,
    limit: Duration,
) -> eyre::Result<ConnectionState> {
    let mut states = interface.watch_state();
    let state = tokio::time::timeout(
        limit,
        states.wait_for(|state| {
            matches!(
                state,
                ConnectionState::Running | ConnectionState::Disconnected | ConnectionState::Stopped
            )
        }),
    )
    .await
    .map_err(|_| eyre!("no connection after {limit:?}"))??;
    Ok(*state)
}

/// Print notifications as JSON lines until Ctrl-C or the connection drops.
async fn follow(
    interface: &Interface,
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> eyre::Result<()> {
    let mut states = interface.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
            changed = states.changed() => {
                changed.wrap_err("connection state channel closed")?;
                let state = *states.borrow_and_update();
                if !state.is_connected() {
                    tracing::warn!(%state, "connection lost");
                    return Ok(());
                }
            }
            Some(event) = events.recv() => {
                if let Some(line) = render_event(&event) {
                    println!("{line}");
                }
            }
        }
    }
}

fn render_event(event: &Event) -> Option<String> {
    let Event::Reply(response) = event else {
        return None;
    };
    let mut line = json!({
        "method": response.method,
        "params": response.params,
    });
    if let Some(result) = &response.result {
        line["result"] = result.clone();
    }
    if let Some(error) = &response.error {
        line["error"] = error.clone();
    }
    Some(line.to_string())
}
