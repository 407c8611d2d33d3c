//! CLI command implementations

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::{debug, info};
use weaverconf::{ConfigSources, WeaverConfig};
use weaverlink::fanout::METERS_PREFIX;
use weaverlink::{meter_path, IntentOutcome, Update, ValidationError, VolumeChange, WeaverClient};
use weaverproto::{DeviceKind, DeviceSummary, DeviceView, Mix};

/// Extra wait past the command timeout, so the dispatcher reports first.
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

/// Source mixes acted on when no `--mix` is given.
const DEFAULT_MIXES: &[Mix] = &[Mix::A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LinkMode {
    On,
    Off,
    Toggle,
}

pub fn parse_mix(arg: &str) -> Result<Mix, String> {
    arg.parse()
}

/// `40` sets the volume, `+5` and `-5` nudge it.
pub fn parse_volume(arg: &str) -> Result<VolumeChange> {
    let arg = arg.trim();
    if arg.starts_with('+') || arg.starts_with('-') {
        let delta: i32 = arg
            .parse()
            .with_context(|| format!("Invalid volume delta: '{}'", arg))?;
        return Ok(VolumeChange::Delta(delta));
    }

    let value: u8 = arg
        .parse()
        .with_context(|| format!("Invalid volume: '{}' (expected 0-100, +n or -n)", arg))?;
    if value > 100 {
        bail!("Volume must be 0-100, got {}", value);
    }
    Ok(VolumeChange::Absolute(value))
}

/// Connect and wait for the first snapshot.
async fn connect(config: &WeaverConfig) -> Result<Arc<WeaverClient>> {
    let client = Arc::new(WeaverClient::new(&config.infra));
    client.start();

    let timeout = config.infra.session.snapshot_timeout();
    if !client.wait_for_baseline(timeout).await {
        client.shutdown().await;
        bail!(
            "No status from daemon at {} within {:?}\n\n\
             Is PipeWeaver running? Override the address with --host/--port\n\
             or [daemon] in weaverlink.toml.",
            config.infra.daemon.api_url(),
            timeout
        );
    }
    debug!(revision = client.revision(), "baseline received");
    Ok(client)
}

/// Find a device by id, then by name.
fn resolve(client: &WeaverClient, device: &str) -> Result<DeviceSummary> {
    let devices = client.devices();
    if let Some(found) = devices.iter().find(|d| d.id == device) {
        return Ok(found.clone());
    }
    if let Some(found) = client.find_device_by_name(device) {
        return Ok(found);
    }

    let known: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    bail!("Unknown device '{}'. Known devices: {}", device, known.join(", "))
}

fn describe(view: &DeviceView) -> String {
    match view {
        DeviceView::Source(source) => {
            let muted: Vec<&str> = [Mix::A, Mix::B]
                .into_iter()
                .filter(|m| source.is_muted(*m))
                .map(Mix::as_str)
                .collect();
            format!(
                "A={:>3} B={:>3}{}{}",
                source.volume_a,
                source.volume_b,
                if source.linked { " linked" } else { "" },
                if muted.is_empty() {
                    String::new()
                } else {
                    format!(" muted:{}", muted.join("+"))
                }
            )
        }
        DeviceView::Target(target) => format!(
            "vol={:>3}{}",
            target.volume,
            if target.muted { " muted" } else { "" }
        ),
    }
}

fn print_device(client: &WeaverClient, device: &DeviceSummary) {
    if let Some(view) = client.view(&device.id) {
        println!("{} ({}): {}", device.name, device.id, describe(&view));
    }
}

/// Run `dispatch` and wait until every intent it created has an outcome.
async fn dispatch_and_wait<F>(
    client: &WeaverClient,
    config: &WeaverConfig,
    device: &DeviceSummary,
    dispatch: F,
) -> Result<()>
where
    F: FnOnce() -> Result<Vec<u64>, ValidationError>,
{
    // Subscribe first so no outcome slips past
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client.subscribe(device.path.clone(), move |update: Update| {
        let _ = tx.send(update);
    });

    let mut waiting: BTreeSet<u64> = dispatch()?.into_iter().collect();
    if waiting.is_empty() {
        println!("{}: already there", device.name);
        return Ok(());
    }

    let deadline =
        tokio::time::Instant::now() + config.infra.session.command_timeout() + OUTCOME_GRACE;
    let mut failures = Vec::new();
    while !waiting.is_empty() {
        let update = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(update)) => update,
            Ok(None) => bail!("Subscription closed before the daemon answered"),
            Err(_) => bail!("Timed out waiting for {} change(s)", waiting.len()),
        };
        for event in update.intents {
            if !waiting.remove(&event.intent_id) {
                continue;
            }
            match event.outcome {
                IntentOutcome::Confirmed => debug!(path = %event.path, "confirmed"),
                other => failures.push(format!("{}: {:?}", event.path, other)),
            }
        }
    }

    if !failures.is_empty() {
        bail!("Daemon did not apply the change:\n  {}", failures.join("\n  "));
    }
    Ok(())
}

/// List devices with their state
pub async fn devices(config: &WeaverConfig) -> Result<()> {
    let client = connect(config).await?;

    for device in client.devices() {
        let kind = match device.kind {
            DeviceKind::Source => "source",
            DeviceKind::Target => "target",
        };
        let state = client.view(&device.id).map(|v| describe(&v)).unwrap_or_default();
        println!("{:<16} {:<7} {:<24} {}", device.id, kind, device.name, state);
    }

    client.shutdown().await;
    Ok(())
}

/// Print changes under `prefix` until Ctrl+C
pub async fn watch(config: &WeaverConfig, prefix: &str) -> Result<()> {
    let client = connect(config).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client.subscribe(prefix, move |update: Update| {
        let _ = tx.send(update);
    });
    info!(prefix = %prefix, "watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = rx.recv() => {
                let Some(update) = update else { break };
                for path in &update.paths {
                    if path.is_empty() {
                        println!("snapshot (revision {})", client.revision());
                        continue;
                    }
                    let value = client.get(path).map(|v| v.to_string()).unwrap_or_else(|| "<removed>".to_string());
                    println!("{} = {}", path, value);
                }
                for event in &update.intents {
                    println!("intent {} {}: {:?}", event.intent_id, event.path, event.outcome);
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Set or nudge a volume
pub async fn volume(
    config: &WeaverConfig,
    device: &str,
    change: VolumeChange,
    mixes: &[Mix],
) -> Result<()> {
    let client = connect(config).await?;
    let device = resolve(&client, device)?;

    let result = dispatch_and_wait(&client, config, &device, || {
        let dispatcher = client.dispatcher();
        if device.kind == DeviceKind::Target {
            return dispatcher.set_volume(&device.id, None, change);
        }
        let mixes = if mixes.is_empty() { DEFAULT_MIXES } else { mixes };
        let mut ids = Vec::new();
        for mix in mixes {
            ids.extend(dispatcher.set_volume(&device.id, Some(*mix), change)?);
        }
        Ok(ids)
    })
    .await;

    print_device(&client, &device);
    client.shutdown().await;
    result
}

/// Toggle mute
pub async fn mute(config: &WeaverConfig, device: &str, mixes: &[Mix]) -> Result<()> {
    let client = connect(config).await?;
    let device = resolve(&client, device)?;
    let mixes = if mixes.is_empty() { DEFAULT_MIXES } else { mixes };

    let result = dispatch_and_wait(&client, config, &device, || {
        client.dispatcher().toggle_mute(&device.id, mixes)
    })
    .await;

    print_device(&client, &device);
    client.shutdown().await;
    result
}

/// Link, unlink or toggle a source's mixes
pub async fn link(config: &WeaverConfig, device: &str, mode: LinkMode) -> Result<()> {
    let client = connect(config).await?;
    let device = resolve(&client, device)?;

    let result = dispatch_and_wait(&client, config, &device, || {
        let dispatcher = client.dispatcher();
        match mode {
            LinkMode::On => dispatcher.set_volume_linked(&device.id, true),
            LinkMode::Off => dispatcher.set_volume_linked(&device.id, false),
            LinkMode::Toggle => dispatcher.toggle_link(&device.id),
        }
    })
    .await;

    print_device(&client, &device);
    client.shutdown().await;
    result
}

/// Stream meter levels until Ctrl+C
pub async fn meter(config: &WeaverConfig, device: Option<&str>) -> Result<()> {
    let client = connect(config).await?;
    let prefix = match device {
        Some(device) => meter_path(&resolve(&client, device)?.id),
        None => METERS_PREFIX.to_string(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client.subscribe(prefix, move |update: Update| {
        let _ = tx.send(update);
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = rx.recv() => {
                let Some(update) = update else { break };
                for (device_id, level) in &update.meters {
                    let bar = "#".repeat(usize::from(*level) / 5);
                    println!("{:<16} {:>3} {}", device_id, level, bar);
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Print the effective configuration with its sources
pub fn show_config(config: &WeaverConfig, sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {}", var);
    }
    println!("{}", config.to_toml());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_volume() {
        assert_eq!(parse_volume("40").unwrap(), VolumeChange::Absolute(40));
        assert_eq!(parse_volume("+5").unwrap(), VolumeChange::Delta(5));
        assert_eq!(parse_volume("-12").unwrap(), VolumeChange::Delta(-12));
        assert_eq!(parse_volume(" 0 ").unwrap(), VolumeChange::Absolute(0));
    }

    #[test]
    fn test_parse_volume_rejects_garbage() {
        assert!(parse_volume("101").is_err());
        assert!(parse_volume("loud").is_err());
        assert!(parse_volume("+").is_err());
    }

    #[test]
    fn test_parse_mix() {
        assert_eq!(parse_mix("b"), Ok(Mix::B));
        assert!(parse_mix("C").is_err());
    }

    #[test]
    fn test_describe_source() {
        use weaverproto::status::SourceView;
        use weaverproto::MuteTarget;

        let view = DeviceView::Source(SourceView {
            device: DeviceSummary {
                id: "src1".into(),
                name: "Music".into(),
                kind: DeviceKind::Source,
                path: "/x".into(),
                physical: false,
            },
            volume_a: 70,
            volume_b: 5,
            linked: true,
            muted: BTreeSet::from([MuteTarget::TargetB]),
            mute_targets_a: BTreeSet::new(),
            mute_targets_b: BTreeSet::new(),
        });
        assert_eq!(describe(&view), "A= 70 B=  5 linked muted:B");
    }
}
