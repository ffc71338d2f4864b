use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use switchboard::{BuiltinCodec, Command, Config, Controller, ListenerContext, MessageListener, OfMessage, Switch};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct PacketCounter(AtomicUsize);

impl MessageListener for PacketCounter {
    fn receive(&self, sw: &Switch, _msg: &OfMessage, _ctx: &mut ListenerContext) -> Command {
        let count = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("switch {} sent its {count}th PACKET_IN", sw.dpid);
        Command::Continue
    }

    fn name(&self) -> &str {
        "packet-counter"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(layer().without_time())
        .init();

    let mut settings = HashMap::new();
    if let Ok(port) = std::env::var("OPENFLOW_PORT") {
        settings.insert("openflowport".to_string(), port);
    }
    let config = Config::from_map(&settings).context("failed to parse configuration")?;

    let controller = Controller::new(Arc::new(BuiltinCodec), &config);
    controller.add_listener(switchboard::consts::OfType::PacketIn, Arc::new(PacketCounter(AtomicUsize::new(0))));
    controller.run(&config)?;

    tokio::signal::ctrl_c().await?;
    controller.shutdown().await;

    Ok(())
}
