//! domocand: runs a DomoCAN gateway against a SocketCAN interface.
//!
//! ```bash
//! domocand --interface can0 --address 1 listen --node CoinCounter:20:counter
//! domocand --config gateway.toml send-coin --node 30 --coin 4
//! ```

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    daemon::main()
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("domocand needs SocketCAN, which is only available on Linux")
}

#[cfg(target_os = "linux")]
mod daemon {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{bail, Context, Result};
    use clap::{Parser, Subcommand};
    use tracing_subscriber::EnvFilter;

    use domocan::{
        Command, CoinCode, DeviceKind, FileConfig, Gateway, GatewayConfig, Hardware,
        MemoryRegistry, NodeAddress, SocketCanBus, Timing,
    };

    /// DomoCAN gateway daemon
    #[derive(Parser, Debug)]
    #[command(name = "domocand", version, about, long_about = None)]
    struct Cli {
        /// TOML configuration file, overrides the flags below
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// CAN interface name
        #[arg(short, long, default_value = "can0")]
        interface: String,

        /// Own node address of the gateway (0..=126)
        #[arg(short, long, default_value = "1")]
        address: String,

        /// Host id of this gateway instance
        #[arg(long, default_value_t = 1)]
        hardware_id: u32,

        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand, Debug)]
    enum Commands {
        /// Run the receive worker and log every registry update until Ctrl-C
        Listen {
            /// Node to configure before listening, as KIND:ADDRESS:NAME
            /// (e.g. CoinCounter:20:counter). May be repeated.
            #[arg(long = "node")]
            nodes: Vec<String>,
        },

        /// Release one coin from a coin sender and wait for its acknowledge
        SendCoin {
            /// Address of the coin sender node
            #[arg(long)]
            node: u8,

            /// Coin code (1, 2, 4, 6, 8, 10 or 12)
            #[arg(long)]
            coin: u8,
        },
    }

    type DaemonGateway = Gateway<SocketCanBus, MemoryRegistry>;

    pub fn main() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();

        let cli = Cli::parse();
        let (config, timing) = load_config(&cli)?;

        let bus = Arc::new(SocketCanBus::new(config.interface.clone()));
        let registry = Arc::new(MemoryRegistry::new());
        let mut gateway = Gateway::new(config, bus, registry.clone()).with_timing(timing);

        match cli.command {
            Commands::Listen { nodes } => {
                let admin = gateway.nodes();

                for arg in &nodes {
                    let (name, kind, address) = parse_node(arg)?;
                    admin
                        .add_node(&name, kind, address)
                        .with_context(|| format!("failed to add node {arg:?}"))?;
                }

                gateway.start().context("failed to start the gateway")?;

                let result = listen(&gateway, &registry, timing.heartbeat_interval);
                gateway.stop();
                result?;
            }
            Commands::SendCoin { node, coin } => {
                let target = NodeAddress::new(node)
                    .with_context(|| format!("node address {node} out of range"))?;
                let coin = CoinCode::try_from(coin).context("unsupported coin code")?;

                gateway
                    .send_command(target, Command::ReleaseCoin(coin))
                    .with_context(|| format!("node {target} did not release the coin"))?;

                tracing::info!(node = %target, ?coin, "Coin released");
            }
        }

        Ok(())
    }

    /// Logs the registry and the worker status every `interval` until Ctrl-C.
    fn listen(gateway: &DaemonGateway, registry: &MemoryRegistry, interval: Duration) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build the signal runtime")?;

        runtime
            .block_on(async {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        signal = tokio::signal::ctrl_c() => return signal,
                        _ = ticker.tick() => report(gateway, registry),
                    }
                }
            })
            .context("failed to listen for Ctrl-C")?;

        tracing::info!("Shutdown signal received");
        Ok(())
    }

    fn report(gateway: &DaemonGateway, registry: &MemoryRegistry) {
        for record in registry.devices(gateway.config().hardware_id) {
            tracing::info!(
                device = %record.entry.key.device_id(),
                unit = record.entry.unit,
                name = %record.entry.name,
                counter = record.counter,
                state = %record.text,
                "Device"
            );
        }

        tracing::info!(
            state = ?gateway.state(),
            last_heartbeat = ?gateway.last_heartbeat(),
            "Gateway status"
        );
    }

    fn load_config(cli: &Cli) -> Result<(GatewayConfig, Timing)> {
        match &cli.config {
            Some(path) => {
                let file = FileConfig::load(path)?;
                Ok((file.gateway()?, file.timing()))
            }
            None => Ok((
                GatewayConfig::from_host(cli.hardware_id, &cli.address, &cli.interface)?,
                Timing::default(),
            )),
        }
    }

    /// Parses `KIND:ADDRESS:NAME`, where KIND is a device kind name or number.
    fn parse_node(arg: &str) -> Result<(String, DeviceKind, NodeAddress)> {
        let mut parts = arg.splitn(3, ':');
        let (Some(kind), Some(address), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("expected KIND:ADDRESS:NAME, got {arg:?}");
        };

        let kind = match kind.parse::<u8>() {
            Ok(raw) => DeviceKind::try_from(raw)?,
            Err(_) => DeviceKind::ALL
                .into_iter()
                .find(|candidate| format!("{candidate:?}").eq_ignore_ascii_case(kind))
                .with_context(|| format!("unknown device kind {kind:?}"))?,
        };

        let address = address
            .parse::<u8>()
            .ok()
            .and_then(NodeAddress::new)
            .with_context(|| format!("invalid node address {address:?}"))?;

        Ok((name.to_string(), kind, address))
    }
}
