use crate::metrics;
use crate::registry::{accept, count_by_state, LogRelay, WatchRegistry};
use clap::builder::ArgPredicate;
use clap::{Parser, Subcommand};
use eyre::Result;
use futures::pin_mut;
use merchantnode::bitcoin::secp256k1::{rand::thread_rng, Secp256k1, SecretKey};
use merchantnode::bitcoin::{OutPoint, PrivateKey};
use merchantnode::{
    params_value_parser, ActiveMerchantnode, Announcement, BitcoinCoreChain, Context,
    LocalIdentity, Merchantnode, NetworkParams, SharedChain, SystemClock, CHECK_SECONDS,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

pub fn parse_private_key(s: &str) -> Result<PrivateKey, eyre::Error> {
    PrivateKey::from_wif(s).map_err(|_err| eyre::Error::msg("Failed to deserialize key"))
}

pub fn parse_outpoint(s: &str) -> Result<OutPoint, eyre::Error> {
    OutPoint::from_str(s).map_err(|err| eyre::eyre!("Invalid outpoint {s}: {err}"))
}

#[derive(Parser)]
#[command(author, about = "Merchantnode registry daemon", long_about = None)]
pub struct App {
    #[arg(
        long = "network",
        value_name = "NETWORK_OR_PATH",
        value_parser = params_value_parser,
        default_value = "regtest",
        default_value_if("dev", ArgPredicate::IsPresent, Some("dev"))
    )]
    params: NetworkParams,

    #[arg(long)]
    pub dev: bool,

    #[clap(
        long,
        env = "BITCOIN_RPC_URL",
        default_value_if("dev", ArgPredicate::IsPresent, Some("http://0.0.0.0:18443"))
    )]
    pub bitcoin_rpc_url: Option<String>,

    #[clap(
        long,
        env = "BITCOIN_RPC_USER",
        default_value_if("dev", ArgPredicate::IsPresent, Some("rpcuser"))
    )]
    pub bitcoin_rpc_user: Option<String>,

    #[clap(
        long,
        env = "BITCOIN_RPC_PASS",
        default_value_if("dev", ArgPredicate::IsPresent, Some("rpcpassword"))
    )]
    pub bitcoin_rpc_pass: Option<String>,

    /// Collateral outpoint of the merchantnode this process operates
    #[arg(long, value_parser = parse_outpoint, requires = "merchantnode_key")]
    pub merchantnode_outpoint: Option<OutPoint>,

    /// Service key (WIF) of the merchantnode this process operates
    #[arg(long, value_parser = parse_private_key, requires = "merchantnode_outpoint")]
    pub merchantnode_key: Option<PrivateKey>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a fresh service key
    Genkey,
    /// Validate an announcement against the chain and print the verdict
    Verify { announcement: PathBuf },
    /// Track announced merchantnodes and re-evaluate their state periodically
    Watch {
        #[arg(required = true)]
        announcements: Vec<PathBuf>,
    },
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("app={rust_log_level},merchantnode={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn bitcoin_core(&self) -> Result<BitcoinCoreChain> {
        let url = self
            .bitcoin_rpc_url
            .as_deref()
            .ok_or_else(|| eyre::eyre!("--bitcoin-rpc-url is required"))?;
        Ok(BitcoinCoreChain::new(
            url,
            self.bitcoin_rpc_user.clone().unwrap_or_default(),
            self.bitcoin_rpc_pass.clone().unwrap_or_default(),
        )?)
    }

    fn local_identity(&self) -> Option<ActiveMerchantnode> {
        let outpoint = self.merchantnode_outpoint?;
        let key = self.merchantnode_key?;
        Some(ActiveMerchantnode {
            outpoint,
            pubkey: key.public_key(&Secp256k1::new()),
        })
    }

    async fn execute(self) -> Result<()> {
        match &self.command {
            Command::Genkey => self.genkey(),
            Command::Verify { announcement } => self.verify(announcement),
            Command::Watch { announcements } => self.watch(announcements).await,
        }
    }

    fn genkey(&self) -> Result<()> {
        let secret = SecretKey::new(&mut thread_rng());
        let key = PrivateKey::new(secret, self.params.network);
        println!("{}", key.to_wif());
        println!("{}", key.public_key(&Secp256k1::new()));
        Ok(())
    }

    fn verify(&self, path: &Path) -> Result<()> {
        let core = self.bitcoin_core()?;
        let registry = WatchRegistry::new(!core.is_initial_block_download()?);
        let chain = RwLock::new(core);
        let local = self.local_identity();
        let ctx = Context {
            params: &self.params,
            chain: &chain as &SharedChain,
            registry: &registry,
            relay: &LogRelay,
            clock: &SystemClock,
            local: local.as_ref().map(|l| l as &dyn LocalIdentity),
        };

        let mut announcement = load_announcement(path)?;
        let result = announcement
            .simple_check(&ctx)
            .and_then(|_| announcement.check_outpoint(&ctx));

        let verdict = match &result {
            Ok(()) => json!({
                "hash": announcement.hash().to_string(),
                "accepted": true,
                "state": announcement.state.to_string(),
            }),
            Err(err) => json!({
                "hash": announcement.hash().to_string(),
                "accepted": false,
                "error": err.to_string(),
                "misbehavior": err.misbehavior(),
                "retry": err.is_transient(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&verdict)?);
        Ok(())
    }

    async fn watch(&self, paths: &[PathBuf]) -> Result<()> {
        let core = self.bitcoin_core()?;
        let registry = WatchRegistry::new(!core.is_initial_block_download()?);
        let chain = RwLock::new(core.clone());
        let local = self.local_identity();
        let ctx = Context {
            params: &self.params,
            chain: &chain as &SharedChain,
            registry: &registry,
            relay: &LogRelay,
            clock: &SystemClock,
            local: local.as_ref().map(|l| l as &dyn LocalIdentity),
        };

        let mut records: BTreeMap<OutPoint, Merchantnode> = BTreeMap::new();
        for path in paths {
            let announcement = load_announcement(path)?;
            if let Err(err) = accept(&mut records, announcement, &ctx) {
                warn!(
                    path = %path.display(),
                    misbehavior = err.misbehavior(),
                    "Announcement rejected: {}", err
                );
            }
        }
        registry.finish_list_sync(records.len());
        info!("Watching {} merchantnodes", records.len());

        metrics::start_server(self.metrics_port).await;

        let mut interval = tokio::time::interval(Duration::from_secs(CHECK_SECONDS as u64));
        loop {
            interval.tick().await;

            match core.is_initial_block_download() {
                Ok(ibd) => registry.set_blockchain_synced(!ibd),
                Err(err) => warn!("Failed to query sync status: {}", err),
            }

            for record in records.values_mut() {
                let before = record.state;
                record.check(false, &ctx);
                if record.state != before {
                    debug!(outpoint = %record.outpoint, "{} -> {}", before, record.state);
                }
            }
            metrics::set_watched(&count_by_state(&records));
        }
    }
}

fn load_announcement(path: &Path) -> Result<Announcement> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
