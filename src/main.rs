// offlinepay CLI
//
//   offlinepay keygen
//   offlinepay demo [--data-dir DIR]
//   offlinepay inspect <HEX> [--issuer-key HEX]

use clap::{Parser, Subcommand};
use offlinepay::clock::{Clock, SystemClock};
use offlinepay::config::EngineConfig;
use offlinepay::gateway::{ChainTxHash, FundingRef, MockOracle};
use offlinepay::identity::{Keypair, KeyRegistry, PublicKey, SharedKeyRegistry};
use offlinepay::ledger::{MemoryLedgerStore, TokenLedgerStore};
use offlinepay::storage::{DeviceStore, SledLedgerStore};
use offlinepay::sync::{SyncClient, SyncClientConfig};
use offlinepay::token::{Amount, OfflineToken, TokenCodec, Validator};
use offlinepay::transport::{EnvelopeCodec, MemoryPeerLink, PeerEnvelope, TransportConfig};
use offlinepay::wallet::Wallet;
use offlinepay::OfflineTokenService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const ISSUER_LABEL: &str = "issuer";

#[derive(Parser)]
#[command(name = "offlinepay")]
#[command(about = "Offline payment tokens: mint, divide, pay and reconcile", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a holder keypair and print its address
    Keygen,

    /// Mint, divide, pay a peer offline and reconcile both devices
    Demo {
        /// Keep the ledger and both wallets in sled under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Decode a hex token or peer envelope and validate its tokens
    Inspect {
        hex: String,

        /// Issuer public key (hex) to validate signatures against
        #[arg(long)]
        issuer_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    match cli.command {
        Commands::Keygen => keygen(),
        Commands::Demo { data_dir } => demo(data_dir.as_deref()).await,
        Commands::Inspect { hex, issuer_key } => inspect(&hex, issuer_key.as_deref()),
    }
}

fn keygen() -> CliResult<()> {
    let keypair = Keypair::generate();
    println!("address:    {}", keypair.address());
    println!("owner:      {}", keypair.owner_commitment());
    println!("public key: {}", keypair.public_key().to_hex());
    println!("secret key: {}", hex::encode(keypair.to_bytes()));
    Ok(())
}

// ============================================================================
// DEMO
// ============================================================================

async fn demo(data_dir: Option<&Path>) -> CliResult<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = EngineConfig::default();
    config.validate()?;

    let issuer_store = data_dir.map(|d| DeviceStore::open(d.join("issuer"))).transpose()?;
    let issuer_key = match &issuer_store {
        Some(store) => load_or_create_key(store)?,
        None => Keypair::generate(),
    };
    let ledger: Arc<dyn TokenLedgerStore> = match data_dir {
        Some(dir) => Arc::new(SledLedgerStore::open(dir.join("ledger"), clock.clone())?),
        None => Arc::new(MemoryLedgerStore::new(clock.clone())),
    };

    let oracle = Arc::new(MockOracle::new());
    let keys = SharedKeyRegistry::default();
    let service = OfflineTokenService::new(
        ledger,
        oracle.clone(),
        keys,
        issuer_key,
        clock.clone(),
        config.clone(),
    )?;

    let alice_store = data_dir.map(|d| DeviceStore::open(d.join("alice"))).transpose()?;
    let bob_store = data_dir.map(|d| DeviceStore::open(d.join("bob"))).transpose()?;
    let validator = service.validator().clone();
    let mut alice = open_wallet(alice_store.as_ref(), &validator, &clock, &config).await?;
    let mut bob = open_wallet(bob_store.as_ref(), &validator, &clock, &config).await?;
    println!("alice: {}", alice.address());
    println!("bob:   {}", bob.address());

    // Fund alice on the mock chain and mint
    let funding = FundingRef::new(ChainTxHash::new(&format!("demo-{}", uuid::Uuid::new_v4())));
    oracle.set_confirmations(funding.tx_hash(), config.required_confirmations);
    let minted = service
        .mint(alice.owner_commitment(), Amount::from_major(100)?, &funding)
        .await?
        .into_token();
    println!("minted {} -> {}", minted.amount(), minted.id());
    alice.receive_token(minted).await?;

    // Offline payment over a peer link; alice's token is divided for change
    let (alice_link, bob_link) = MemoryPeerLink::pair(TransportConfig::default())?;
    let bob_address = bob.address();
    let amount = Amount::from_major(30)?;
    let (paid, accepted) = tokio::join!(
        alice.pay_peer(&alice_link, &bob_address, amount),
        bob.accept_peer(&bob_link),
    );
    let paid = paid?;
    accepted?;
    println!("paid {} offline in {}", paid.amount(), paid.id());
    println!("alice offline balance: {}", alice.offline_balance().await?);

    // Both devices reconcile
    let client = SyncClient::new(Arc::new(service.local_endpoint()), SyncClientConfig::default());
    for (name, wallet) in [("alice", &mut alice), ("bob", &mut bob)] {
        let report = client.sync_wallet(wallet).await?;
        println!(
            "{name} synced: {} accepted, {} rejected, cursor {}",
            report.response.accepted().count(),
            report.response.rejected().count(),
            report.response.last_sync_timestamp
        );
    }

    let status = service.get_transaction_status(paid.id()).await?;
    println!("transaction {}: {}", paid.id(), status.status);
    println!("alice balance after sync: {}", alice.offline_balance().await?);

    let swept = service.sweep_expired().await?;
    info!(swept = swept.len(), "sweep finished");

    if let (Some(a), Some(b)) = (&alice_store, &bob_store) {
        alice.save(a).await?;
        bob.save(b).await?;
        println!("wallets saved");
    }
    Ok(())
}

fn load_or_create_key(store: &DeviceStore) -> CliResult<Keypair> {
    if let Some(keypair) = store.load_keypair(ISSUER_LABEL)? {
        return Ok(keypair);
    }
    let keypair = Keypair::generate();
    store.save_keypair(ISSUER_LABEL, &keypair)?;
    store.flush()?;
    Ok(keypair)
}

async fn open_wallet(
    store: Option<&DeviceStore>,
    validator: &Validator,
    clock: &Arc<dyn Clock>,
    config: &EngineConfig,
) -> CliResult<Wallet> {
    let wallet = match store {
        Some(store) => Wallet::open(store, validator.clone(), clock.clone(), config.clone()).await?,
        None => Wallet::new(Keypair::generate(), validator.clone(), clock.clone(), config.clone()),
    };
    Ok(wallet)
}

// ============================================================================
// INSPECT
// ============================================================================

fn inspect(text: &str, issuer_key: Option<&str>) -> CliResult<()> {
    let validator = match issuer_key {
        Some(key) => {
            let public_key = PublicKey::from_hex(key.trim())?;
            let mut registry = KeyRegistry::new();
            registry.register(public_key, 0);
            Some(Validator::new(SharedKeyRegistry::new(registry)))
        }
        None => None,
    };

    let tokens = match TokenCodec::decode_hex(text.trim()) {
        Ok(token) => vec![token],
        Err(_) => match EnvelopeCodec::decode_hex(text.trim())? {
            PeerEnvelope::TokenBundle(tokens) => tokens,
            PeerEnvelope::Offer(offer) => {
                println!("offer {} for {}", offer.transaction_id(), offer.amount());
                offer.tokens
            }
            other => {
                println!("{} envelope", other.kind());
                Vec::new()
            }
        },
    };

    let now = SystemClock.now_millis();
    for token in &tokens {
        print_token(token)?;
        if let Some(validator) = &validator {
            println!("{}", validator.validate(token, None, now));
        }
    }
    Ok(())
}

fn print_token(token: &OfflineToken) -> CliResult<()> {
    println!("{}", TokenCodec::to_json(token)?);
    Ok(())
}
