use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use edition_mint::{
    identity::signing_key_from_hex,
    store::{self, Loaded},
    Amount, Identity, MintConfig, TokenId,
};

#[derive(Parser)]
#[command(name = "edition-mint", version, about = "Limited-edition token issuance ledger")]
struct Cli {
    /// Ledger state file.
    #[arg(long, global = true, default_value = "edition-mint.json")]
    state: PathBuf,

    /// Debug logging (overrides RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 key pair; the public key is the identity.
    Keygen {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Create a new ledger owned by the given secret key.
    Deploy {
        #[arg(long)]
        owner_sk_hex: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Mint a single token.
    Mint {
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        payment: Amount,
        #[arg(long)]
        uri: Option<String>,
    },
    /// Mint several tokens in one call.
    MintBatch {
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        count: u8,
        #[arg(long)]
        payment: Amount,
    },
    /// Pay the accumulated balance out to the owner.
    Withdraw {
        #[arg(long)]
        sk_hex: String,
    },
    /// Print supply, balance and state root.
    Status,
    OwnerOf { id: TokenId },
    TokensOf { identity: String },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_identity(value: &str) -> Result<Identity> {
    Identity::from_public_hex(value).with_context(|| format!("invalid identity {value}"))
}

fn parse_secret(name: &str, value: &str) -> Result<SigningKey> {
    signing_key_from_hex(value).with_context(|| format!("invalid {name}"))
}

fn open(path: &Path) -> Result<Loaded> {
    store::load(path).with_context(|| format!("loading {}", path.display()))
}

fn commit(path: &Path, loaded: &Loaded) -> Result<()> {
    loaded
        .save()
        .with_context(|| format!("saving {}", path.display()))
}

//==================== commands ====================//

fn keygen_cmd(out_dir: Option<PathBuf>) -> Result<()> {
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let identity = Identity::from_signing_key(&sk);

    if let Some(dir) = out_dir {
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        fs::write(dir.join("sk.hex"), hex::encode(sk_bytes))?;
        fs::write(dir.join("pk.hex"), identity.as_str())?;
        println!("keypair written → {}", dir.display());
    } else {
        println!("sk: {}", hex::encode(sk_bytes));
    }
    println!("identity: {identity}");
    Ok(())
}

fn deploy_cmd(state: &Path, owner_sk_hex: &str, config: Option<&Path>) -> Result<()> {
    let owner = Identity::from_signing_key(&parse_secret("--owner-sk-hex", owner_sk_hex)?);
    let config = match config {
        Some(path) => {
            MintConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => MintConfig::default(),
    };
    store::deploy(state, owner.clone(), config)
        .with_context(|| format!("deploying to {}", state.display()))?;
    println!("ledger deployed → {} (owner {owner})", state.display());
    Ok(())
}

fn mint_cmd(state: &Path, recipient: &str, payment: Amount, uri: Option<&str>) -> Result<()> {
    let recipient = parse_identity(recipient)?;
    let loaded = open(state)?;
    let id = match uri {
        Some(uri) => loaded.ledger.mint_with_uri(&recipient, uri, payment)?,
        None => loaded.ledger.mint_one(&recipient, payment)?,
    };
    commit(state, &loaded)?;
    println!("minted token {id} → {recipient}");
    Ok(())
}

fn mint_batch_cmd(state: &Path, recipient: &str, count: u8, payment: Amount) -> Result<()> {
    let recipient = parse_identity(recipient)?;
    let loaded = open(state)?;
    let ids = loaded.ledger.mint_batch(&recipient, count, payment)?;
    commit(state, &loaded)?;
    println!("minted tokens {ids:?} → {recipient}");
    Ok(())
}

fn withdraw_cmd(state: &Path, sk_hex: &str) -> Result<()> {
    let caller = Identity::from_signing_key(&parse_secret("--sk-hex", sk_hex)?);
    let loaded = open(state)?;
    let amount = loaded.ledger.withdraw(&caller)?;
    commit(state, &loaded)?;
    println!(
        "withdrew {amount} → {caller} (account balance {})",
        loaded.accounts.balance(&caller)
    );
    Ok(())
}

fn status_cmd(state: &Path) -> Result<()> {
    let loaded = open(state)?;
    let ledger = &loaded.ledger;
    let status = json!({
        "owner": ledger.owner(),
        "config": ledger.config(),
        "total_supply": ledger.total_supply(),
        "remaining_supply": ledger.remaining_supply(),
        "balance": ledger.balance().to_string(),
        "state_root": hex::encode(ledger.state_root()),
        "events": ledger.events().len(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn owner_of_cmd(state: &Path, id: TokenId) -> Result<()> {
    let loaded = open(state)?;
    match loaded.ledger.owner_of(id) {
        Some(owner) => {
            println!("{owner}");
            if let Some(uri) = loaded.ledger.token_uri(id) {
                println!("uri: {uri}");
            }
            Ok(())
        }
        None => bail!("token {id} has not been minted"),
    }
}

fn tokens_of_cmd(state: &Path, identity: &str) -> Result<()> {
    let identity = parse_identity(identity)?;
    let loaded = open(state)?;
    let ids = loaded.ledger.tokens_of(&identity);
    println!("{}", serde_json::to_string(&ids)?);
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(state = %cli.state.display(), "edition-mint starting");

    let state = cli.state.as_path();
    match cli.command {
        Command::Keygen { out_dir } => keygen_cmd(out_dir),
        Command::Deploy {
            owner_sk_hex,
            config,
        } => deploy_cmd(state, &owner_sk_hex, config.as_deref()),
        Command::Mint {
            recipient,
            payment,
            uri,
        } => mint_cmd(state, &recipient, payment, uri.as_deref()),
        Command::MintBatch {
            recipient,
            count,
            payment,
        } => mint_batch_cmd(state, &recipient, count, payment),
        Command::Withdraw { sk_hex } => withdraw_cmd(state, &sk_hex),
        Command::Status => status_cmd(state),
        Command::OwnerOf { id } => owner_of_cmd(state, id),
        Command::TokensOf { identity } => tokens_of_cmd(state, &identity),
    }
}
