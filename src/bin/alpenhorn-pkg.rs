// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use alpenhorn::persist::write_file_atomic;
use alpenhorn::pkg::{db::Db, http, Server};

#[derive(Parser)]
#[command(name = "alpenhorn-pkg", about = "Alpenhorn private-key generator server")]
struct Cli {
    /// Path to the server config file.
    #[arg(long, value_name = "FILE")]
    conf: Option<PathBuf>,
    /// Write a fresh config file with a new keypair and exit.
    #[arg(long)]
    init: bool,
}

#[derive(Serialize, Deserialize)]
struct Config {
    public_key: String,
    private_key: String,
    listen_addr: String,
    db_path: String,
}

const INIT_CONFIG_PATH: &str = "pkg-init.conf";

fn write_new_config() -> Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    let conf = Config {
        public_key: hex::encode(key.verifying_key().to_bytes()),
        private_key: hex::encode(key.to_bytes()),
        listen_addr: "0.0.0.0:28000".into(),
        db_path: "alpenhorn-pkg.db".into(),
    };
    let data = toml::to_string_pretty(&conf).context("encoding config")?;
    write_file_atomic(Path::new(INIT_CONFIG_PATH), data.as_bytes())?;
    println!("wrote {INIT_CONFIG_PATH}");
    Ok(())
}

fn load_signing_key(conf: &Config) -> Result<SigningKey> {
    let seed: [u8; 32] = hex::decode(&conf.private_key)
        .context("decoding private key")?
        .try_into()
        .map_err(|_| anyhow!("private key must be 32 bytes"))?;
    let key = SigningKey::from_bytes(&seed);
    if hex::encode(key.verifying_key().to_bytes()) != conf.public_key {
        bail!("config public key does not match private key");
    }
    Ok(key)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.init {
        return write_new_config();
    }
    let Some(conf_path) = cli.conf else {
        bail!("specify config file with --conf (or create one with --init)");
    };

    let data = fs::read_to_string(&conf_path)
        .with_context(|| format!("reading config {}", conf_path.display()))?;
    let conf: Config =
        toml::from_str(&data).with_context(|| format!("parsing config {}", conf_path.display()))?;

    let signing_key = load_signing_key(&conf)?;
    let db = Db::open(&conf.db_path)
        .with_context(|| format!("opening database {}", conf.db_path))?;
    let server = Arc::new(Server::new(signing_key, db));

    let listener = tokio::net::TcpListener::bind(&conf.listen_addr)
        .await
        .with_context(|| format!("binding {}", conf.listen_addr))?;
    info!("listening on {}", conf.listen_addr);
    axum::serve(listener, http::router(server))
        .await
        .context("server error")
}
