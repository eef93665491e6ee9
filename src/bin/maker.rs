//! `maker serve` -- accept taker connections and run the maker side of a
//! CoinJoin: FILL, AUTH, SIGN against whatever this process already holds.
//!
//! One TCP connection is treated as one taker session, matching the direct
//! peer-to-peer channel this demo targets (directory relay and multi-maker
//! fan-in are modeled in [`joinswap::maker`] but not wired to a listener
//! here).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use bdk::bitcoin::secp256k1::{rand, Secp256k1, SecretKey};
use bdk::bitcoin::{Network, OutPoint, Script};

use joinswap::collaborators::{EphemeralWallet, InMemoryOracle, UtxoOracle, WalletHandle};
use joinswap::config::CoreConfig;
use joinswap::envelope::AppMessage;
use joinswap::error::MakerError;
use joinswap::maker::{self, MakerSession};
use joinswap::persist::MakerBlacklist;
use joinswap::registry::derive_nick;
use joinswap::transport;
use joinswap::verifier::MakerContract;

/// Flat per-input fee split used by this demo's offer; a deployment reads
/// these from the advertised order instead of hardcoding them.
const TXFEE_SHARE_SATS: u64 = 200;
const REAL_CJFEE_SATS: u64 = 500;

#[derive(Parser)]
#[command(name = "maker", about = "CoinJoin maker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Serve {
        #[arg(long, default_value = "0.0.0.0:7903")]
        listen: String,
        #[arg(long)]
        cj_amount: u64,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
        #[arg(long, default_value = "cmtdata")]
        cmt_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let Command::Serve {
        listen,
        cj_amount,
        config,
        state_dir,
        cmt_dir,
    } = cli.command;

    if let Err(e) = serve(&listen, cj_amount, config.as_deref(), &state_dir, &cmt_dir).await {
        error!("serve failed: {e}");
        std::process::exit(1);
    }
}

struct SharedState {
    blacklist: Mutex<MakerBlacklist>,
    oracle: InMemoryOracle,
    wallet: EphemeralWallet,
    config: CoreConfig,
    cj_amount: u64,
    my_utxos: Vec<(OutPoint, u64)>,
    my_cj_script: Script,
    my_change_script: Script,
}

async fn serve(
    listen: &str,
    cj_amount: u64,
    config_path: Option<&std::path::Path>,
    state_dir: &std::path::Path,
    cmt_dir: &std::path::Path,
) -> Result<(), MakerError> {
    let empty_overrides = config::Config::builder()
        .build()
        .expect("empty config builds");
    let config = CoreConfig::load(config_path, empty_overrides).map_err(|e| MakerError::Config(e.to_string()))?;

    let secp = Secp256k1::new();
    let signing_key = SecretKey::new(&mut rand::thread_rng());
    let my_pub = bdk::bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &signing_key);
    let nick = derive_nick(&my_pub, 5);
    info!("maker nick {nick}");

    let nick_file = joinswap::persist::NickFile::new(state_dir, "maker");
    nick_file.write(&nick).map_err(|e| MakerError::Config(e.to_string()))?;

    let wallet = EphemeralWallet::generate(Network::Regtest).map_err(MakerError::from)?;
    let oracle = InMemoryOracle::new();
    let blacklist = MakerBlacklist::load(cmt_dir).map_err(|e| MakerError::Config(e.to_string()))?;

    let my_cj_script = wallet.fresh_cj_address(0)?;
    let my_change_script = wallet.fresh_change_address(0)?;
    let spendable = wallet.list_spendable_utxos(0)?;
    let my_utxos: Vec<(OutPoint, u64)> = spendable.iter().map(|(op, info)| (*op, info.value)).collect();

    let state = Arc::new(SharedState {
        blacklist: Mutex::new(blacklist),
        oracle,
        wallet,
        config,
        cj_amount,
        my_utxos,
        my_cj_script,
        my_change_script,
    });

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| MakerError::Config(format!("bind {listen}: {e}")))?;
    info!("listening on {listen}");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let my_nick = nick.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &my_nick, &state).await {
                warn!("session with {peer_addr} ended: {e}");
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, my_nick: &str, state: &SharedState) -> Result<(), MakerError> {
    let (mut reader, mut writer) = transport::split(socket);
    let secp = Secp256k1::new();
    let mut bucket = maker::TokenBucket::new(state.config.message_rate_limit, state.config.message_burst_limit);
    let mut session: Option<MakerSession> = None;

    loop {
        let env = transport::recv_envelope(&mut reader).await.map_err(MakerError::from)?;
        if !bucket.try_consume(Instant::now()) {
            warn!("rate limit exceeded on connection");
            return Err(MakerError::RateLimited("message rate exceeded".into()));
        }

        let msg = AppMessage::parse(&env.line).map_err(MakerError::from)?;
        match msg.command.as_str() {
            "fill" => {
                let blacklist = state.blacklist.lock().await;
                let new_session = maker::handle_fill(&mut writer, my_nick, &msg, &blacklist).await?;
                session = Some(new_session);
            }
            "auth" => {
                let sess = session
                    .as_mut()
                    .ok_or_else(|| MakerError::Config("auth received before fill".into()))?;
                let mut blacklist = state.blacklist.lock().await;
                maker::handle_auth(
                    &secp,
                    &mut writer,
                    my_nick,
                    sess,
                    &msg,
                    &mut blacklist,
                    &state.oracle,
                    &state.config,
                    state.cj_amount,
                    &state.my_utxos,
                    &state.my_cj_script,
                    &state.my_change_script,
                )
                .await?;
            }
            "tx" => {
                let sess = session
                    .as_mut()
                    .ok_or_else(|| MakerError::Config("tx received before auth".into()))?;
                let peer_pub = sess
                    .peer_pub
                    .clone()
                    .ok_or_else(|| MakerError::Config("peer key unknown".into()))?;
                let plaintext = joinswap::channel::decrypt(&sess.my_keys, &peer_pub, &msg.args[0])?;
                let bytes = hex::decode(&plaintext).map_err(|_| MakerError::Config("malformed tx hex".into()))?;
                let tx = bdk::bitcoin::consensus::encode::deserialize(&bytes)
                    .map_err(|_| joinswap::error::VerifierError::Unparseable)?;

                let my_outpoints: Vec<OutPoint> = state.my_utxos.iter().map(|(op, _)| *op).collect();
                let my_total_in: u64 = state.my_utxos.iter().map(|(_, v)| v).sum();
                let contract = MakerContract {
                    my_utxos: &my_outpoints,
                    my_total_in,
                    cj_amount: state.cj_amount,
                    txfee_share: TXFEE_SHARE_SATS,
                    real_cjfee: REAL_CJFEE_SATS,
                    my_cj_script: &state.my_cj_script,
                    my_change_script: &state.my_change_script,
                    dust_threshold: state.config.dust_threshold,
                };
                let input_scripts: Vec<Script> = state
                    .my_utxos
                    .iter()
                    .filter_map(|(op, _)| state.oracle.get_utxo(*op).ok().flatten())
                    .map(|info| info.script_pubkey)
                    .collect();

                maker::handle_tx(&mut writer, my_nick, sess, &tx, &contract, &input_scripts, &state.wallet).await?;
                return Ok(());
            }
            other => {
                warn!("unexpected command {other} outside fill/auth/tx");
            }
        }
    }
}
