//! `taker run` -- drive a single CoinJoin against a known set of makers.
//!
//! Peer discovery through a directory's orderbook and peerlist protocol
//! is modeled in [`joinswap::registry`] but not wired up here; this
//! binary targets makers supplied directly, as for a set of peers
//! exchanged out of band or over a pre-existing direct channel.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use log::{error, info};

use bdk::bitcoin::secp256k1::{rand, Secp256k1, SecretKey};
use bdk::bitcoin::{Network, OutPoint};
use tokio::net::TcpStream;

use joinswap::collaborators::{EphemeralWallet, InMemoryOracle, UtxoOracle, WalletHandle};
use joinswap::config::CoreConfig;
use joinswap::envelope::{AppMessage, EnvelopeType, Transport};
use joinswap::error::TakerError;
use joinswap::persist::{History, NickFile, TakerCommitmentStore};
use joinswap::registry::{derive_nick, CjFee, Offer, OfferKind, Registry};
use joinswap::taker::{self, MakerSlot, RunContext};
use joinswap::transport::{self, Reader, Writer};

#[derive(Parser)]
#[command(name = "taker", about = "CoinJoin taker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(long)]
        amount: u64,
        #[arg(long = "maker", required = true)]
        makers: Vec<String>,
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
    let Command::Run {
        amount,
        makers,
        config,
        state_dir,
        cmt_dir,
    } = cli.command;

    if let Err(e) = run(amount, &makers, config.as_deref(), &state_dir, &cmt_dir).await {
        error!("run failed: {e}");
        std::process::exit(1);
    }
}

async fn run(
    amount: u64,
    maker_addrs: &[String],
    config_path: Option<&Path>,
    state_dir: &Path,
    cmt_dir: &Path,
) -> Result<(), TakerError> {
    let empty_overrides = config::Config::builder().build().expect("empty config builds");
    let config = CoreConfig::load(config_path, empty_overrides).map_err(|e| TakerError::Config(e.to_string()))?;

    if maker_addrs.len() < config.counterparty_count {
        return Err(TakerError::InsufficientCounterparties {
            needed: config.counterparty_count,
            available: maker_addrs.len(),
        });
    }

    let secp = Secp256k1::new();
    let signing_key = SecretKey::new(&mut rand::thread_rng());
    let my_pub = bdk::bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &signing_key);
    let nick = derive_nick(&my_pub, 5);
    info!("taker nick {nick}");

    let nick_file = NickFile::new(state_dir, "taker");
    nick_file.write(&nick).map_err(|e| TakerError::WalletUnavailable(e.to_string()))?;

    let wallet = EphemeralWallet::generate(Network::Regtest).map_err(TakerError::from)?;
    let oracle = InMemoryOracle::new();
    let registry = Registry::new();
    let mut commitments =
        TakerCommitmentStore::load(cmt_dir).map_err(|e| TakerError::WalletUnavailable(e.to_string()))?;
    let history = History::new(state_dir.join("coinjoin_history.csv"));

    let taker_cj_script = wallet.fresh_cj_address(0)?;
    let taker_change_script = wallet.fresh_change_address(0)?;
    let spendable = wallet.list_spendable_utxos(0)?;
    let taker_inputs: Vec<(OutPoint, u64)> = spendable.iter().map(|(op, info)| (*op, info.value)).collect();
    let utxo_for_commitment = taker_inputs.first().map(|(op, _)| *op).unwrap_or_else(OutPoint::null);

    let mut slots = Vec::new();
    for (i, addr) in maker_addrs.iter().enumerate().take(config.counterparty_count) {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| TakerError::Transport(e.to_string()))?;
        let (mut reader, mut writer) = transport::split(socket);
        handshake(&mut reader, &mut writer, &nick).await?;

        let offer = Offer {
            maker_nick: format!("maker-{i}"),
            order_id: i as u64,
            kind: OfferKind::Relative,
            min_size: 0,
            max_size: u64::MAX,
            txfee_contribution: 0,
            cjfee: CjFee::Absolute(0),
            bond_score: 0.0,
            received_at: Instant::now(),
        };

        let (my_keys, peer_pub, podle) = taker::fill_maker(
            &secp,
            &mut reader,
            &mut writer,
            &nick,
            &offer,
            amount,
            &signing_key,
            0,
            &mut commitments,
            &utxo_for_commitment,
        )
        .await?;

        slots.push(MakerSlot {
            nick: offer.maker_nick,
            reader,
            writer,
            my_keys,
            peer_pub: Some(peer_pub),
            podle,
            retry_index: 0,
            inputs: Vec::new(),
            cj_script: None,
            change_script: None,
            change_value: 0,
        });
    }

    if slots.len() < config.counterparty_count {
        return Err(TakerError::InsufficientCounterparties {
            needed: config.counterparty_count,
            available: slots.len(),
        });
    }

    let mut ctx = RunContext {
        run_id: format!("{nick}-{}", slots.len()),
        config: &config,
        oracle: &oracle,
        wallet: &wallet,
        registry: &registry,
        commitments: &mut commitments,
        history: &history,
        transport: Transport::Direct,
    };

    let tx = taker::run(
        &mut ctx,
        &nick,
        &mut slots,
        &taker_inputs,
        &taker_cj_script,
        Some(taker_change_script),
        amount,
    )
    .await?;

    let txid = tx.txid();
    info!("broadcast coinjoin {txid}");
    nick_file.clear().ok();
    Ok(())
}

async fn handshake(reader: &mut Reader, writer: &mut Writer, nick: &str) -> Result<(), TakerError> {
    let hello = AppMessage {
        from_nick: nick.to_string(),
        to_nick: "any".to_string(),
        command: "handshake".to_string(),
        args: vec![],
    };
    transport::send_envelope(writer, EnvelopeType::Handshake, hello.render())
        .await
        .map_err(TakerError::from)?;
    let _ack = transport::recv_envelope(reader).await.map_err(TakerError::from)?;
    Ok(())
}
