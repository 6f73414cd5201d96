use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use voice_dispatch::{
    connection::ChannelConnection,
    options::PlaybackOptions,
    player::{Player, PlayerEvent},
    transcoder::StreamInput,
};

mod config;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("voice_dispatch", log::LevelFilter::Debug)
        .filter_module("voice_relay", log::LevelFilter::Debug)
        .init();
}

fn usage() -> ! {
    eprintln!("usage: voice-relay <file|url|-> [options-json]");
    eprintln!(r#"  e.g. voice-relay song.flac '{{"seek": 30, "volume": 0.5}}'"#);
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    voice_dispatch::init()?;
    let config = config::config();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else { usage() };
    let options: PlaybackOptions = match args.next() {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| anyhow::anyhow!("invalid options {}: {}", json, e))?,
        None => PlaybackOptions::default(),
    };
    let input = if input == "-" {
        StreamInput::Reader(Box::new(tokio::io::stdin()))
    } else {
        StreamInput::Path(input)
    };

    let (connection, mut frames) = ChannelConnection::new(256);
    let connection = Arc::new(connection);
    let player = Player::new(connection.clone(), &config.player_config())?;
    let mut events = player.subscribe();
    let mut errors = player.subscribe_errors();
    log::info!("decoding with {}", config.ffmpeg().display());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let playback = player.play_unknown_stream(input, options).await?;
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("interrupted");
                break;
            },
            Some(frame) = frames.recv() => {
                sent += 1;
                log::trace!("{}", frame);
            },
            Ok(event) = events.recv() => match event {
                PlayerEvent::Speaking(active) => log::info!("speaking: {}", active),
                PlayerEvent::Warn(message) => log::warn!("{}", message),
                PlayerEvent::End(id) if id == playback.id => break,
                PlayerEvent::End(_) => {}
            },
            Ok(error) = errors.recv() => {
                log::error!("playback failed: {}", error);
                break;
            },
        }
    }

    log::info!(
        "{} frames sent, {} dropped, position {:?}",
        sent,
        connection.dropped_frames(),
        playback.dispatcher.position()
    );
    player.stop();
    player.stopped().await;
    Ok(())
}
