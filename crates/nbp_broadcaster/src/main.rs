//! # NBP Broadcaster
//!
//! Transmite KPIs de telemetria para o TrackAddict / RaceRender usando o
//! Numeric Broadcast Protocol (NBP1), via Bluetooth serial (RFCOMM) ou TCP.
//!
//! Os KPIs chegam pela entrada padrão, uma linha por mensagem (ver
//! [`stdin_producer`]).
//!
//! ## Uso
//! ```bash
//! sensores | nbp_broadcaster                         # config.toml ao lado do executável
//! sensores | nbp_broadcaster --device /dev/rfcomm1   # outro dispositivo serial
//! sensores | nbp_broadcaster --tcp 0.0.0.0:35000     # variante Wi-Fi
//! nbp_broadcaster --config ./carro.toml < volta.csv
//! ```

mod stdin_producer;

use nbp_core::config::{AppConfig, TransportKind};
use nbp_core::transport::{Transport, TcpTransport, open_serial};
use nbp_core::{Dispatcher, NbpMessage, PROTOCOL_VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Argumentos de linha de comando.
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    device: Option<String>,
    tcp: Option<String>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| args.next().ok_or_else(|| format!("{flag} requer um valor"));
            match arg.as_str() {
                "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
                "--device" => parsed.device = Some(value("--device")?),
                "--tcp" => parsed.tcp = Some(value("--tcp")?),
                other => return Err(format!("Argumento desconhecido: {other}")),
            }
        }
        if parsed.device.is_some() && parsed.tcp.is_some() {
            return Err("--device e --tcp são mutuamente exclusivos".into());
        }
        Ok(parsed)
    }

    /// Sobrescreve o transporte da configuração.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(device) = &self.device {
            config.transport.kind = TransportKind::Serial;
            config.transport.device = device.clone();
        }
        if let Some(bind) = &self.tcp {
            config.transport.kind = TransportKind::Tcp;
            config.transport.bind = bind.clone();
        }
    }
}

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            error!("{e}");
            eprintln!("Uso: nbp_broadcaster [--config <arquivo>] [--device <tty> | --tcp <ip:porta>]");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    // ── Carregar config ──
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)?;

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    args.apply(&mut config);
    config.validate()?;

    // ── Transporte ──
    let transport = open_transport(&config)?;
    let target = transport.describe();

    // ── Fila + Dispatcher ──
    let (producer, consumer) = nbp_core::queue::channel(config.queue_capacity(), config.queue.overflow);
    let dispatcher = Dispatcher::new(config.dispatch_config(), consumer, transport);
    let status = dispatcher.handle();
    let shutdown = dispatcher.shutdown_handle();
    let worker = dispatcher.spawn()?;

    producer.enqueue(NbpMessage::Metadata(config.metadata()))?;

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   NBP BROADCASTER – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  Dispositivo: {}", config.broadcaster.device_name);
    println!("  Destino:     {target}");
    println!("  Intervalo:   {} ms", config.broadcaster.max_update_interval_ms);
    println!("  Protocolo:   {PROTOCOL_VERSION}");
    println!("══════════════════════════════════════════════");
    println!();

    stdin_producer::spawn_stdin_producer(producer, shutdown)?;

    let result = worker
        .join()
        .map_err(|_| "thread do dispatcher entrou em pânico")?;
    let summary = result?;

    info!(
        "Sessão encerrada ({}) | {} pacotes, {} metadata, {} descartados, {} retries",
        status.state(),
        summary.packets_sent,
        summary.metadata_sent,
        summary.items_dropped,
        summary.write_retries
    );
    Ok(())
}

fn open_transport(config: &AppConfig) -> std::io::Result<Box<dyn Transport>> {
    Ok(match config.transport.kind {
        TransportKind::Serial => Box::new(open_serial(
            &config.transport.device,
            config.transport.baud_rate,
            config.write_timeout(),
        )?),
        TransportKind::Tcp => Box::new(TcpTransport::bind(
            config.transport.bind.as_str(),
            config.write_timeout(),
        )?),
    })
}
