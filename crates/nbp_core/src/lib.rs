//! # NBP Core
//!
//! Implementação do Numeric Broadcast Protocol v1 (HP Tuners / TrackAddict)
//! para transmitir KPIs numéricos de telemetria (RPM, velocidade,
//! temperaturas…) por um link serial Bluetooth ou TCP.
//!
//! ## Módulos
//! - [`types`] – KPIs, tipos de pacote e mensagens da fila
//! - [`protocol`] – Encoder NBP1 e decoder de referência
//! - [`queue`] – Fila multi-produtor com política de overflow
//! - [`dispatcher`] – Consumidor com limite de taxa, fusão e retry
//! - [`transport`] – Saídas serial e TCP
//! - [`config`] – Configuração unificada via TOML
//!
//! ## Uso
//! ```no_run
//! use nbp_core::{Dispatcher, DispatchConfig, Kpi, NbpMessage, OverflowPolicy};
//! use nbp_core::transport::{DEFAULT_BAUD_RATE, open_serial};
//! use std::time::Duration;
//!
//! let (producer, consumer) = nbp_core::queue::channel(Some(256), OverflowPolicy::DropOldest);
//! let serial = open_serial("/dev/rfcomm0", DEFAULT_BAUD_RATE, Duration::from_secs(1))?;
//! let worker = Dispatcher::new(DispatchConfig::default(), consumer, serial).spawn()?;
//!
//! producer.enqueue(NbpMessage::Update(vec![Kpi::new("RPM", "RPM", 3200.0)]))?;
//! drop(producer);
//! worker.join().expect("dispatcher thread")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod types;
pub mod protocol;
pub mod queue;
pub mod dispatcher;
pub mod transport;
pub mod config;

// Re-exports convenientes
pub use types::{DeviceMetadata, DispatcherState, Kpi, KpiUnit, NbpMessage, PacketType, PROTOCOL_VERSION};
pub use protocol::{decode_packet, encode_message, DecodeError, EncodingError, NbpPacket};
pub use queue::{OverflowPolicy, QueueError, QueueProducer};
pub use dispatcher::{DispatchConfig, DispatchError, Dispatcher, DispatcherHandle, ShutdownHandle};
pub use transport::{SerialTransport, Transport, TcpTransport};
pub use config::{AppConfig, ConfigError};
