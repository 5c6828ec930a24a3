//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável. Seções ausentes usam os
//! valores padrão; configuração inválida aborta a inicialização antes de
//! qualquer pacote ser enviado.

use crate::dispatcher::DispatchConfig;
use crate::protocol::validate_device_name;
use crate::queue::OverflowPolicy;
use crate::transport::{DEFAULT_BAUD_RATE, DEFAULT_SERIAL_DEVICE, DEFAULT_TCP_BIND};
use crate::types::{DeviceMetadata, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Maior intervalo de atualização aceito (ms).
const MAX_UPDATE_INTERVAL_MS: u64 = 60_000;

/// Erros de configuração. Fatais na inicialização.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Erro ao parsear {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro ao salvar {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuração inválida: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Identidade e cadência do broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Nome anunciado no pacote METADATA
    pub device_name: String,
    /// Fixo em "NBP1"
    pub protocol_version: String,
    /// Intervalo mínimo entre UPDATE/ALL em ms (0 = sem limite)
    pub max_update_interval_ms: u64,
    /// Prazo para drenar a fila ao encerrar (ms)
    pub shutdown_deadline_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            device_name: DeviceMetadata::default().name,
            protocol_version: PROTOCOL_VERSION.into(),
            max_update_interval_ms: 1000,
            shutdown_deadline_ms: 2000,
        }
    }
}

/// Tipo de transporte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bluetooth RFCOMM (`/dev/rfcomm0`)
    #[default]
    Serial,
    /// Variante Wi-Fi (servidor TCP)
    Tcp,
}

/// Configuração do transporte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Dispositivo serial (kind = "serial")
    pub device: String,
    pub baud_rate: u32,
    /// Endereço de escuta (kind = "tcp")
    pub bind: String,
    /// Timeout de cada escrita, serial ou TCP (ms)
    pub write_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            device: DEFAULT_SERIAL_DEVICE.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            bind: DEFAULT_TCP_BIND.into(),
            write_timeout_ms: 1000,
        }
    }
}

/// Configuração da fila de entrada.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacidade da fila normal (0 = sem limite)
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Política de novas tentativas de escrita.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broadcaster: BroadcasterConfig,
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML. Arquivo ausente = padrão.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("{} não encontrado, usando configuração padrão", path.display());
            return Ok(AppConfig::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str::<AppConfig>(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração carregada de {}", path.display());
        Ok(config)
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração, reunindo todos os problemas encontrados.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let b = &self.broadcaster;

        if let Err(e) = validate_device_name(&b.device_name) {
            errors.push(format!("device_name: {e}"));
        }
        if b.protocol_version != PROTOCOL_VERSION {
            errors.push(format!(
                "protocol_version deve ser {PROTOCOL_VERSION}, recebido {:?}",
                b.protocol_version
            ));
        }
        if b.max_update_interval_ms > MAX_UPDATE_INTERVAL_MS {
            errors.push(format!(
                "max_update_interval_ms inválido: {} (0–{MAX_UPDATE_INTERVAL_MS})",
                b.max_update_interval_ms
            ));
        }

        match self.transport.kind {
            TransportKind::Serial => {
                if self.transport.device.trim().is_empty() {
                    errors.push("transport.device vazio para transporte serial".into());
                }
                if self.transport.baud_rate == 0 {
                    errors.push("transport.baud_rate não pode ser 0".into());
                }
            }
            TransportKind::Tcp if self.transport.bind.parse::<SocketAddr>().is_err() => {
                errors.push(format!(
                    "transport.bind inválido: {:?}",
                    self.transport.bind
                ));
            }
            _ => {}
        }
        if self.transport.write_timeout_ms == 0 {
            errors.push("transport.write_timeout_ms não pode ser 0".into());
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            errors.push(format!(
                "retry.initial_backoff_ms ({}) maior que retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Parâmetros do dispatcher derivados da configuração.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_update_interval: Duration::from_millis(self.broadcaster.max_update_interval_ms),
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            shutdown_deadline: Duration::from_millis(self.broadcaster.shutdown_deadline_ms),
        }
    }

    /// Identidade anunciada no METADATA.
    pub fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            name: self.broadcaster.device_name.clone(),
            protocol_version: self.broadcaster.protocol_version.clone(),
        }
    }

    /// Capacidade da fila (`None` = sem limite).
    pub fn queue_capacity(&self) -> Option<usize> {
        (self.queue.capacity > 0).then_some(self.queue.capacity)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.write_timeout_ms)
    }
}
