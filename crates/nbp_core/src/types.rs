//! Tipos do domínio NBP: KPIs, tipos de pacote e mensagens da fila.
//!
//! Um [`Kpi`] é um canal de telemetria (RPM, velocidade, temperatura…).
//! Produtores empacotam KPIs em [`NbpMessage`] e enviam pela fila; o
//! dispatcher é o único consumidor.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Versão do protocolo suportada.
pub const PROTOCOL_VERSION: &str = "NBP1";

/// Tamanho máximo do nome do dispositivo anunciado no METADATA.
pub const MAX_DEVICE_NAME_LEN: usize = 32;

// ──────────────────────────────────────────────
// KPI
// ──────────────────────────────────────────────

/// Um indicador numérico (canal de telemetria) com unidade opcional.
///
/// Imutável depois de construído. A unidade é guardada como texto livre e
/// validada pelo encoder contra a tabela [`KpiUnit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Kpi {
    name: String,
    unit: Option<String>,
    value: f64,
}

impl Kpi {
    /// KPI com unidade (ex: `Kpi::new("Speed", "km/h", 60.0)`).
    pub fn new(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        let unit = unit.into();
        Self {
            name: name.into(),
            unit: if unit.is_empty() { None } else { Some(unit) },
            value,
        }
    }

    /// KPI adimensional.
    pub fn unitless(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: None,
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ──────────────────────────────────────────────
// Unidades
// ──────────────────────────────────────────────

/// Unidades reconhecidas pelo NBP1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KpiUnit {
    Volt,
    Ampere,
    Watt,
    Kilowatt,
    Horsepower,
    Rpm,
    KilometersPerHour,
    MilesPerHour,
    MetersPerSecond,
    Percent,
    Celsius,
    Fahrenheit,
    Kelvin,
    Kilopascal,
    Psi,
    Bar,
    GForce,
    Degrees,
    DegreesPerSecond,
    Seconds,
    Milliseconds,
    Hertz,
    Meters,
    Kilometers,
    Feet,
    Miles,
    Liters,
    Gallons,
    LitersPerHour,
    Lambda,
    Afr,
    NewtonMeters,
    PoundFeet,
}

impl KpiUnit {
    pub const ALL: [KpiUnit; 33] = [
        KpiUnit::Volt,
        KpiUnit::Ampere,
        KpiUnit::Watt,
        KpiUnit::Kilowatt,
        KpiUnit::Horsepower,
        KpiUnit::Rpm,
        KpiUnit::KilometersPerHour,
        KpiUnit::MilesPerHour,
        KpiUnit::MetersPerSecond,
        KpiUnit::Percent,
        KpiUnit::Celsius,
        KpiUnit::Fahrenheit,
        KpiUnit::Kelvin,
        KpiUnit::Kilopascal,
        KpiUnit::Psi,
        KpiUnit::Bar,
        KpiUnit::GForce,
        KpiUnit::Degrees,
        KpiUnit::DegreesPerSecond,
        KpiUnit::Seconds,
        KpiUnit::Milliseconds,
        KpiUnit::Hertz,
        KpiUnit::Meters,
        KpiUnit::Kilometers,
        KpiUnit::Feet,
        KpiUnit::Miles,
        KpiUnit::Liters,
        KpiUnit::Gallons,
        KpiUnit::LitersPerHour,
        KpiUnit::Lambda,
        KpiUnit::Afr,
        KpiUnit::NewtonMeters,
        KpiUnit::PoundFeet,
    ];

    /// Texto da unidade como aparece no fio.
    pub fn as_str(self) -> &'static str {
        match self {
            KpiUnit::Volt => "V",
            KpiUnit::Ampere => "A",
            KpiUnit::Watt => "W",
            KpiUnit::Kilowatt => "kW",
            KpiUnit::Horsepower => "hp",
            KpiUnit::Rpm => "RPM",
            KpiUnit::KilometersPerHour => "km/h",
            KpiUnit::MilesPerHour => "mph",
            KpiUnit::MetersPerSecond => "m/s",
            KpiUnit::Percent => "%",
            KpiUnit::Celsius => "C",
            KpiUnit::Fahrenheit => "F",
            KpiUnit::Kelvin => "K",
            KpiUnit::Kilopascal => "kPa",
            KpiUnit::Psi => "psi",
            KpiUnit::Bar => "bar",
            KpiUnit::GForce => "g",
            KpiUnit::Degrees => "deg",
            KpiUnit::DegreesPerSecond => "deg/s",
            KpiUnit::Seconds => "s",
            KpiUnit::Milliseconds => "ms",
            KpiUnit::Hertz => "Hz",
            KpiUnit::Meters => "m",
            KpiUnit::Kilometers => "km",
            KpiUnit::Feet => "ft",
            KpiUnit::Miles => "mi",
            KpiUnit::Liters => "L",
            KpiUnit::Gallons => "gal",
            KpiUnit::LitersPerHour => "L/h",
            KpiUnit::Lambda => "lambda",
            KpiUnit::Afr => "AFR",
            KpiUnit::NewtonMeters => "Nm",
            KpiUnit::PoundFeet => "lbft",
        }
    }
}

impl fmt::Display for KpiUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unidade fora da tabela NBP1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unidade desconhecida: {0:?}")]
pub struct UnknownUnit(pub String);

impl FromStr for KpiUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KpiUnit::ALL
            .iter()
            .copied()
            .find(|u| u.as_str() == s)
            .ok_or_else(|| UnknownUnit(s.to_string()))
    }
}

// ──────────────────────────────────────────────
// Tipo de pacote
// ──────────────────────────────────────────────

/// Tipo de pacote NBP. Conjunto fechado, sem strings livres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Somente os valores alterados desde a última emissão
    Update,
    /// Snapshot completo de todos os KPIs conhecidos
    All,
    /// Anúncio de identidade do dispositivo
    Metadata,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Update => "UPDATE",
            PacketType::All => "ALL",
            PacketType::Metadata => "METADATA",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tipo de pacote inválido.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Tipo de pacote não reconhecido: {0:?}")]
pub struct UnknownPacketType(pub String);

impl FromStr for PacketType {
    type Err = UnknownPacketType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPDATE" => Ok(PacketType::Update),
            "ALL" => Ok(PacketType::All),
            "METADATA" => Ok(PacketType::Metadata),
            other => Err(UnknownPacketType(other.to_string())),
        }
    }
}

// ──────────────────────────────────────────────
// Metadata
// ──────────────────────────────────────────────

/// Identidade do dispositivo enviada em pacotes METADATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub name: String,
    pub protocol_version: String,
}

impl DeviceMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self::new("RustNBP")
    }
}

// ──────────────────────────────────────────────
// Mensagens da fila
// ──────────────────────────────────────────────

/// Unidade de trabalho submetida pelos produtores.
///
/// METADATA nunca carrega KPIs: a combinação inválida não é representável.
#[derive(Debug, Clone, PartialEq)]
pub enum NbpMessage {
    Update(Vec<Kpi>),
    All(Vec<Kpi>),
    Metadata(DeviceMetadata),
}

impl NbpMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            NbpMessage::Update(_) => PacketType::Update,
            NbpMessage::All(_) => PacketType::All,
            NbpMessage::Metadata(_) => PacketType::Metadata,
        }
    }
}

/// Mensagem + timestamp do produtor (segundos desde a época Unix).
///
/// O timestamp vira o campo de tempo do cabeçalho `*NBP1,...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: NbpMessage,
    pub timestamp: f64,
}

impl Envelope {
    pub fn new(message: NbpMessage, timestamp: f64) -> Self {
        Self { message, timestamp }
    }

    /// Carimba a mensagem com o relógio de parede atual.
    pub fn now(message: NbpMessage) -> Self {
        Self::new(message, unix_timestamp())
    }
}

/// Segundos desde a época Unix (0.0 se o relógio estiver antes de 1970).
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ──────────────────────────────────────────────
// Estado do dispatcher
// ──────────────────────────────────────────────

/// Ciclo de vida do dispatcher: `Idle → Running → {Disconnected | Stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    /// Terminal: transporte falhou além do limite de tentativas
    Disconnected,
    /// Terminal: shutdown explícito
    Stopped,
}

impl DispatcherState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatcherState::Disconnected | DispatcherState::Stopped)
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Running => "running",
            DispatcherState::Disconnected => "disconnected",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
