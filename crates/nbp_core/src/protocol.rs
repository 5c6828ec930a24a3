//! Codificação NBP1 (Numeric Broadcast Protocol v1).
//!
//! Protocolo texto, um pacote por transmissão:
//!
//! ```text
//! *NBP1,UPDATE,1700000000.250000      ← cabeçalho: versão, tipo, timestamp
//! "RPM","RPM":3200                    ← KPI com unidade
//! "Gear":3                            ← KPI sem unidade
//! #                                   ← fim do pacote
//!                                     ← linha em branco
//! ```
//!
//! Pacotes METADATA são apenas `@NAME:<dispositivo>\n\n`.
//!
//! O encoder é puro e determinístico; o decoder de referência existe para
//! validar capturas e os testes de ida e volta.

use crate::types::{
    DeviceMetadata, Kpi, KpiUnit, MAX_DEVICE_NAME_LEN, NbpMessage, PROTOCOL_VERSION, PacketType,
};

/// Início de um pacote de KPIs.
const PACKET_START: char = '*';

/// Fim de um pacote de KPIs.
const PACKET_TERMINATOR: &str = "#\n\n";

/// Prefixo do pacote METADATA.
const METADATA_PREFIX: &str = "@NAME:";

/// Maior magnitude representável sem perda de precisão inteira (2^53).
pub const MAX_ABS_VALUE: f64 = 9_007_199_254_740_992.0;

/// Erros de codificação. Recuperáveis: o item é descartado.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodingError {
    #[error("Pacote {0} sem KPIs")]
    EmptyKpiList(PacketType),

    #[error("KPI {kpi:?}: unidade desconhecida {unit:?}")]
    UnknownUnit { kpi: String, unit: String },

    #[error("KPI {kpi:?}: valor fora da faixa representável ({value})")]
    ValueOutOfRange { kpi: String, value: f64 },

    #[error("Nome inválido: {0:?}")]
    InvalidName(String),

    #[error("KPI duplicado no mesmo pacote: {0:?}")]
    DuplicateKpi(String),

    #[error("Timestamp inválido: {0}")]
    InvalidTimestamp(f64),

    #[error("Pacote METADATA não carrega KPIs")]
    MetadataNotKpis,

    #[error("Nome do dispositivo com {0} caracteres (máximo {MAX_DEVICE_NAME_LEN})")]
    DeviceNameTooLong(usize),

    #[error("Versão de protocolo não suportada: {0:?} (suportada: {PROTOCOL_VERSION})")]
    UnsupportedVersion(String),
}

/// Erros do decoder de referência.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Pacote não é UTF-8")]
    NotUtf8,

    #[error("Início de pacote desconhecido")]
    UnknownStart,

    #[error("Terminador ausente")]
    MissingTerminator,

    #[error("Cabeçalho malformado: {0:?}")]
    MalformedHeader(String),

    #[error("Versão incompatível: {0:?} (suportada: {PROTOCOL_VERSION})")]
    VersionMismatch(String),

    #[error("Tipo de pacote inválido no cabeçalho: {0:?}")]
    InvalidPacketType(String),

    #[error("Linha de KPI malformada: {0:?}")]
    MalformedKpi(String),

    #[error("Pacote {0} sem KPIs")]
    EmptyKpiList(PacketType),
}

/// Pacote decodificado.
#[derive(Debug, Clone, PartialEq)]
pub enum NbpPacket {
    Kpis {
        packet_type: PacketType,
        timestamp: f64,
        kpis: Vec<Kpi>,
    },
    Metadata {
        name: String,
    },
}

// ──────────────────────────────────────────────
// Encoder
// ──────────────────────────────────────────────

/// Codifica um pacote UPDATE ou ALL.
///
/// Falha com lista vazia, unidade fora da tabela NBP1, valor não finito ou
/// acima de [`MAX_ABS_VALUE`], nome inválido ou KPI repetido.
pub fn encode_kpis(
    packet_type: PacketType,
    kpis: &[Kpi],
    timestamp: f64,
) -> Result<Vec<u8>, EncodingError> {
    validate_kpis(packet_type, kpis)?;
    if !timestamp.is_finite() || timestamp < 0.0 {
        return Err(EncodingError::InvalidTimestamp(timestamp));
    }

    let mut packet = format!("{PACKET_START}{PROTOCOL_VERSION},{packet_type},{timestamp:.6}\n");

    for kpi in kpis {
        match kpi.unit() {
            Some(unit) => packet.push_str(&format!("\"{}\",\"{}\":{}\n", kpi.name(), unit, kpi.value())),
            None => packet.push_str(&format!("\"{}\":{}\n", kpi.name(), kpi.value())),
        }
    }

    packet.push_str(PACKET_TERMINATOR);
    Ok(packet.into_bytes())
}

/// Codifica o anúncio de identidade do dispositivo.
pub fn encode_metadata(meta: &DeviceMetadata) -> Result<Vec<u8>, EncodingError> {
    if meta.protocol_version != PROTOCOL_VERSION {
        return Err(EncodingError::UnsupportedVersion(meta.protocol_version.clone()));
    }
    validate_device_name(&meta.name)?;
    Ok(format!("{METADATA_PREFIX}{}\n\n", meta.name).into_bytes())
}

/// Codifica qualquer mensagem da fila.
pub fn encode_message(message: &NbpMessage, timestamp: f64) -> Result<Vec<u8>, EncodingError> {
    match message {
        NbpMessage::Update(kpis) => encode_kpis(PacketType::Update, kpis, timestamp),
        NbpMessage::All(kpis) => encode_kpis(PacketType::All, kpis, timestamp),
        NbpMessage::Metadata(meta) => encode_metadata(meta),
    }
}

/// Valida uma lista de KPIs para um pacote UPDATE/ALL sem codificá-la.
pub fn validate_kpis(packet_type: PacketType, kpis: &[Kpi]) -> Result<(), EncodingError> {
    if packet_type == PacketType::Metadata {
        return Err(EncodingError::MetadataNotKpis);
    }
    if kpis.is_empty() {
        return Err(EncodingError::EmptyKpiList(packet_type));
    }
    for (i, kpi) in kpis.iter().enumerate() {
        validate_kpi(kpi)?;
        if kpis[..i].iter().any(|k| k.name() == kpi.name()) {
            return Err(EncodingError::DuplicateKpi(kpi.name().to_string()));
        }
    }
    Ok(())
}

/// Valida nome, unidade e faixa de um KPI sem codificá-lo.
pub fn validate_kpi(kpi: &Kpi) -> Result<(), EncodingError> {
    if !is_valid_field(kpi.name()) {
        return Err(EncodingError::InvalidName(kpi.name().to_string()));
    }
    if let Some(unit) = kpi.unit() {
        if unit.parse::<KpiUnit>().is_err() {
            return Err(EncodingError::UnknownUnit {
                kpi: kpi.name().to_string(),
                unit: unit.to_string(),
            });
        }
    }
    let value = kpi.value();
    if !value.is_finite() || value.abs() > MAX_ABS_VALUE {
        return Err(EncodingError::ValueOutOfRange {
            kpi: kpi.name().to_string(),
            value,
        });
    }
    Ok(())
}

/// Valida o nome anunciado no METADATA.
pub fn validate_device_name(name: &str) -> Result<(), EncodingError> {
    let len = name.chars().count();
    if len > MAX_DEVICE_NAME_LEN {
        return Err(EncodingError::DeviceNameTooLong(len));
    }
    if !is_valid_field(name) {
        return Err(EncodingError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Campos não podem ser vazios, conter aspas nem quebrar linha.
fn is_valid_field(s: &str) -> bool {
    !s.is_empty() && !s.contains(['"', '\n', '\r'])
}

// ──────────────────────────────────────────────
// Decoder de referência
// ──────────────────────────────────────────────

/// Decodifica um pacote NBP1 completo.
pub fn decode_packet(data: &[u8]) -> Result<NbpPacket, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::NotUtf8)?;

    if let Some(rest) = text.strip_prefix(METADATA_PREFIX) {
        let name = rest.strip_suffix("\n\n").ok_or(DecodeError::MissingTerminator)?;
        return Ok(NbpPacket::Metadata {
            name: name.to_string(),
        });
    }

    let body = text
        .strip_prefix(PACKET_START)
        .ok_or(DecodeError::UnknownStart)?
        .strip_suffix(PACKET_TERMINATOR)
        .ok_or(DecodeError::MissingTerminator)?;

    let mut lines = body.lines();
    let header = lines.next().unwrap_or_default();
    let (packet_type, timestamp) = parse_header(header)?;

    let kpis = lines.map(parse_kpi_line).collect::<Result<Vec<_>, _>>()?;
    if kpis.is_empty() {
        return Err(DecodeError::EmptyKpiList(packet_type));
    }

    Ok(NbpPacket::Kpis {
        packet_type,
        timestamp,
        kpis,
    })
}

fn parse_header(header: &str) -> Result<(PacketType, f64), DecodeError> {
    let malformed = || DecodeError::MalformedHeader(header.to_string());

    let mut fields = header.split(',');
    let (Some(version), Some(ptype), Some(ts), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed());
    };

    if version != PROTOCOL_VERSION {
        return Err(DecodeError::VersionMismatch(version.to_string()));
    }
    let packet_type = match ptype.parse::<PacketType>() {
        Ok(PacketType::Metadata) | Err(_) => {
            return Err(DecodeError::InvalidPacketType(ptype.to_string()));
        }
        Ok(t) => t,
    };
    let timestamp = ts.parse::<f64>().map_err(|_| malformed())?;

    Ok((packet_type, timestamp))
}

fn parse_kpi_line(line: &str) -> Result<Kpi, DecodeError> {
    let malformed = || DecodeError::MalformedKpi(line.to_string());

    let (name, rest) = line
        .strip_prefix('"')
        .and_then(|r| r.split_once('"'))
        .ok_or_else(malformed)?;

    let (unit, value) = match rest.strip_prefix(",\"") {
        Some(r) => {
            let (unit, r) = r.split_once('"').ok_or_else(malformed)?;
            (Some(unit), r.strip_prefix(':').ok_or_else(malformed)?)
        }
        None => (None, rest.strip_prefix(':').ok_or_else(malformed)?),
    };

    let value = value.parse::<f64>().map_err(|_| malformed())?;
    Ok(match unit {
        Some(unit) => Kpi::new(name, unit, value),
        None => Kpi::unitless(name, value),
    })
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
