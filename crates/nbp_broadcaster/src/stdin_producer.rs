//! Produtor que lê KPIs da entrada padrão, uma mensagem por linha.
//!
//! ```text
//! RPM,RPM,3200;Speed,km/h,60     → UPDATE com dois KPIs
//! Gear,,3                        → KPI sem unidade
//! !ALL RPM,RPM,3200              → ALL (snapshot completo)
//! !NAME Pit Wall                 → METADATA com novo nome
//! ```
//!
//! Linhas vazias e comentários (`#`) são ignorados; só o fim da entrada
//! encerra o dispatcher.

use nbp_core::dispatcher::ShutdownHandle;
use nbp_core::queue::QueueProducer;
use nbp_core::{DeviceMetadata, Kpi, NbpMessage, QueueError};
use std::io::BufRead;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Erro de interpretação de uma linha.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LineError(pub String);

/// Interpreta uma linha. `Ok(None)` para linhas vazias ou comentários.
pub fn parse_line(line: &str) -> Result<Option<NbpMessage>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if let Some(name) = line.strip_prefix("!NAME") {
        let name = name.trim();
        if name.is_empty() {
            return Err(LineError("!NAME sem nome".into()));
        }
        return Ok(Some(NbpMessage::Metadata(DeviceMetadata::new(name))));
    }

    if let Some(rest) = line.strip_prefix("!ALL") {
        return parse_kpis(rest.trim()).map(|kpis| Some(NbpMessage::All(kpis)));
    }

    parse_kpis(line).map(|kpis| Some(NbpMessage::Update(kpis)))
}

fn parse_kpis(text: &str) -> Result<Vec<Kpi>, LineError> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_kpi)
        .collect()
}

fn parse_kpi(field: &str) -> Result<Kpi, LineError> {
    let parts: Vec<&str> = field.split(',').map(str::trim).collect();
    let [name, unit, value] = parts.as_slice() else {
        return Err(LineError(format!("esperado nome,unidade,valor em {field:?}")));
    };
    let value = value
        .parse::<f64>()
        .map_err(|_| LineError(format!("valor inválido em {field:?}")))?;
    Ok(Kpi::new(*name, *unit, value))
}

/// Inicia a thread leitora da entrada padrão.
pub fn spawn_stdin_producer(
    producer: QueueProducer,
    shutdown: ShutdownHandle,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stdin-producer".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            read_loop(stdin.lock(), &producer);
            info!("Fim da entrada, encerrando");
            shutdown.shutdown();
        })
}

fn read_loop(input: impl BufRead, producer: &QueueProducer) {
    for (n, line) in input.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Erro ao ler entrada: {e}");
                break;
            }
        };

        let message = match parse_line(&line) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!("Linha {} ignorada: {e}", n + 1);
                continue;
            }
        };

        debug!("Enfileirando {}", message.packet_type());
        match producer.enqueue(message) {
            Ok(()) => {}
            Err(QueueError::Full) => warn!("Fila cheia, linha {} descartada", n + 1),
            Err(QueueError::Closed) => {
                warn!("Dispatcher encerrado, parando leitura");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbp_core::OverflowPolicy;

    #[test]
    fn parses_update_with_several_kpis() {
        let msg = parse_line("RPM,RPM,3200; Speed,km/h,60").unwrap().unwrap();
        assert_eq!(
            msg,
            NbpMessage::Update(vec![
                Kpi::new("RPM", "RPM", 3200.0),
                Kpi::new("Speed", "km/h", 60.0),
            ])
        );
    }

    #[test]
    fn empty_unit_means_unitless() {
        let msg = parse_line("Gear,,3").unwrap().unwrap();
        assert_eq!(msg, NbpMessage::Update(vec![Kpi::unitless("Gear", 3.0)]));
    }

    #[test]
    fn parses_all_and_name() {
        assert_eq!(
            parse_line("!ALL RPM,RPM,1").unwrap().unwrap(),
            NbpMessage::All(vec![Kpi::new("RPM", "RPM", 1.0)])
        );
        assert_eq!(
            parse_line("!NAME Pit Wall").unwrap().unwrap(),
            NbpMessage::Metadata(DeviceMetadata::new("Pit Wall"))
        );
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("# volta 3"), Ok(None));
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_line("RPM,3200").is_err());
        assert!(parse_line("RPM,RPM,fast").is_err());
        assert!(parse_line("!NAME").is_err());
    }

    #[test]
    fn blank_lines_keep_reading_until_eof() {
        let (producer, consumer) = nbp_core::queue::channel(None, OverflowPolicy::DropOldest);
        read_loop("\n\nRPM,RPM,1\n\n   \nRPM,RPM,2\n".as_bytes(), &producer);

        let mut seen = Vec::new();
        while let Some(envelope) = consumer.try_recv() {
            seen.push(envelope.message);
        }
        assert_eq!(
            seen,
            vec![
                NbpMessage::Update(vec![Kpi::new("RPM", "RPM", 1.0)]),
                NbpMessage::Update(vec![Kpi::new("RPM", "RPM", 2.0)]),
            ]
        );
    }

    #[test]
    fn read_loop_enqueues_valid_lines() {
        let (producer, consumer) = nbp_core::queue::channel(None, OverflowPolicy::DropOldest);
        let input = "RPM,RPM,1\nlixo\n\n!ALL Speed,km/h,2\n";
        read_loop(input.as_bytes(), &producer);

        let first = consumer.try_recv().unwrap();
        assert!(matches!(first.message, NbpMessage::Update(_)));
        let second = consumer.try_recv().unwrap();
        assert!(matches!(second.message, NbpMessage::All(_)));
        assert!(consumer.try_recv().is_none());
    }
}
