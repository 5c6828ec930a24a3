//! Transportes de saída dos pacotes NBP.
//!
//! - [`SerialTransport`] – porta serial via `serialport`; `open_serial` abre
//!   o dispositivo RFCOMM do Bluetooth (`/dev/rfcomm0`) com timeout de escrita
//! - [`TcpTransport`] – variante Wi-Fi: escuta em TCP, aceita o host e
//!   atende pedidos `!ALL`
//!
//! O dispatcher é o único chamador; nenhuma implementação precisa ser
//! segura para escritas concorrentes.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dispositivo serial padrão do Bluetooth.
pub const DEFAULT_SERIAL_DEVICE: &str = "/dev/rfcomm0";

/// Baud rate padrão (ignorado pelo RFCOMM, exigido pela API serial).
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Endereço padrão da variante TCP.
pub const DEFAULT_TCP_BIND: &str = "127.0.0.1:35000";

/// Intervalo de polling de conexões e bytes vindos do host.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pedido recebido do host pelo canal de volta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    /// Host pediu snapshot completo (`!ALL`)
    All,
    /// Novo host conectado
    Connected,
}

/// Canal de saída de bytes já aberto.
pub trait Transport: Send {
    /// Escreve parte de `buf` e devolve quantos bytes o canal aceitou.
    ///
    /// Timeout de escrita chega como `io::Error`. Bytes aceitos antes do
    /// erro já estão no fio: quem chama retoma do ponto em que parou.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Chamado quando o pacote inteiro foi aceito.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Libera o canal. Escritas posteriores falham.
    fn close(&mut self) -> io::Result<()>;

    /// Pedidos pendentes do host (não bloqueia).
    fn poll_requests(&mut self) -> Vec<ClientRequest> {
        Vec::new()
    }

    /// Com que frequência o dispatcher deve chamar [`Transport::poll_requests`].
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Descrição curta para logs.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn poll_requests(&mut self) -> Vec<ClientRequest> {
        (**self).poll_requests()
    }

    fn poll_interval(&self) -> Option<Duration> {
        (**self).poll_interval()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transporte fechado")
}

/// Bytes vindos do host, acumulados até formar linhas.
#[derive(Debug, Default)]
struct InboundLines {
    pending: Vec<u8>,
}

impl InboundLines {
    fn feed(&mut self, bytes: &[u8], requests: &mut Vec<ClientRequest>) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text == "!ALL" {
                info!("Host solicitou pacote ALL");
                requests.push(ClientRequest::All);
            } else if !text.is_empty() {
                info!("Host: {text}");
            }
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

// ──────────────────────────────────────────────
// Serial (Bluetooth RFCOMM)
// ──────────────────────────────────────────────

/// Transporte sobre uma porta serial aberta.
///
/// O timeout configurado na porta vale para cada escrita: porta parada
/// vira `TimedOut` em vez de bloquear o dispatcher.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    label: String,
    inbound: InboundLines,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let label = match port.name() {
            Some(name) => format!("serial {name}"),
            None => "serial".to_string(),
        };
        Self {
            port: Some(port),
            label,
            inbound: InboundLines::default(),
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("label", &self.label)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let port = self.port.as_mut().ok_or_else(closed_error)?;
        Write::write(port, buf)
    }

    // Sem flush: `tcdrain` não respeita o timeout da porta

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            info!("Porta serial fechada: {}", self.label);
        }
        Ok(())
    }

    /// O host pode mandar texto pela serial; é logado e `!ALL` é atendido.
    fn poll_requests(&mut self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        let Some(port) = self.port.as_mut() else {
            return requests;
        };
        let waiting = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                debug!("Falha ao consultar bytes recebidos: {e}");
                return requests;
            }
        };
        if waiting == 0 {
            return requests;
        }

        let mut buf = vec![0u8; waiting];
        match port.read(&mut buf) {
            Ok(n) => self.inbound.feed(&buf[..n], &mut requests),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => warn!("Erro ao ler da porta serial: {e}"),
        }
        requests
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(POLL_INTERVAL)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Abre o dispositivo serial (ex: `/dev/rfcomm0`).
///
/// O pareamento e o bind do RFCOMM ficam por conta do sistema.
pub fn open_serial(
    device: &str,
    baud_rate: u32,
    write_timeout: Duration,
) -> Result<SerialTransport, serialport::Error> {
    let port = serialport::new(device, baud_rate)
        .timeout(write_timeout)
        .open()?;
    info!("Porta serial aberta: {device} ({baud_rate} baud, timeout {write_timeout:?})");
    Ok(SerialTransport::new(port))
}

// ──────────────────────────────────────────────
// TCP (Wi-Fi)
// ──────────────────────────────────────────────

/// Servidor TCP de um único host (variante Wi-Fi do NBP).
///
/// Antes do primeiro host os pacotes são descartados: o host recebe um ALL
/// ao conectar. Depois que um host cai, escritas falham com `NotConnected`
/// até outro ser aceito.
#[derive(Debug)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
    client: Option<(TcpStream, SocketAddr)>,
    /// Host anterior caiu e nenhum outro conectou ainda
    lost: bool,
    write_timeout: Duration,
    inbound: InboundLines,
}

impl TcpTransport {
    pub fn bind(addr: impl ToSocketAddrs, write_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Escutando NBP em {}", listener.local_addr()?);
        Ok(Self {
            listener: Some(listener),
            client: None,
            lost: false,
            write_timeout,
            inbound: InboundLines::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(closed_error)?
            .local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn accept(&mut self) -> io::Result<bool> {
        let Some(listener) = &self.listener else {
            return Ok(false);
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_write_timeout(Some(self.write_timeout))?;
                stream.set_nodelay(true)?;
                info!("Host conectado: {addr}");
                self.client = Some((stream, addr));
                self.lost = false;
                self.inbound.clear();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn drop_client(&mut self, reason: &str) {
        if let Some((_, addr)) = self.client.take() {
            warn!("Host {addr} desconectado: {reason}");
            self.lost = true;
        }
    }

    /// Lê o que houver do host sem bloquear e extrai os pedidos.
    fn read_requests(&mut self, requests: &mut Vec<ClientRequest>) {
        let Some((stream, _)) = self.client.as_mut() else {
            return;
        };
        if let Err(e) = stream.set_nonblocking(true) {
            self.drop_client(&e.to_string());
            return;
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        let outcome = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Err("conexão encerrada".to_string()),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e.to_string()),
            }
        };
        let outcome =
            outcome.and_then(|()| stream.set_nonblocking(false).map_err(|e| e.to_string()));

        self.inbound.feed(&received, requests);
        if let Err(reason) = outcome {
            self.drop_client(&reason);
        }
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.listener.is_none() {
            return Err(closed_error());
        }
        let Some((stream, _)) = self.client.as_mut() else {
            if self.lost {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "host desconectado",
                ));
            }
            debug!("Nenhum host conectado ainda, pacote descartado");
            return Ok(buf.len());
        };
        match stream.write(buf) {
            Ok(n) => Ok(n),
            // Timeout mantém a conexão: a nova tentativa continua o pacote
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                self.drop_client(&e.to_string());
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.client.as_mut() {
            Some((stream, _)) => stream.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some((stream, addr)) = self.client.take() {
            info!("Encerrando conexão com {addr}");
            // Host pode já ter fechado
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.listener = None;
        Ok(())
    }

    fn poll_requests(&mut self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        if self.client.is_none() {
            match self.accept() {
                Ok(true) => requests.push(ClientRequest::Connected),
                Ok(false) => {}
                Err(e) => warn!("Falha ao aceitar conexão: {e}"),
            }
        }
        self.read_requests(&mut requests);
        requests
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(POLL_INTERVAL)
    }

    fn describe(&self) -> String {
        match self.local_addr() {
            Ok(addr) => format!("tcp {addr}"),
            Err(_) => "tcp (fechado)".to_string(),
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn poll_until(
        transport: &mut impl Transport,
        wanted: ClientRequest,
    ) -> Vec<ClientRequest> {
        let start = Instant::now();
        let mut seen = Vec::new();
        while start.elapsed() < Duration::from_secs(2) {
            seen.extend(transport.poll_requests());
            if seen.contains(&wanted) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        seen
    }

    fn write_all(transport: &mut impl Transport, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = transport.write(buf)?;
            buf = &buf[n..];
        }
        transport.flush()
    }

    #[test]
    fn inbound_lines_split_requests() {
        let mut lines = InboundLines::default();
        let mut requests = Vec::new();
        lines.feed(b"hello\r\n!A", &mut requests);
        assert!(requests.is_empty());
        lines.feed(b"LL\r\n", &mut requests);
        assert_eq!(requests, vec![ClientRequest::All]);
    }

    #[test]
    fn open_serial_fails_for_missing_device() {
        let result = open_serial("/nonexistent/rfcomm99", DEFAULT_BAUD_RATE, Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn serial_writes_packets_and_reads_host_requests() {
        let (master, mut host) = serialport::TTYPort::pair().unwrap();
        host.set_timeout(Duration::from_secs(2)).unwrap();
        let mut transport = SerialTransport::new(Box::new(master));

        write_all(&mut transport, b"@NAME:Dash\n\n").unwrap();
        let mut buf = [0u8; 12];
        host.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"@NAME:Dash\n\n");

        host.write_all(b"!ALL\n").unwrap();
        let seen = poll_until(&mut transport, ClientRequest::All);
        assert!(seen.contains(&ClientRequest::All));

        transport.close().unwrap();
        let err = transport.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn tcp_drops_packets_before_first_host() {
        let mut transport = TcpTransport::bind("127.0.0.1:0", Duration::from_secs(1)).unwrap();
        assert!(!transport.is_connected());
        let packet = b"*NBP1,ALL,0.000000\n#\n\n";
        assert_eq!(transport.write(packet).unwrap(), packet.len());
    }

    #[test]
    fn tcp_delivers_packets_and_all_requests() {
        let mut transport = TcpTransport::bind("127.0.0.1:0", Duration::from_secs(1)).unwrap();
        let addr = transport.local_addr().unwrap();

        let mut host = TcpStream::connect(addr).unwrap();
        host.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let seen = poll_until(&mut transport, ClientRequest::Connected);
        assert!(seen.contains(&ClientRequest::Connected));

        write_all(&mut transport, b"@NAME:Dash\n\n").unwrap();
        let mut buf = [0u8; 12];
        host.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"@NAME:Dash\n\n");

        host.write_all(b"!ALL\n").unwrap();
        let seen = poll_until(&mut transport, ClientRequest::All);
        assert!(seen.contains(&ClientRequest::All));
    }

    #[test]
    fn tcp_lost_host_fails_writes_until_next_host() {
        let mut transport = TcpTransport::bind("127.0.0.1:0", Duration::from_secs(1)).unwrap();
        let addr = transport.local_addr().unwrap();

        let host = TcpStream::connect(addr).unwrap();
        poll_until(&mut transport, ClientRequest::Connected);
        assert!(transport.is_connected());
        drop(host);

        let start = Instant::now();
        while transport.is_connected() && start.elapsed() < Duration::from_secs(2) {
            transport.poll_requests();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!transport.is_connected());
        let err = transport.write(b"*NBP1,ALL,0.000000\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let _again = TcpStream::connect(addr).unwrap();
        let seen = poll_until(&mut transport, ClientRequest::Connected);
        assert!(seen.contains(&ClientRequest::Connected));
        write_all(&mut transport, b"@NAME:Dash\n\n").unwrap();
    }

    #[test]
    fn tcp_close_refuses_further_writes() {
        let mut transport = TcpTransport::bind("127.0.0.1:0", Duration::from_secs(1)).unwrap();
        transport.close().unwrap();
        assert!(transport.write(b"x").is_err());
        assert_eq!(transport.describe(), "tcp (fechado)");
    }
}
