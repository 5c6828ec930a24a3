//! Dispatcher com limite de taxa.
//!
//! Consumidor único da fila. Decide quando emitir, funde UPDATEs
//! pendentes e entrega os bytes ao [`Transport`].
//!
//! Regras de emissão:
//! - METADATA sai na hora, sem passar pelo limitador
//! - UPDATE/ALL nunca saem com intervalo menor que `max_update_interval`
//! - Dentro da janela, UPDATEs são fundidos por nome (último valor vence)
//! - ALL pendente descarta o buffer de UPDATE e envia o snapshot completo
//!
//! Ciclo de vida: `Idle → Running → {Disconnected | Stopped}`.

use crate::protocol::{EncodingError, encode_kpis, encode_metadata, validate_kpis};
use crate::queue::{QueueConsumer, Recv};
use crate::transport::{ClientRequest, Transport};
use crate::types::{DeviceMetadata, DispatcherState, Envelope, Kpi, NbpMessage, PacketType};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Parâmetros de execução do dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Intervalo mínimo entre pacotes UPDATE/ALL (zero = sem limite)
    pub max_update_interval: Duration,
    /// Tentativas extras de escrita antes de desistir
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Tempo máximo para drenar a fila no shutdown
    pub shutdown_deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_update_interval: Duration::from_millis(1000),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1000),
            shutdown_deadline: Duration::from_millis(2000),
        }
    }
}

/// Erros do dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Item descartado: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Falha de escrita no transporte: {0}")]
    Io(#[from] io::Error),

    #[error("Transporte desconectado após {attempts} tentativas: {source}")]
    Disconnected {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Recebe todos os erros do dispatcher, recuperáveis ou não.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, error: &DispatchError);
}

/// Observer padrão: apenas loga.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn on_error(&self, error: &DispatchError) {
        match error {
            DispatchError::Disconnected { .. } => error!("{error}"),
            _ => warn!("{error}"),
        }
    }
}

/// Contadores de uma sessão.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub packets_sent: u64,
    pub metadata_sent: u64,
    pub items_dropped: u64,
    pub write_retries: u64,
}

// ──────────────────────────────────────────────
// Coalescer (núcleo puro, sem I/O)
// ──────────────────────────────────────────────

/// Estado de emissão; só o dispatcher o altera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchState {
    /// Instante da última emissão UPDATE/ALL bem-sucedida
    pub last_emission: Option<Instant>,
    pub max_update_interval: Duration,
}

/// Pacote pronto para codificar.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPacket {
    pub packet_type: PacketType,
    pub kpis: Vec<Kpi>,
    pub timestamp: f64,
}

/// Agenda e funde UPDATE/ALL. O tempo é sempre passado de fora.
#[derive(Debug, Clone)]
pub struct Coalescer {
    state: DispatchState,
    /// Último valor de todos os KPIs já vistos, na ordem em que surgiram
    known: KpiTable,
    /// UPDATEs fundidos desde a última emissão
    updates: KpiTable,
    all_pending: bool,
    timestamp: f64,
}

/// KPIs por nome, na ordem de inserção.
#[derive(Debug, Clone, Default)]
struct KpiTable {
    kpis: Vec<Kpi>,
    index: HashMap<String, usize>,
}

impl KpiTable {
    /// Substitui o KPI de mesmo nome ou acrescenta no fim.
    fn upsert(&mut self, kpi: Kpi) {
        match self.index.get(kpi.name()) {
            Some(&i) => self.kpis[i] = kpi,
            None => {
                self.index.insert(kpi.name().to_string(), self.kpis.len());
                self.kpis.push(kpi);
            }
        }
    }

    fn as_slice(&self) -> &[Kpi] {
        &self.kpis
    }

    fn is_empty(&self) -> bool {
        self.kpis.is_empty()
    }

    fn clear(&mut self) {
        self.kpis.clear();
        self.index.clear();
    }

    fn take(&mut self) -> Vec<Kpi> {
        self.index.clear();
        std::mem::take(&mut self.kpis)
    }
}

impl Coalescer {
    pub fn new(max_update_interval: Duration) -> Self {
        Self {
            state: DispatchState {
                last_emission: None,
                max_update_interval,
            },
            known: KpiTable::default(),
            updates: KpiTable::default(),
            all_pending: false,
            timestamp: 0.0,
        }
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Todos os KPIs conhecidos (conteúdo de um ALL).
    pub fn known(&self) -> &[Kpi] {
        self.known.as_slice()
    }

    pub fn offer_update(&mut self, kpis: Vec<Kpi>, timestamp: f64) {
        for kpi in kpis {
            // ALL pendente já leva o valor novo no snapshot
            if !self.all_pending {
                self.updates.upsert(kpi.clone());
            }
            self.known.upsert(kpi);
        }
        self.timestamp = timestamp;
    }

    pub fn offer_all(&mut self, kpis: Vec<Kpi>, timestamp: f64) {
        for kpi in kpis {
            self.known.upsert(kpi);
        }
        self.updates.clear();
        self.all_pending = true;
        self.timestamp = timestamp;
    }

    /// Pedido de snapshot vindo do host. Ignorado sem KPIs conhecidos.
    pub fn request_all(&mut self) {
        if self.known.is_empty() {
            return;
        }
        self.updates.clear();
        self.all_pending = true;
    }

    pub fn has_pending(&self) -> bool {
        self.all_pending || !self.updates.is_empty()
    }

    /// Primeiro instante em que um UPDATE/ALL pode sair (`None` = já).
    pub fn next_emission_at(&self) -> Option<Instant> {
        if self.state.max_update_interval.is_zero() {
            return None;
        }
        self.state
            .last_emission
            .map(|last| last + self.state.max_update_interval)
    }

    /// Quando acordar para emitir o que está pendente.
    pub fn deadline(&self) -> Option<Instant> {
        if self.has_pending() {
            self.next_emission_at()
        } else {
            None
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.has_pending() && self.next_emission_at().is_none_or(|at| now >= at)
    }

    /// Retira o pacote pendente se a janela permitir.
    pub fn take(&mut self, now: Instant) -> Option<PendingPacket> {
        if !self.ready(now) {
            return None;
        }
        let packet = if self.all_pending {
            self.updates.clear();
            PendingPacket {
                packet_type: PacketType::All,
                kpis: self.known.as_slice().to_vec(),
                timestamp: self.timestamp,
            }
        } else {
            PendingPacket {
                packet_type: PacketType::Update,
                kpis: self.updates.take(),
                timestamp: self.timestamp,
            }
        };
        self.all_pending = false;
        Some(packet)
    }

    /// Registra uma emissão bem-sucedida.
    pub fn mark_emitted(&mut self, at: Instant) {
        self.state.last_emission = Some(at);
    }
}

// ──────────────────────────────────────────────
// Handles
// ──────────────────────────────────────────────

#[derive(Debug)]
struct Status {
    state: DispatcherState,
    last_error: Option<String>,
}

/// Visão somente-leitura do estado do dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    status: Arc<Mutex<Status>>,
}

impl DispatcherHandle {
    pub fn state(&self) -> DispatcherState {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }
}

/// Pede o encerramento gracioso do dispatcher.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Buffer cheio = shutdown já pedido
        let _ = self.tx.try_send(());
    }
}

// ──────────────────────────────────────────────
// Dispatcher
// ──────────────────────────────────────────────

/// Loop consumidor da fila. Dono exclusivo do transporte.
pub struct Dispatcher<T: Transport> {
    config: DispatchConfig,
    queue: QueueConsumer,
    transport: T,
    coalescer: Coalescer,
    observer: Arc<dyn ErrorObserver>,
    status: Arc<Mutex<Status>>,
    // Mantém o canal vivo: sem isso `recv(cancel)` dispararia ao soltar os handles
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    last_metadata: Option<DeviceMetadata>,
    summary: DispatchSummary,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(config: DispatchConfig, queue: QueueConsumer, transport: T) -> Self {
        let (cancel_tx, cancel_rx) = bounded(1);
        Self {
            coalescer: Coalescer::new(config.max_update_interval),
            config,
            queue,
            transport,
            observer: Arc::new(TracingObserver),
            status: Arc::new(Mutex::new(Status {
                state: DispatcherState::Idle,
                last_error: None,
            })),
            cancel_tx,
            cancel_rx,
            last_metadata: None,
            summary: DispatchSummary::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            status: Arc::clone(&self.status),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Executa o loop principal até shutdown, fim dos produtores ou
    /// desconexão do transporte.
    pub fn run(mut self) -> Result<DispatchSummary, DispatchError> {
        self.set_state(DispatcherState::Running);
        info!(
            "Dispatcher ativo → {} | intervalo mínimo {:?}",
            self.transport.describe(),
            self.config.max_update_interval
        );

        loop {
            if let Err(e) = self.poll_transport().and_then(|()| self.flush_if_ready()) {
                return Err(self.fail(e));
            }

            match self.queue.recv_until(self.next_wakeup(), &self.cancel_rx) {
                Recv::Item(envelope) => {
                    if let Err(e) = self.handle_envelope(envelope) {
                        return Err(self.fail(e));
                    }
                }
                Recv::Timeout => {}
                Recv::Cancelled => {
                    info!("Shutdown solicitado");
                    break;
                }
                Recv::Disconnected => {
                    info!("Todos os produtores encerraram");
                    break;
                }
            }
        }

        match self.shutdown() {
            Ok(()) => Ok(self.summary),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Roda o dispatcher numa thread dedicada.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<DispatchSummary, DispatchError>>>
    where
        T: 'static,
    {
        std::thread::Builder::new()
            .name("nbp-dispatcher".into())
            .spawn(move || self.run())
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let poll = self
            .transport
            .poll_interval()
            .map(|interval| Instant::now() + interval);
        match (self.coalescer.deadline(), poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), DispatchError> {
        let Envelope { message, timestamp } = envelope;
        match message {
            NbpMessage::Metadata(meta) => self.send_metadata(meta),
            NbpMessage::Update(kpis) => {
                match validate_kpis(PacketType::Update, &kpis) {
                    Ok(()) => self.coalescer.offer_update(kpis, timestamp),
                    Err(e) => self.report_dropped(e),
                }
                Ok(())
            }
            NbpMessage::All(kpis) => {
                match validate_kpis(PacketType::All, &kpis) {
                    Ok(()) => self.coalescer.offer_all(kpis, timestamp),
                    Err(e) => self.report_dropped(e),
                }
                Ok(())
            }
        }
    }

    /// METADATA ignora o limitador e não conta como emissão.
    fn send_metadata(&mut self, meta: DeviceMetadata) -> Result<(), DispatchError> {
        match encode_metadata(&meta) {
            Ok(bytes) => {
                self.write_with_retry(&bytes)?;
                debug!("METADATA enviado: {}", meta.name);
                self.summary.metadata_sent += 1;
                self.last_metadata = Some(meta);
            }
            Err(e) => self.report_dropped(e),
        }
        Ok(())
    }

    fn flush_if_ready(&mut self) -> Result<(), DispatchError> {
        let Some(packet) = self.coalescer.take(Instant::now()) else {
            return Ok(());
        };
        match encode_kpis(packet.packet_type, &packet.kpis, packet.timestamp) {
            Ok(bytes) => {
                self.write_with_retry(&bytes)?;
                self.coalescer.mark_emitted(Instant::now());
                self.summary.packets_sent += 1;
                debug!(
                    "→ {} com {} KPIs ({} bytes)",
                    packet.packet_type,
                    packet.kpis.len(),
                    bytes.len()
                );
            }
            Err(e) => self.report_dropped(e),
        }
        Ok(())
    }

    fn poll_transport(&mut self) -> Result<(), DispatchError> {
        for request in self.transport.poll_requests() {
            match request {
                ClientRequest::All => self.coalescer.request_all(),
                ClientRequest::Connected => {
                    if let Some(meta) = self.last_metadata.clone() {
                        self.send_metadata(meta)?;
                    }
                    self.coalescer.request_all();
                }
            }
        }
        Ok(())
    }

    /// Escreve o pacote inteiro com backoff exponencial, retomando do
    /// primeiro byte ainda não aceito. Excedido `max_retries`, desiste.
    fn write_with_retry(&mut self, bytes: &[u8]) -> Result<(), DispatchError> {
        let mut backoff = self.config.initial_backoff;
        let mut failures = 0u32;
        let mut written = 0usize;
        loop {
            let attempt = if written < bytes.len() {
                match self.transport.write(&bytes[written..]) {
                    Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => {
                        written += n;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                }
            } else {
                self.transport.flush()
            };

            match attempt {
                Ok(()) => {
                    if failures > 0 {
                        info!("Escrita recuperada após {failures} falha(s)");
                    }
                    return Ok(());
                }
                Err(source) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(DispatchError::Disconnected {
                            attempts: failures,
                            source,
                        });
                    }
                    let err = DispatchError::Io(source);
                    self.record_error(&err);
                    self.summary.write_retries += 1;
                    debug!(
                        "Nova tentativa em {backoff:?} ({failures}/{}), {written}/{} bytes enviados",
                        self.config.max_retries,
                        bytes.len()
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    /// Drena a fila até o prazo e faz um último flush dentro da janela.
    fn shutdown(&mut self) -> Result<(), DispatchError> {
        let deadline = Instant::now() + self.config.shutdown_deadline;

        while Instant::now() < deadline {
            match self.queue.try_recv() {
                Some(envelope) => self.handle_envelope(envelope)?,
                None => break,
            }
        }
        if !self.queue.is_empty() {
            warn!("Prazo de shutdown esgotado, {} itens descartados", self.queue.len());
        }

        if self.coalescer.has_pending() {
            let at = self.coalescer.next_emission_at().unwrap_or_else(Instant::now);
            if at <= deadline {
                std::thread::sleep(at.saturating_duration_since(Instant::now()));
                self.flush_if_ready()?;
            } else {
                warn!("Prazo de shutdown insuficiente, KPIs pendentes descartados");
            }
        }

        if let Err(e) = self.transport.close() {
            warn!("Erro ao fechar transporte: {e}");
        }
        self.set_state(DispatcherState::Stopped);
        info!(
            "Dispatcher encerrado | {} pacotes, {} metadata, {} descartados",
            self.summary.packets_sent, self.summary.metadata_sent, self.summary.items_dropped
        );
        Ok(())
    }

    /// Transição terminal para `Disconnected`.
    fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.record_error(&err);
        if let Err(e) = self.transport.close() {
            debug!("Erro ao fechar transporte: {e}");
        }
        self.set_state(DispatcherState::Disconnected);
        err
    }

    fn report_dropped(&mut self, err: EncodingError) {
        self.summary.items_dropped += 1;
        self.record_error(&DispatchError::Encoding(err));
    }

    fn record_error(&self, err: &DispatchError) {
        self.observer.on_error(err);
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(err.to_string());
    }

    fn set_state(&self, state: DispatcherState) {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
